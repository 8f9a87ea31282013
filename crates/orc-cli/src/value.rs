//! JSON value helpers shared by several stages: dot-path get/set and the
//! scalar-rendering rules used by `format`/`list`.

use serde_json::{Map, Value};

/// Resolves a dotted/indexed path (`a.b[3].c`) against `value`. A leading
/// `/` (the "absolute path" notation) is stripped before traversal.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (field, indices) = split_indices(segment);
        if !field.is_empty() {
            current = current.get(field)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate objects as needed. Used by
/// `set_desired`/`set_metadata`.
pub fn set_path(root: &mut Value, path: &str, new_value: Value) {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        let obj = current.as_object_mut().expect("caller ensures object chain");
        if segments.peek().is_none() {
            obj.insert(segment.to_string(), new_value);
            return;
        }
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
    }
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(bracket) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let field = &segment[..bracket];
    let mut rest = &segment[bracket..];
    let mut indices = Vec::new();
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else { break };
        if let Ok(idx) = stripped[..close].parse::<usize>() {
            indices.push(idx);
        }
        rest = &stripped[close + 1..];
    }
    (field, indices)
}

/// Renders a scalar the way `format`/`list` do: strings unquoted, other
/// JSON types via their canonical representation, missing ⇒ `"null"`.
pub fn render_scalar(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_path_resolves_nested_arrays() {
        let value = json!({"a": {"b": {"c": {"d": [0, 1, 2, {"e": "f"}]}}}});
        assert_eq!(get_path(&value, "a.b.c.d[3].e"), Some(&json!("f")));
    }

    #[test]
    fn get_path_strips_leading_slash() {
        let value = json!({"metadata": {"node_id": "sub_root"}});
        assert_eq!(get_path(&value, "/metadata.node_id"), Some(&json!("sub_root")));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut root = json!({});
        set_path(&mut root, "desired.clean", json!(true));
        assert_eq!(root, json!({"desired": {"clean": true}}));
    }

    #[test]
    fn render_scalar_matches_format_rules() {
        assert_eq!(render_scalar(Some(&json!(true))), "true");
        assert_eq!(render_scalar(Some(&json!(1.234))), "1.234");
        assert_eq!(render_scalar(None), "null");
        assert_eq!(render_scalar(Some(&Value::Null)), "null");
    }
}
