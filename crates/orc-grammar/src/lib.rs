//! `format`/`jq` expression support for CLI pipeline stages.
//!
//! Two independent pieces live here:
//! - [`format_template`]: `{path}` string interpolation.
//! - [`rewrite_props`] + [`eval_jq`]: the `jq` stage's property-path rewrite
//!   followed by delegation to a real JSON query engine.

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, Native, RcIter};
use jaq_json::Val;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("jq expression failed to parse: {0}")]
    Parse(String),
    #[error("jq expression failed to compile: {0}")]
    Compile(String),
    #[error("jq expression raised an error: {0}")]
    Eval(String),
}

/// Interpolates `{path}` placeholders in `template` against `value`.
///
/// `{{` and `}}` render as literal braces. A dotted/indexed path
/// (`a.b.c`, `a.b[3].c`) that does not resolve renders as the literal
/// string `null`, matching the behaviour of a missing property.
pub fn format_template(template: &str, value: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut path = String::new();
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                    path.push(inner);
                }
                out.push_str(&render_lookup(value, path.trim()));
            }
            other => out.push(other),
        }
    }
    out
}

fn render_lookup(value: &Value, path: &str) -> String {
    match lookup_path(value, path) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

/// Resolves a dotted path with optional `[index]` segments, e.g.
/// `a.b[3].c` or `/metadata.node_id` (a leading `/` is stripped, matching
/// the "absolute path" notation used by `jq`).
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut current = value;
    for segment in split_path(path) {
        current = match segment {
            PathSegment::Field(name) => current.get(name)?,
            PathSegment::Index(i) => current.get(i)?,
        };
    }
    Some(current)
}

enum PathSegment<'a> {
    Field(&'a str),
    Index(usize),
}

fn split_path(path: &str) -> Vec<PathSegment<'_>> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        if dotted.is_empty() {
            continue;
        }
        let mut rest = dotted;
        if let Some(bracket) = rest.find('[') {
            let field = &rest[..bracket];
            if !field.is_empty() {
                segments.push(PathSegment::Field(field));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else { break };
                if let Ok(idx) = stripped[..close].parse::<usize>() {
                    segments.push(PathSegment::Index(idx));
                }
                rest = &stripped[close + 1..];
            }
        } else {
            segments.push(PathSegment::Field(rest));
        }
    }
    segments
}

/// Rewrites bare relative property paths (`.a`, `.a.b[0]`) into
/// `.<section>.a` so that a `jq` expression written against "the current
/// object" implicitly addresses the active section (e.g. `reported`).
///
/// - Paths already written in absolute form (`./reported`, `./metadata.x`)
///   have their leading `./` collapsed to `.` and are left untouched.
/// - Object-construction fields (`{a:.a, b:.b}`) have each bare path
///   rewritten individually.
/// - Rewriting only applies to the first top-level pipe stage (before the
///   first `|` that isn't nested inside `()`/`{}`/`[]`).
pub fn rewrite_props(expr: &str, section: Option<&str>) -> String {
    let Some(section) = section else {
        return expr.to_string();
    };
    let Some(pipe_at) = first_top_level_pipe(expr) else {
        return rewrite_segment(expr, section);
    };
    let (head, tail) = expr.split_at(pipe_at);
    format!("{}{}", rewrite_segment(head, section), tail)
}

fn first_top_level_pipe(expr: &str) -> Option<usize> {
    let mut depth = 0i32;
    let bytes = expr.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => depth -= 1,
            b'|' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn rewrite_segment(segment: &str, section: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = String::with_capacity(segment.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '.' && starts_relative_path(bytes, i) {
            if bytes[i + 1] == b'/' {
                // Absolute path: `./reported` -> `.reported`.
                out.push('.');
                i += 2;
            } else {
                out.push('.');
                out.push_str(section);
                out.push('.');
                i += 1;
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// A `.` starts a rewritable path reference when not preceded by an
/// identifier character (so `1.5` and `a.b`'s trailing dots aren't
/// mistaken for a fresh path start) and is followed by a path or `/`.
fn starts_relative_path(bytes: &[u8], i: usize) -> bool {
    let preceded_by_ident = i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_' || bytes[i - 1] == b']');
    if preceded_by_ident {
        return false;
    }
    matches!(bytes.get(i + 1), Some(c) if *c == b'/' || c.is_ascii_alphabetic() || *c == b'_')
}

/// Evaluates a jq expression against `value`, returning every yielded
/// output in order.
pub fn eval_jq(expr: &str, value: Value) -> Result<Vec<Value>, GrammarError> {
    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let modules = loader
        .load(&arena, File { path: (), code: expr })
        .map_err(|e| GrammarError::Parse(format!("{e:?}")))?;
    let filter = Compiler::<_, Native<_>>::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|e| GrammarError::Compile(format!("{e:?}")))?;

    let inputs = RcIter::new(core::iter::empty());
    let ctx = Ctx::new([], &inputs);
    let out = filter.run((ctx, Val::from(value)));

    out.map(|result| result.map(Value::from).map_err(|e| GrammarError::Eval(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_interpolates_names_and_paths() {
        let value = json!({"a": "b", "b": {"c": "d"}});
        assert_eq!(format_template("a:{a} b:{b.c} na:{fuerty}", &value), "a:b b:d na:null");
    }

    #[test]
    fn format_renders_scalars_by_type() {
        let value = json!({"a": "a", "b": true, "c": false, "d": null, "e": 12, "f": 1.234});
        assert_eq!(
            format_template("{a}:{b}:{c}:{d}:{e}:{f}", &value),
            "a:true:false:null:12:1.234"
        );
    }

    #[test]
    fn format_resolves_nested_arrays() {
        let value = json!({"a": {"b": {"c": {"d": [0, 1, 2, {"e": "f"}]}}}});
        assert_eq!(format_template("will be an >{a.b.c.d[3].e}<", &value), "will be an >f<");
    }

    #[test]
    fn format_missing_path_is_null() {
        let value = json!({});
        assert_eq!(format_template("{a}:{b.c.d}:{foo.bla[23].test}", &value), "null:null:null");
    }

    #[test]
    fn format_keeps_literal_braces_around_real_lookups() {
        let value = json!({"some_string": "hello", "some_int": 0, "node_id": "sub_root"});
        assert_eq!(
            format_template("{{aa}} {some_string} test}} {some_int} {node_id} {{", &value),
            "{aa} hello test} 0 sub_root {"
        );
    }

    #[test]
    fn rewrite_relative_paths_into_section() {
        assert_eq!(rewrite_props(".a,.b", Some("reported")), ".reported.a,.reported.b");
    }

    #[test]
    fn rewrite_leaves_absolute_paths_intact() {
        assert_eq!(rewrite_props("./reported", Some("reported")), ".reported");
    }

    #[test]
    fn rewrite_handles_object_construction() {
        assert_eq!(
            rewrite_props("{a:.a, b:.b}", Some("reported")),
            "{a:.reported.a, b:.reported.b}"
        );
    }

    #[test]
    fn rewrite_stops_after_first_top_level_pipe() {
        assert_eq!(
            rewrite_props("map(.color) | {a:.a, b:.b}", Some("reported")),
            "map(.reported.color) | {a:.a, b:.b}"
        );
    }

    #[test]
    fn rewrite_handles_deep_paths() {
        assert_eq!(
            rewrite_props(".pod_status.container_statuses[].image_id", Some("reported")),
            ".reported.pod_status.container_statuses[].image_id"
        );
    }

    #[test]
    fn rewrite_without_section_is_a_no_op() {
        assert_eq!(rewrite_props(".a.b", None), ".a.b");
    }

    #[test]
    fn eval_simple_path() {
        let result = eval_jq(".a.b", json!({"a": {"b": 1}})).unwrap();
        assert_eq!(result, vec![json!(1)]);
    }

    #[test]
    fn eval_with_rewrite_resolves_through_section() {
        let expr = rewrite_props("./reported", Some("reported"));
        let result = eval_jq(&expr, json!({"id": "123", "reported": {"b": 1}})).unwrap();
        assert_eq!(result, vec![json!({"b": 1})]);
    }

    #[test]
    fn eval_propagates_kind_through_rewrite() {
        let expr = rewrite_props(".kind", Some("reported"));
        let result = eval_jq(&expr, json!({"reported": {"kind": "foo"}})).unwrap();
        assert_eq!(result, vec![json!("foo")]);
    }
}
