//! Splits a command line into pipelines (`;`-separated) and pipelines into
//! stages (`|`-separated), then tokenizes each stage with shell-like
//! quoting.

use orc_shared::{TaskerError, TaskerResult};

/// One `name arg arg …` stage invocation, not yet resolved against the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTokens {
    pub name: String,
    pub args: Vec<String>,
}

/// Splits `line` on top-level `;` into independent pipelines, each split
/// on top-level `|` into stage token lists. `;` and `|` inside a quoted
/// string are literal.
pub fn split_pipelines(line: &str) -> TaskerResult<Vec<Vec<StageTokens>>> {
    split_top_level(line, ';')
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| split_pipeline(&p))
        .collect()
}

fn split_pipeline(pipeline: &str) -> TaskerResult<Vec<StageTokens>> {
    split_top_level(pipeline, '|')
        .into_iter()
        .map(|stage| tokenize(stage.trim()))
        .map(|tokens| {
            let tokens = tokens?;
            let Some((name, args)) = tokens.split_first() else {
                return Err(TaskerError::ParseError("empty pipeline stage".into()));
            };
            Ok(StageTokens {
                name: name.clone(),
                args: args.to_vec(),
            })
        })
        .collect()
}

fn split_top_level(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let chars = s.chars();

    for c in chars {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == delim => {
                parts.push(std::mem::take(&mut current));
            }
            None => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Tokenizes a single stage's text, honoring `"…"` quoting (preserves
/// internal spaces; `\"` escapes a literal quote).
pub fn tokenize(text: &str) -> TaskerResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && chars.peek() == Some(&q) {
                    current.push(chars.next().unwrap());
                } else if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(TaskerError::ParseError(format!("unterminated quote in '{text}'")));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_preserves_quoted_spaces() {
        let tokens = tokenize(r#"echo "this is a string""#).unwrap();
        assert_eq!(tokens, vec!["echo", "this is a string"]);
    }

    #[test]
    fn tokenize_empty_arg_yields_single_token() {
        let tokens = tokenize("echo").unwrap();
        assert_eq!(tokens, vec!["echo"]);
    }

    #[test]
    fn split_pipelines_respects_quoting() {
        let pipelines = split_pipelines(r#"echo "a;b|c" | format {a}"#).unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].len(), 2);
        assert_eq!(pipelines[0][0].args, vec!["a;b|c"]);
        assert_eq!(pipelines[0][1].name, "format");
    }

    #[test]
    fn split_pipelines_handles_multiple_statements() {
        let pipelines = split_pipelines("json [1,2,3]; json [4,5,6]").unwrap();
        assert_eq!(pipelines.len(), 2);
    }

    #[test]
    fn unterminated_quote_is_a_parse_error() {
        assert!(tokenize(r#"echo "oops"#).is_err());
    }
}
