// Module argument string handling: quote/template-aware splitting, k=v
// parsing, parameter counting and omit filtering

use serde_json::{Map, Value};

use crate::output::errors::RunnerError;
use crate::value::VarMap;

/// Parameters the `command`/`shell` modules accept as k=v; everything else
/// on their line is the command itself
const SHELL_PARAMS: &[&str] = &["creates", "removes", "chdir", "executable"];

/// Net change in block depth contributed by one token
fn block_depth(token: &str, depth: usize, open: &str, close: &str) -> usize {
    let opened = token.matches(open).count();
    let closed = token.matches(close).count();
    if opened == closed {
        return depth;
    }
    (depth + opened).saturating_sub(closed)
}

/// Track which quote character (if any) is still open after `token`
fn quote_state(token: &str, mut quote: Option<char>) -> Option<char> {
    let mut prev: Option<char> = None;
    for c in token.chars() {
        if (c == '"' || c == '\'') && prev != Some('\\') {
            match quote {
                Some(q) if q == c => quote = None,
                Some(_) => {}
                None => quote = Some(c),
            }
        }
        prev = Some(c);
    }
    quote
}

#[derive(Default)]
struct Depths {
    print: usize,
    block: usize,
    comment: usize,
}

impl Depths {
    fn open(&self) -> bool {
        self.print > 0 || self.block > 0 || self.comment > 0
    }
}

/// Split an argument string on whitespace, keeping quoted sections and
/// `{{ }}`, `{% %}`, `{# #}` blocks intact. Quotes are preserved in the
/// returned tokens.
pub fn split_args(args: &str) -> Result<Vec<String>, RunnerError> {
    let mut params: Vec<String> = Vec::new();
    let lines: Vec<&str> = args.trim().split('\n').collect();

    let mut quote: Option<char> = None;
    let mut depths = Depths::default();

    for (line_idx, line) in lines.iter().enumerate() {
        let tokens: Vec<&str> = line.trim().split(' ').collect();
        let mut continuation = false;

        for (idx, token) in tokens.iter().enumerate() {
            if *token == "\\" && quote.is_none() {
                continuation = true;
                continue;
            }

            let was_quoted = quote.is_some();
            quote = quote_state(token, quote);
            let quoted = quote.is_some();
            let mut appended = false;

            if quoted && !was_quoted && !depths.open() {
                params.push(token.to_string());
                appended = true;
            } else if depths.open() || quoted || was_quoted {
                if let Some(last) = params.last_mut() {
                    if idx == 0 && !quoted && was_quoted {
                        last.push_str(token);
                    } else if tokens.len() > 1 {
                        if idx > 0 {
                            last.push(' ');
                        }
                        last.push_str(token);
                    } else {
                        last.push('\n');
                        last.push_str(token);
                    }
                    appended = true;
                }
            }

            for (depth, open, close) in [
                (&mut depths.print, "{{", "}}"),
                (&mut depths.block, "{%", "%}"),
                (&mut depths.comment, "{#", "#}"),
            ] {
                let before = *depth;
                *depth = block_depth(token, before, open, close);
                if *depth != before && !appended {
                    params.push(token.to_string());
                    appended = true;
                }
            }

            if !depths.open() && !quoted && !appended && !token.is_empty() {
                params.push(token.to_string());
            }
        }

        // Newlines inside a quoted or templated section are kept
        if lines.len() > 1 && line_idx != lines.len() - 1 && !continuation {
            if let Some(last) = params.last_mut() {
                if !last.ends_with('\n') || line.is_empty() {
                    last.push('\n');
                }
            }
        }
    }

    if depths.open() || quote.is_some() {
        return Err(RunnerError::ArgumentSyntax(args.to_string()));
    }

    Ok(params)
}

/// True when `data` is wrapped in matching single or double quotes
pub fn is_quoted(data: &str) -> bool {
    data.len() > 1
        && (data.starts_with('"') && data.ends_with('"')
            || data.starts_with('\'') && data.ends_with('\''))
}

/// Strip one level of surrounding quotes
pub fn unquote(data: &str) -> &str {
    if is_quoted(data) {
        &data[1..data.len() - 1]
    } else {
        data
    }
}

/// Parse `k=v` pairs; tokens without `=` are ignored
pub fn parse_kv(args: &str) -> Result<VarMap, RunnerError> {
    let mut options = VarMap::new();
    for token in split_args(args)? {
        if let Some((k, v)) = token.split_once('=') {
            options.insert(
                k.trim().to_string(),
                Value::String(unquote(v.trim()).to_string()),
            );
        }
    }
    Ok(options)
}

/// Count distinct `k=v` parameters the way the module will see them.
///
/// Quoted tokens never count. For `command`/`shell` only their own
/// parameters count, since the rest of the line is the command.
pub fn count_module_args(
    module_name: &str,
    args: &str,
    allow_dupes: bool,
) -> Result<usize, RunnerError> {
    let is_shell_module = matches!(module_name, "command" | "shell");
    let mut seen: Vec<String> = Vec::new();

    for token in split_args(args)? {
        if is_quoted(&token) {
            continue;
        }
        let Some((key, _)) = token.split_once('=') else {
            continue;
        };
        let is_shell_param = SHELL_PARAMS.contains(&key);

        if seen.iter().any(|k| k == key) {
            if !allow_dupes && (!is_shell_module || is_shell_param) {
                return Err(RunnerError::DuplicateArgument(key.to_string()));
            }
            continue;
        }
        if !is_shell_module || is_shell_param {
            seen.push(key.to_string());
        }
    }

    Ok(seen.len())
}

/// Drop every `k=v` whose unquoted value is the omit token, leaving the
/// quoting of the remaining tokens alone
pub fn filter_omitted_args(args: &str, omit: &str) -> Result<String, RunnerError> {
    let kept: Vec<String> = split_args(args)?
        .into_iter()
        .filter(|token| match token.split_once('=') {
            Some((_, v)) => unquote(v) != omit,
            None => true,
        })
        .collect();
    Ok(kept.join(" "))
}

/// Drop complex arguments whose value is the omit token
pub fn filter_omitted_complex(complex: &Map<String, Value>, omit: &str) -> Map<String, Value> {
    complex
        .iter()
        .filter(|(_, v)| v.as_str() != Some(omit))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_split_keeps_quotes_and_blocks() {
        assert_eq!(
            split_args(r#"a=b c="foo bar" d='x y z'"#).unwrap(),
            vec!["a=b", r#"c="foo bar""#, "d='x y z'"]
        );
        assert_eq!(
            split_args("msg={{ greeting | default('hi there') }} x=1").unwrap(),
            vec!["msg={{ greeting | default('hi there') }}", "x=1"]
        );
        assert_eq!(split_args("  ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_split_multiline_quoted() {
        let tokens = split_args("content=\"line one\nline two\" dest=/tmp/x").unwrap();
        assert_eq!(tokens, vec!["content=\"line one\nline two\"", "dest=/tmp/x"]);
    }

    #[test]
    fn test_split_unbalanced_is_error() {
        assert!(matches!(
            split_args(r#"a="unterminated"#),
            Err(RunnerError::ArgumentSyntax(_))
        ));
        assert!(matches!(
            split_args("a={{ foo"),
            Err(RunnerError::ArgumentSyntax(_))
        ));
    }

    #[test]
    fn test_parse_kv_unquotes() {
        let kv = parse_kv(r#"src=/a dest="/b c" free"#).unwrap();
        assert_eq!(kv.len(), 2);
        assert_eq!(kv["src"], json!("/a"));
        assert_eq!(kv["dest"], json!("/b c"));
    }

    #[test]
    fn test_count_args() {
        assert_eq!(count_module_args("copy", "src=a dest=b", false).unwrap(), 2);
        assert_eq!(
            count_module_args("copy", r#"src=a "dest=b""#, false).unwrap(),
            1
        );
        assert_eq!(
            count_module_args("command", "echo a=b chdir=/tmp", false).unwrap(),
            1
        );
        assert_eq!(
            count_module_args("command", "echo a=b a=c", false).unwrap(),
            0
        );
    }

    #[test]
    fn test_count_args_duplicates() {
        assert!(matches!(
            count_module_args("copy", "src=a src=b", false),
            Err(RunnerError::DuplicateArgument(k)) if k == "src"
        ));
        assert_eq!(count_module_args("copy", "src=a src=b", true).unwrap(), 1);
    }

    #[test]
    fn test_filter_omitted() {
        let omit = "__omit_place_holder__abc";
        let args = format!("name=nginx state={} mode='{}' note=\"keep me\"", omit, omit);
        assert_eq!(
            filter_omitted_args(&args, omit).unwrap(),
            "name=nginx note=\"keep me\""
        );

        let complex = json!({"a": omit, "b": "x"});
        let filtered = filter_omitted_complex(complex.as_object().unwrap(), omit);
        assert_eq!(Value::Object(filtered), json!({"b": "x"}));
    }
}
