// File diffs: the `diff` value attached to results and its unified rendering

use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};

/// Build the diff value attached to a result: both sides plus their labels
pub fn file_diff(before: &str, after: &str, before_header: &str, after_header: &str) -> Value {
    json!({
        "before_header": before_header,
        "after_header": after_header,
        "before": before,
        "after": after,
    })
}

/// Render a diff value as a unified diff; `None` when both sides match
/// or the value is not a file diff
pub fn render_diff(diff: &Value) -> Option<String> {
    let before = diff.get("before")?.as_str()?;
    let after = diff.get("after")?.as_str()?;
    if before == after {
        return None;
    }
    let before_header = diff.get("before_header").and_then(Value::as_str).unwrap_or("before");
    let after_header = diff.get("after_header").and_then(Value::as_str).unwrap_or("after");
    Some(generate_unified_diff(before, after, before_header, after_header))
}

/// Unified diff with three lines of context
pub fn generate_unified_diff(old_content: &str, new_content: &str, old_label: &str, new_label: &str) -> String {
    let diff = TextDiff::from_lines(old_content, new_content);

    let mut output = format!("--- {}\n+++ {}\n", old_label, new_label);
    for group in diff.grouped_ops(3) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_start = first.old_range().start;
        let new_start = first.new_range().start;
        let old_len = last.old_range().end - old_start;
        let new_len = last.new_range().end - new_start;
        output.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start + 1,
            old_len,
            new_start + 1,
            new_len
        ));

        for op in &group {
            for change in diff.iter_changes(op) {
                let sign = match change.tag() {
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                    ChangeTag::Equal => ' ',
                };
                output.push(sign);
                output.push_str(change.value());
                if change.missing_newline() {
                    output.push('\n');
                }
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unified_diff() {
        let old = "line 1\nline 2\nline 3\n";
        let new = "line 1\nline 2 modified\nline 3\n";

        let diff = generate_unified_diff(old, new, "old.txt", "new.txt");

        assert_eq!(
            diff,
            "--- old.txt\n+++ new.txt\n@@ -1,3 +1,3 @@\n line 1\n-line 2\n+line 2 modified\n line 3\n"
        );
    }

    #[test]
    fn test_render_skips_identical_sides() {
        assert!(render_diff(&file_diff("same\n", "same\n", "a", "b")).is_none());
        assert!(render_diff(&json!({"prepared": "x"})).is_none());

        let rendered = render_diff(&file_diff("", "new\n", "dest", "source")).unwrap();
        assert!(rendered.starts_with("--- dest\n+++ source\n"));
        assert!(rendered.contains("+new"));
    }
}
