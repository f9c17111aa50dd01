// Terminal printer for ad-hoc runs

use std::sync::Arc;

use async_trait::async_trait;
use colored::*;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::diff::render_diff;
use crate::plugins::{ResultMap, RunnerCallbacks};
use crate::value::{is_truthy, to_plain_string};

/// Outcome label printed after the host name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Changed,
    Failed,
    Skipped,
    Unreachable,
}

impl Status {
    fn label(self) -> ColoredString {
        match self {
            Status::Success => "SUCCESS".green(),
            Status::Changed => "CHANGED".yellow(),
            Status::Failed => "FAILED".red().bold(),
            Status::Skipped => "SKIPPED".cyan(),
            Status::Unreachable => "UNREACHABLE!".red().bold(),
        }
    }
}

fn is_command_output(result: &Map<String, Value>) -> bool {
    result.contains_key("rc") && result.contains_key("stdout") && !result.contains_key("ansible_facts")
}

fn field<'a>(result: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    result.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Render one host result. Command-like results print their output
/// verbatim; everything else prints the JSON document.
pub fn format_result(host: &str, status: Status, result: &Map<String, Value>, one_line: bool) -> String {
    let head = format!("{} | {}", host.bold(), status.label());

    if is_command_output(result) {
        let rc = result.get("rc").map(to_plain_string).unwrap_or_default();
        let mut body = String::new();
        if let Some(stdout) = field(result, "stdout") {
            body.push_str(stdout);
        }
        if let Some(stderr) = field(result, "stderr") {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(stderr);
        }
        if let Some(msg) = field(result, "msg") {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(msg);
        }

        return if one_line {
            format!("{} | rc={} | (stdout) {}", head, rc, body.replace('\n', "\\n"))
        } else {
            format!("{} | rc={} >>\n{}", head, rc, body)
        };
    }

    let json = if one_line {
        serde_json::to_string(result)
    } else {
        serde_json::to_string_pretty(result)
    }
    .unwrap_or_default();
    format!("{} => {}", head, json)
}

fn colorize_diff(diff: &str) -> String {
    diff.lines()
        .map(|line| {
            if line.starts_with("---") || line.starts_with("+++") {
                line.bold().to_string()
            } else if line.starts_with("@@") {
                line.cyan().to_string()
            } else if line.starts_with('+') {
                line.green().to_string()
            } else if line.starts_with('-') {
                line.red().to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prints each host's outcome as `host | STATUS => {...}`
pub struct TerminalCallback {
    console: Arc<Mutex<()>>,
    one_line: bool,
}

impl TerminalCallback {
    /// `console` must be the lock of the run context the printer reports for
    pub fn new(console: Arc<Mutex<()>>, one_line: bool) -> Self {
        TerminalCallback { console, one_line }
    }

    fn print(&self, text: &str) {
        let _guard = self.console.lock();
        println!("{}", text);
    }

    fn eprint(&self, text: &str) {
        let _guard = self.console.lock();
        eprintln!("{}", text);
    }
}

#[async_trait]
impl RunnerCallbacks for TerminalCallback {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn on_ok(&self, host: &str, result: &ResultMap) {
        let changed = result.get("changed").map(is_truthy).unwrap_or(false);
        let status = if changed { Status::Changed } else { Status::Success };
        self.print(&format_result(host, status, result, self.one_line));
    }

    async fn on_failed(&self, host: &str, result: &ResultMap, ignore_errors: bool) {
        let mut text = format_result(host, Status::Failed, result, self.one_line);
        if ignore_errors {
            text.push_str(&format!("\n{}", "...ignoring".cyan()));
        }
        self.eprint(&text);
    }

    async fn on_skipped(&self, host: &str, item: Option<&Value>) {
        let text = match item {
            Some(item) => format!("{} | {} => (item={})", host.bold(), Status::Skipped.label(), to_plain_string(item)),
            None => format!("{} | {}", host.bold(), Status::Skipped.label()),
        };
        self.print(&text);
    }

    async fn on_unreachable(&self, host: &str, result: &Value) {
        let map = match result {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("msg".into(), Value::String(to_plain_string(other)));
                map
            }
        };
        self.eprint(&format_result(host, Status::Unreachable, &map, self.one_line));
    }

    async fn on_no_hosts(&self) {
        self.eprint(&"No hosts matched".yellow().to_string());
    }

    async fn on_file_diff(&self, _host: &str, diff: &Value) {
        if let Some(rendered) = render_diff(diff) {
            self.print(&colorize_diff(&rendered));
        }
    }

    async fn on_async_poll(&self, host: &str, _result: &ResultMap, jid: &str, clock: i64) {
        self.print(&format!("<job {}> polling on {}, {}s remaining", jid, host, clock));
    }

    async fn on_async_ok(&self, host: &str, result: &ResultMap, jid: &str) {
        self.print(&format!(
            "<job {}> {}",
            jid,
            format_result(host, Status::Success, result, self.one_line)
        ));
    }

    async fn on_async_failed(&self, host: &str, result: &ResultMap, jid: &str) {
        self.eprint(&format!(
            "<job {}> {}",
            jid,
            format_result(host, Status::Failed, result, self.one_line)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_json_result() {
        colored::control::set_override(false);
        let text = format_result("web1", Status::Success, &map(json!({"ping": "pong"})), true);
        assert_eq!(text, r#"web1 | SUCCESS => {"ping":"pong"}"#);
    }

    #[test]
    fn test_command_result() {
        colored::control::set_override(false);
        let result = map(json!({"rc": 0, "stdout": "a\nb", "stderr": "", "changed": true}));
        assert_eq!(
            format_result("web1", Status::Changed, &result, false),
            "web1 | CHANGED | rc=0 >>\na\nb"
        );
        assert_eq!(
            format_result("web1", Status::Changed, &result, true),
            "web1 | CHANGED | rc=0 | (stdout) a\\nb"
        );
    }

    #[test]
    fn test_colorize_diff_keeps_lines() {
        colored::control::set_override(false);
        let diff = "--- before\n+++ after\n@@ -1 +1 @@\n-a\n+b";
        assert_eq!(colorize_diff(diff), diff);
    }
}
