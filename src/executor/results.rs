// Per-host outcomes and their partition into contacted and dark hosts

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::value::boolean;

/// Outcome of running a task against one host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReturnData {
    pub host: String,
    /// Connection and result parsing succeeded
    pub comm_ok: bool,
    pub result: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Value>,
}

impl ReturnData {
    pub fn new(host: impl Into<String>, result: Map<String, Value>) -> Self {
        ReturnData {
            host: host.into(),
            comm_ok: true,
            result,
            diff: None,
        }
    }

    /// Build from a JSON value; anything but an object becomes a parse failure
    pub fn from_value(host: impl Into<String>, value: Value) -> Self {
        let result = match value {
            Value::Object(map) => map,
            other => parse_failure(&other.to_string()),
        };
        ReturnData::new(host, result)
    }

    /// Build from raw module stdout
    pub fn from_output(host: impl Into<String>, stdout: &str) -> Self {
        ReturnData::new(host, parse_json(stdout))
    }

    pub fn unreachable(host: impl Into<String>, msg: impl Into<String>) -> Self {
        let mut result = Map::new();
        result.insert("failed".into(), Value::Bool(true));
        result.insert("msg".into(), Value::String(msg.into()));
        ReturnData {
            host: host.into(),
            comm_ok: false,
            result,
            diff: None,
        }
    }

    pub fn with_diff(mut self, diff: Option<Value>) -> Self {
        self.diff = diff;
        self
    }

    pub fn communicated_ok(&self) -> bool {
        self.comm_ok
    }

    /// Reached, not failed, and either `failed_when_result` is false or the
    /// return code is zero
    pub fn is_successful(&self) -> bool {
        if !self.comm_ok {
            return false;
        }
        if self.result.get("failed").map(boolean).unwrap_or(false) {
            return false;
        }
        match self.result.get("failed_when_result") {
            Some(v) => !boolean(v),
            None => self.rc().map(|rc| rc == 0).unwrap_or(true),
        }
    }

    pub fn rc(&self) -> Option<i64> {
        self.result.get("rc").and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn changed(&self) -> bool {
        self.result.get("changed").map(boolean).unwrap_or(false)
    }

    pub fn msg(&self) -> Option<&str> {
        self.result.get("msg").and_then(Value::as_str)
    }
}

fn parse_failure(raw: &str) -> Map<String, Value> {
    match json!({"failed": true, "parsed": false, "msg": raw}) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Drop lines before the first one starting with `{` or `[`
pub fn filter_leading_non_json_lines(buf: &str) -> String {
    let mut out = String::new();
    let mut started = false;
    for line in buf.lines() {
        if started || line.starts_with('{') || line.starts_with('[') {
            started = true;
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Parse module output into a result mapping.
///
/// Output that is not a JSON object yields
/// `{failed: true, parsed: false, msg: <raw>}`.
pub fn parse_json(raw: &str) -> Map<String, Value> {
    let data = filter_leading_non_json_lines(raw);
    match serde_json::from_str::<Value>(&data) {
        Ok(Value::Object(map)) => map,
        _ => parse_failure(raw),
    }
}

/// Hosts split by whether they were reached
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResults {
    pub contacted: IndexMap<String, Map<String, Value>>,
    pub dark: IndexMap<String, Map<String, Value>>,
}

impl RunResults {
    pub fn len(&self) -> usize {
        self.contacted.len() + self.dark.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacted.is_empty() && self.dark.is_empty()
    }

    pub fn get(&self, host: &str) -> Option<&Map<String, Value>> {
        self.contacted.get(host).or_else(|| self.dark.get(host))
    }
}

/// Partition results; targeted hosts with no result are forced dark
pub fn partition(results: Vec<ReturnData>, targeted: &[String]) -> RunResults {
    let mut out = RunResults::default();

    for rd in results {
        if rd.comm_ok {
            out.dark.shift_remove(&rd.host);
            out.contacted.insert(rd.host, rd.result);
        } else {
            out.contacted.shift_remove(&rd.host);
            out.dark.insert(rd.host, rd.result);
        }
    }

    for host in targeted {
        if !out.contacted.contains_key(host) && !out.dark.contains_key(host) {
            out.dark.insert(host.clone(), Map::new());
        }
    }

    out
}
