// Callback plugin system for per-host run events

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Result mapping handed to callbacks
pub type ResultMap = Map<String, Value>;

/// Hooks invoked by the engine as hosts finish; every method defaults to a no-op
#[async_trait]
pub trait RunnerCallbacks: Send + Sync {
    /// Get the name of this plugin
    fn name(&self) -> &str;

    async fn on_ok(&self, _host: &str, _result: &ResultMap) {}
    async fn on_failed(&self, _host: &str, _result: &ResultMap, _ignore_errors: bool) {}
    async fn on_skipped(&self, _host: &str, _item: Option<&Value>) {}
    async fn on_unreachable(&self, _host: &str, _result: &Value) {}
    async fn on_no_hosts(&self) {}
    async fn on_file_diff(&self, _host: &str, _diff: &Value) {}

    async fn on_async_poll(&self, _host: &str, _result: &ResultMap, _jid: &str, _clock: i64) {}
    async fn on_async_ok(&self, _host: &str, _result: &ResultMap, _jid: &str) {}
    async fn on_async_failed(&self, _host: &str, _result: &ResultMap, _jid: &str) {}
}

/// Manager for callback plugins
#[derive(Clone, Default)]
pub struct CallbackManager {
    plugins: Vec<Arc<dyn RunnerCallbacks>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback plugin
    pub fn add(&mut self, plugin: Arc<dyn RunnerCallbacks>) {
        self.plugins.push(plugin);
    }

    pub fn with(mut self, plugin: Arc<dyn RunnerCallbacks>) -> Self {
        self.add(plugin);
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn on_ok(&self, host: &str, result: &ResultMap) {
        for plugin in &self.plugins {
            plugin.on_ok(host, result).await;
        }
    }

    pub async fn on_failed(&self, host: &str, result: &ResultMap, ignore_errors: bool) {
        for plugin in &self.plugins {
            plugin.on_failed(host, result, ignore_errors).await;
        }
    }

    pub async fn on_skipped(&self, host: &str, item: Option<&Value>) {
        for plugin in &self.plugins {
            plugin.on_skipped(host, item).await;
        }
    }

    pub async fn on_unreachable(&self, host: &str, result: &Value) {
        for plugin in &self.plugins {
            plugin.on_unreachable(host, result).await;
        }
    }

    pub async fn on_no_hosts(&self) {
        for plugin in &self.plugins {
            plugin.on_no_hosts().await;
        }
    }

    pub async fn on_file_diff(&self, host: &str, diff: &Value) {
        for plugin in &self.plugins {
            plugin.on_file_diff(host, diff).await;
        }
    }

    pub async fn on_async_poll(&self, host: &str, result: &ResultMap, jid: &str, clock: i64) {
        for plugin in &self.plugins {
            plugin.on_async_poll(host, result, jid, clock).await;
        }
    }

    pub async fn on_async_ok(&self, host: &str, result: &ResultMap, jid: &str) {
        for plugin in &self.plugins {
            plugin.on_async_ok(host, result, jid).await;
        }
    }

    pub async fn on_async_failed(&self, host: &str, result: &ResultMap, jid: &str) {
        for plugin in &self.plugins {
            plugin.on_async_failed(host, result, jid).await;
        }
    }
}

// ========== Built-in Plugins ==========

/// JSON log callback - appends one JSON event per line
pub struct JsonLogCallback {
    file: Arc<Mutex<File>>,
}

impl JsonLogCallback {
    /// Create a new JSON log callback that writes to the specified file
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(JsonLogCallback {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn write_event(&self, mut event: Value) {
        if let Some(obj) = event.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        let mut file = self.file.lock();
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }
}

#[async_trait]
impl RunnerCallbacks for JsonLogCallback {
    fn name(&self) -> &str {
        "json_log"
    }

    async fn on_ok(&self, host: &str, result: &ResultMap) {
        self.write_event(json!({"event": "ok", "host": host, "result": result}));
    }

    async fn on_failed(&self, host: &str, result: &ResultMap, ignore_errors: bool) {
        self.write_event(json!({
            "event": "failed",
            "host": host,
            "result": result,
            "ignore_errors": ignore_errors,
        }));
    }

    async fn on_skipped(&self, host: &str, item: Option<&Value>) {
        self.write_event(json!({"event": "skipped", "host": host, "item": item}));
    }

    async fn on_unreachable(&self, host: &str, result: &Value) {
        self.write_event(json!({"event": "unreachable", "host": host, "result": result}));
    }

    async fn on_no_hosts(&self) {
        self.write_event(json!({"event": "no_hosts"}));
    }

    async fn on_async_ok(&self, host: &str, result: &ResultMap, jid: &str) {
        self.write_event(json!({"event": "async_ok", "host": host, "jid": jid, "result": result}));
    }

    async fn on_async_failed(&self, host: &str, result: &ResultMap, jid: &str) {
        self.write_event(json!({
            "event": "async_failed",
            "host": host,
            "jid": jid,
            "result": result,
        }));
    }
}

/// Per-host counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub ok: usize,
    pub changed: usize,
    pub failures: usize,
    pub dark: usize,
    pub skipped: usize,
}

/// Aggregate run statistics collected from callbacks
#[derive(Debug, Default)]
pub struct AggregateStats {
    hosts: Mutex<BTreeMap<String, HostStats>>,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, host: &str, f: impl FnOnce(&mut HostStats)) {
        let mut hosts = self.hosts.lock();
        f(hosts.entry(host.to_string()).or_default());
    }

    fn record_result(&self, host: &str, result: &ResultMap) {
        let changed = result.get("changed").and_then(Value::as_bool).unwrap_or(false);
        self.bump(host, |s| {
            s.ok += 1;
            if changed {
                s.changed += 1;
            }
        });
    }

    /// Snapshot of one host's counters
    pub fn summarize(&self, host: &str) -> HostStats {
        self.hosts.lock().get(host).cloned().unwrap_or_default()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().keys().cloned().collect()
    }

    /// True when any host failed or was unreachable
    pub fn has_failures(&self) -> bool {
        self.hosts
            .lock()
            .values()
            .any(|s| s.failures > 0 || s.dark > 0)
    }
}

#[async_trait]
impl RunnerCallbacks for AggregateStats {
    fn name(&self) -> &str {
        "stats"
    }

    async fn on_ok(&self, host: &str, result: &ResultMap) {
        self.record_result(host, result);
    }

    async fn on_failed(&self, host: &str, result: &ResultMap, ignore_errors: bool) {
        if ignore_errors {
            self.record_result(host, result);
        } else {
            self.bump(host, |s| s.failures += 1);
        }
    }

    async fn on_skipped(&self, host: &str, _item: Option<&Value>) {
        self.bump(host, |s| s.skipped += 1);
    }

    async fn on_unreachable(&self, host: &str, _result: &Value) {
        self.bump(host, |s| s.dark += 1);
    }

    async fn on_async_ok(&self, host: &str, result: &ResultMap, _jid: &str) {
        self.record_result(host, result);
    }

    async fn on_async_failed(&self, host: &str, _result: &ResultMap, _jid: &str) {
        self.bump(host, |s| s.failures += 1);
    }
}

/// Test helper that records every event as `(event, host)`
#[cfg(test)]
#[derive(Default)]
pub struct RecordingCallback {
    pub events: Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl RecordingCallback {
    fn push(&self, event: &str, host: &str) {
        self.events.lock().push((event.to_string(), host.to_string()));
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|(e, _)| e == event).count()
    }
}

#[cfg(test)]
#[async_trait]
impl RunnerCallbacks for RecordingCallback {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_ok(&self, host: &str, _result: &ResultMap) {
        self.push("ok", host);
    }

    async fn on_failed(&self, host: &str, _result: &ResultMap, _ignore_errors: bool) {
        self.push("failed", host);
    }

    async fn on_skipped(&self, host: &str, _item: Option<&Value>) {
        self.push("skipped", host);
    }

    async fn on_unreachable(&self, host: &str, _result: &Value) {
        self.push("unreachable", host);
    }

    async fn on_no_hosts(&self) {
        self.push("no_hosts", "");
    }

    async fn on_file_diff(&self, host: &str, _diff: &Value) {
        self.push("diff", host);
    }

    async fn on_async_poll(&self, host: &str, _result: &ResultMap, _jid: &str, _clock: i64) {
        self.push("async_poll", host);
    }

    async fn on_async_ok(&self, host: &str, _result: &ResultMap, _jid: &str) {
        self.push("async_ok", host);
    }

    async fn on_async_failed(&self, host: &str, _result: &ResultMap, _jid: &str) {
        self.push("async_failed", host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn result(v: Value) -> ResultMap {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_stats_counts_ignored_failures_as_ok() {
        let stats = Arc::new(AggregateStats::new());
        let manager = CallbackManager::new().with(stats.clone());

        manager.on_ok("web1", &result(json!({"changed": true}))).await;
        manager
            .on_failed("web1", &result(json!({"failed": true})), true)
            .await;
        manager
            .on_failed("web2", &result(json!({"failed": true})), false)
            .await;
        manager.on_unreachable("web3", &json!({"msg": "down"})).await;
        manager.on_skipped("web1", None).await;

        assert_eq!(
            stats.summarize("web1"),
            HostStats {
                ok: 2,
                changed: 1,
                skipped: 1,
                ..Default::default()
            }
        );
        assert_eq!(stats.summarize("web2").failures, 1);
        assert_eq!(stats.summarize("web3").dark, 1);
        assert!(stats.has_failures());
    }

    #[tokio::test]
    async fn test_json_log_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = JsonLogCallback::new(&path).unwrap();

        log.on_ok("web1", &result(json!({"changed": false}))).await;
        log.on_no_hosts().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "ok");
        assert_eq!(lines[0]["host"], "web1");
        assert!(lines[1]["timestamp"].is_string());
    }
}
