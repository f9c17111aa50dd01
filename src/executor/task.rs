// One unit of work to fan out across hosts

use serde_json::{json, Map, Value};

use crate::value::VarMap;
use crate::vars::{VarLayer, VarLayers};

/// A module invocation plus the task keywords that control it
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Host pattern resolved against inventory
    pub pattern: String,
    pub module_name: String,
    pub module_args: String,
    pub complex_args: Map<String, Value>,
    /// Statically configured variable layers (play, role, task vars, ...)
    pub layers: VarLayers,
    /// Templated into a mapping of remote environment variables
    pub environment: Option<Value>,
    /// `when` conditions; all must hold
    pub conditionals: Vec<String>,
    /// Items to loop over; a string is templated into a list
    pub loop_items: Option<Value>,
    pub until: Option<String>,
    /// Retry budget and delay; may be templated strings
    pub retries: Value,
    pub delay: Value,
    pub register: Option<String>,
    pub changed_when: Vec<String>,
    pub failed_when: Vec<String>,
    pub ignore_errors: bool,
    pub no_log: bool,
    pub delegate_to: Option<String>,
    pub run_once: bool,
    /// Seconds an asynchronous job may run; 0 runs in the foreground
    pub background: u64,
    pub check: bool,
    pub diff: bool,
    pub remote_user: Option<String>,
    pub remote_pass: Option<String>,
    pub remote_port: Option<u16>,
    pub transport: Option<String>,
    pub private_key_file: Option<String>,
    pub become_flag: bool,
    pub become_user: Option<String>,
    pub become_method: Option<String>,
    pub become_pass: Option<String>,
    pub become_exe: Option<String>,
    /// Explicit host list; skips pattern resolution
    pub run_hosts: Option<Vec<String>>,
    /// Nested invocation from another action; result callbacks are suppressed
    pub is_chained: bool,
}

impl Default for TaskSpec {
    fn default() -> Self {
        TaskSpec {
            pattern: "all".to_string(),
            module_name: "command".to_string(),
            module_args: String::new(),
            complex_args: Map::new(),
            layers: VarLayers::new(),
            environment: None,
            conditionals: Vec::new(),
            loop_items: None,
            until: None,
            retries: json!(3),
            delay: json!(5),
            register: None,
            changed_when: Vec::new(),
            failed_when: Vec::new(),
            ignore_errors: false,
            no_log: false,
            delegate_to: None,
            run_once: false,
            background: 0,
            check: false,
            diff: false,
            remote_user: None,
            remote_pass: None,
            remote_port: None,
            transport: None,
            private_key_file: None,
            become_flag: false,
            become_user: None,
            become_method: None,
            become_pass: None,
            become_exe: None,
            run_hosts: None,
            is_chained: false,
        }
    }
}

impl TaskSpec {
    pub fn new(module_name: impl Into<String>, module_args: impl Into<String>) -> Self {
        TaskSpec {
            module_name: module_name.into(),
            module_args: module_args.into(),
            ..Default::default()
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn complex_args(mut self, args: Map<String, Value>) -> Self {
        self.complex_args = args;
        self
    }

    pub fn layer(mut self, layer: VarLayer, vars: VarMap) -> Self {
        self.layers.set(layer, vars);
        self
    }

    pub fn environment(mut self, env: Value) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn when(mut self, cond: impl Into<String>) -> Self {
        self.conditionals.push(cond.into());
        self
    }

    pub fn with_items(mut self, items: Value) -> Self {
        self.loop_items = Some(items);
        self
    }

    pub fn until(
        mut self,
        cond: impl Into<String>,
        register: impl Into<String>,
        retries: Value,
        delay: Value,
    ) -> Self {
        self.until = Some(cond.into());
        self.register = Some(register.into());
        self.retries = retries;
        self.delay = delay;
        self
    }

    pub fn register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    pub fn changed_when(mut self, cond: impl Into<String>) -> Self {
        self.changed_when.push(cond.into());
        self
    }

    pub fn failed_when(mut self, cond: impl Into<String>) -> Self {
        self.failed_when.push(cond.into());
        self
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    pub fn no_log(mut self, no_log: bool) -> Self {
        self.no_log = no_log;
        self
    }

    pub fn delegate_to(mut self, host: impl Into<String>) -> Self {
        self.delegate_to = Some(host.into());
        self
    }

    pub fn run_once(mut self, once: bool) -> Self {
        self.run_once = once;
        self
    }

    pub fn background(mut self, seconds: u64) -> Self {
        self.background = seconds;
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn diff(mut self, diff: bool) -> Self {
        self.diff = diff;
        self
    }

    pub fn remote_user(mut self, user: impl Into<String>) -> Self {
        self.remote_user = Some(user.into());
        self
    }

    pub fn remote_pass(mut self, pass: Option<String>) -> Self {
        self.remote_pass = pass;
        self
    }

    pub fn transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn private_key_file(mut self, path: impl Into<String>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    /// Escalate to `user` (root when `None`)
    pub fn become_user(mut self, user: Option<String>) -> Self {
        self.become_flag = true;
        self.become_user = user;
        self
    }

    pub fn become_method(mut self, method: impl Into<String>) -> Self {
        self.become_method = Some(method.into());
        self
    }

    pub fn become_pass(mut self, pass: Option<String>) -> Self {
        self.become_pass = pass;
        self
    }

    pub fn run_hosts(mut self, hosts: Vec<String>) -> Self {
        self.run_hosts = Some(hosts);
        self
    }

    pub fn chained(mut self, chained: bool) -> Self {
        self.is_chained = chained;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let task = TaskSpec::new("ping", "");
        assert_eq!(task.pattern, "all");
        assert_eq!(task.retries, json!(3));
        assert_eq!(task.delay, json!(5));
        assert_eq!(task.background, 0);
        assert!(!task.become_flag);
    }

    #[test]
    fn test_builder_chain() {
        let task = TaskSpec::new("shell", "uptime")
            .pattern("web")
            .when("ansible_os_family == 'Debian'")
            .until("out.rc == 0", "out", json!("{{ tries }}"), json!(0))
            .become_user(None)
            .delegate_to("bastion");

        assert_eq!(task.conditionals.len(), 1);
        assert_eq!(task.register.as_deref(), Some("out"));
        assert_eq!(task.retries, json!("{{ tries }}"));
        assert!(task.become_flag);
        assert_eq!(task.become_user, None);
        assert_eq!(task.delegate_to.as_deref(), Some("bastion"));
    }
}
