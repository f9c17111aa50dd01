// Action handlers: what the executor does with a module once a host is
// connected. Most modules go through `normal`; a few names have dedicated
// handlers that run on the control side.

mod background;
mod copy;
mod debug;
mod fail;
mod normal;
mod pause;
mod raw;
mod script;
mod set_fact;

pub use background::BackgroundAction;
pub use copy::CopyAction;
pub use debug::DebugAction;
pub use fail::FailAction;
pub use normal::NormalAction;
pub use pause::PauseAction;
pub use raw::RawAction;
pub use script::ScriptAction;
pub use set_fact::SetFactAction;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;
use crate::vars::InjectContext;

/// Arguments handed to an action for one host
#[derive(Debug, Clone, Copy)]
pub struct ActionInput<'a> {
    pub module_name: &'a str,
    pub module_args: &'a str,
    pub inject: &'a InjectContext,
    pub complex_args: &'a Map<String, Value>,
}

/// Trait for action implementations
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Action name
    fn name(&self) -> &'static str;

    /// Needs a remote temp path before it runs
    fn transfers_files(&self) -> bool {
        false
    }

    /// Runs once for the whole host group instead of per host
    fn bypass_host_loop(&self) -> bool {
        false
    }

    /// Validate before connecting
    fn setup(&self, _module_name: &str, _inject: &InjectContext) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError>;
}

/// Capability-tagged handler table, built once per run
pub struct ActionRegistry {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
    normal: Arc<dyn ActionHandler>,
    background: Arc<dyn ActionHandler>,
}

impl ActionRegistry {
    /// Registry with only the module-running handlers
    pub fn new() -> Self {
        ActionRegistry {
            handlers: HashMap::new(),
            normal: Arc::new(NormalAction),
            background: Arc::new(BackgroundAction),
        }
    }

    /// Every handler shipped with the crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RawAction));
        registry.register(Arc::new(ScriptAction));
        registry.register(Arc::new(CopyAction));
        registry.register(Arc::new(DebugAction));
        registry.register(Arc::new(FailAction));
        registry.register(Arc::new(SetFactAction));
        registry.register(Arc::new(PauseAction));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    /// Dedicated handler for a module name
    pub fn get(&self, module_name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(module_name).cloned()
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.handlers.contains_key(module_name)
    }

    /// Runs a module in the foreground
    pub fn normal(&self) -> Arc<dyn ActionHandler> {
        self.normal.clone()
    }

    /// Starts a module as a background job
    pub fn background(&self) -> Arc<dyn ActionHandler> {
        self.background.clone()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Merge complex args under k=v args parsed from `module_args`
pub(crate) fn merged_args(
    module_args: &str,
    complex_args: &Map<String, Value>,
) -> Result<Map<String, Value>, RunnerError> {
    let mut args = complex_args.clone();
    for (k, v) in crate::executor::args::parse_kv(module_args)? {
        args.insert(k, v);
    }
    Ok(args)
}

pub(crate) fn result_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Result for a handler that refuses to run in check mode
pub(crate) fn check_mode_skip(host: &str, msg: &str) -> ReturnData {
    ReturnData::new(
        host,
        result_map(serde_json::json!({"skipped": true, "msg": msg})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_capabilities() {
        let registry = ActionRegistry::builtin();

        assert!(registry.get("pause").unwrap().bypass_host_loop());
        assert!(registry.get("copy").unwrap().transfers_files());
        assert!(registry.get("script").unwrap().transfers_files());
        assert!(!registry.get("debug").unwrap().transfers_files());
        assert!(registry.get("command").is_none());
        assert!(registry.get("normal").is_none());
        assert_eq!(registry.normal().name(), "normal");
        assert_eq!(registry.background().name(), "async");
    }
}
