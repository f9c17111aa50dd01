// Retry-until support: templated retry budget and delay, re-read on every
// iteration so a value can change while looping

use std::time::Duration;

use serde_json::{Map, Value};

use super::context::RunContext;
use crate::output::errors::RunnerError;
use crate::value::as_f64;
use crate::vars::InjectContext;

pub const MAX_RETRIES_MSG: &str = "Task failed as maximum retries was encountered.";

/// An `until` condition with its retry budget
pub struct UntilPolicy<'a> {
    pub condition: &'a str,
    /// Variable the latest result is registered under
    pub register: &'a str,
    pub retries: &'a Value,
    pub delay: &'a Value,
}

impl<'a> UntilPolicy<'a> {
    /// Register `result` and evaluate the condition against it
    pub fn satisfied(
        &self,
        ctx: &RunContext,
        inject: &mut InjectContext,
        result: &Map<String, Value>,
    ) -> Result<bool, RunnerError> {
        inject.insert(self.register, Value::Object(result.clone()));
        Ok(ctx
            .templar
            .check_conditional(self.condition, inject, ctx.config.error_on_undefined_vars)?)
    }

    /// Re-invocations allowed after the first result fails the condition
    pub fn retries(&self, ctx: &RunContext, inject: &InjectContext) -> Result<f64, RunnerError> {
        templated_number(ctx, inject, self.retries, "retries")
    }

    pub fn delay(&self, ctx: &RunContext, inject: &InjectContext) -> Result<Duration, RunnerError> {
        let secs = templated_number(ctx, inject, self.delay, "delay")?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

fn templated_number(
    ctx: &RunContext,
    inject: &InjectContext,
    raw: &Value,
    what: &str,
) -> Result<f64, RunnerError> {
    let value = ctx.templar.template(raw, inject, true)?;
    as_f64(&value).ok_or_else(|| {
        RunnerError::Template(format!("{} must be a number, got {}", what, value))
    })
}

/// Mark a result as having run out of retries
pub fn mark_exhausted(result: &mut Map<String, Value>) {
    result.insert("failed".into(), Value::Bool(true));
    result.insert("msg".into(), Value::String(MAX_RETRIES_MSG.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_retries_and_delay_are_templated() {
        let ctx = RunContext::builder(Arc::new(Inventory::new())).build();
        let mut inject = InjectContext::new();
        inject.insert("tries", json!("4"));
        inject.insert("pause", json!(0.25));

        let retries = json!("{{ tries }}");
        let delay = json!("{{ pause }}");
        let policy = UntilPolicy {
            condition: "out.rc == 0",
            register: "out",
            retries: &retries,
            delay: &delay,
        };

        assert_eq!(policy.retries(&ctx, &inject).unwrap(), 4.0);
        assert_eq!(policy.delay(&ctx, &inject).unwrap(), Duration::from_millis(250));

        let done = json!({"rc": 0});
        assert!(policy.satisfied(&ctx, &mut inject, done.as_object().unwrap()).unwrap());
        assert_eq!(inject.get("out"), Some(&done));
    }

    #[test]
    fn test_non_numeric_retries() {
        let ctx = RunContext::builder(Arc::new(Inventory::new())).build();
        let retries = json!("lots");
        let delay = json!(0);
        let policy = UntilPolicy {
            condition: "true",
            register: "r",
            retries: &retries,
            delay: &delay,
        };
        assert!(policy.retries(&ctx, &InjectContext::new()).is_err());
    }

    #[test]
    fn test_mark_exhausted() {
        let mut result = Map::new();
        mark_exhausted(&mut result);
        assert_eq!(result["failed"], json!(true));
        assert_eq!(result["msg"], json!(MAX_RETRIES_MSG));
    }
}
