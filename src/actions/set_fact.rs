// Set host variables for later tasks

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{merged_args, result_map, ActionHandler, ActionInput};
use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;

pub struct SetFactAction;

/// Flag-like strings become booleans; everything else is kept as is
fn coerce(value: Value) -> Value {
    match &value {
        Value::String(s) => match s.to_lowercase().as_str() {
            "yes" | "true" => Value::Bool(true),
            "no" | "false" => Value::Bool(false),
            _ => value,
        },
        _ => value,
    }
}

#[async_trait]
impl ActionHandler for SetFactAction {
    fn name(&self) -> &'static str {
        "set_fact"
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let facts: Map<String, Value> = merged_args(input.module_args, input.complex_args)?
            .into_iter()
            .map(|(k, v)| (k, coerce(v)))
            .collect();

        Ok(ReturnData::new(
            session.host.clone(),
            result_map(json!({"changed": false, "ansible_facts": facts})),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::MockConnector;
    use crate::executor::{Runner, TaskSpec};
    use crate::inventory::{Host, Inventory};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(json!("Yes")), json!(true));
        assert_eq!(coerce(json!("false")), json!(false));
        assert_eq!(coerce(json!("maybe")), json!("maybe"));
        assert_eq!(coerce(json!(3)), json!(3));
    }

    #[tokio::test]
    async fn test_facts_visible_to_next_task() {
        let mock = MockConnector::new();
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1"));
        let ctx = mock.context(inv).build();

        let task = TaskSpec::new("set_fact", "release=v7 enabled=yes");
        let results = Runner::new(ctx.clone(), Arc::new(task)).run().await.unwrap();
        assert_eq!(
            results.contacted["web1"]["ansible_facts"],
            json!({"release": "v7", "enabled": true})
        );

        let task = TaskSpec::new("debug", "msg='{{ release }} {{ enabled }}'");
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();
        assert_eq!(results.contacted["web1"]["msg"], json!("v7 True"));
    }
}
