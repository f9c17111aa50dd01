// Print a message or a variable's value

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{merged_args, result_map, ActionHandler, ActionInput};
use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;
use crate::template::TemplateError;
use crate::value::to_plain_string;

pub struct DebugAction;

#[async_trait]
impl ActionHandler for DebugAction {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let args = merged_args(input.module_args, input.complex_args)?;

        let mut result = if let Some(msg) = args.get("msg") {
            json!({"msg": msg})
        } else if let Some(var) = args.get("var") {
            let name = to_plain_string(var);
            let value = match session.ctx.templar.evaluate(&name, input.inject) {
                Ok(value) => value,
                Err(TemplateError::Undefined(_)) => Value::String(format!("{{{{ {} }}}}", name)),
                Err(e) => return Err(e.into()),
            };
            let mut result = serde_json::Map::new();
            result.insert(name, value);
            Value::Object(result)
        } else {
            json!({"msg": "Hello world!"})
        };
        result["verbose_always"] = json!(true);

        Ok(ReturnData::new(session.host.clone(), result_map(result)))
    }
}
