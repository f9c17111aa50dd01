// Fail the host on purpose, usually behind a `when`

use async_trait::async_trait;
use serde_json::json;

use super::{merged_args, result_map, ActionHandler, ActionInput};
use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;
use crate::value::to_plain_string;

pub const DEFAULT_FAIL_MSG: &str = "Failed as requested from task";

pub struct FailAction;

#[async_trait]
impl ActionHandler for FailAction {
    fn name(&self) -> &'static str {
        "fail"
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let args = merged_args(input.module_args, input.complex_args)?;
        let msg = args
            .get("msg")
            .map(to_plain_string)
            .unwrap_or_else(|| DEFAULT_FAIL_MSG.to_string());

        Ok(ReturnData::new(
            session.host.clone(),
            result_map(json!({"failed": true, "msg": msg})),
        ))
    }
}
