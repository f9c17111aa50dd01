// Start a module as a background job through the async wrapper

use async_trait::async_trait;
use tracing::info;

use super::normal::{complex_args_hack, resolve_shell};
use super::{check_mode_skip, ActionHandler, ActionInput};
use crate::executor::{ExecuteOptions, HostSession, ReturnData};
use crate::output::errors::RunnerError;

pub const ASYNC_WRAPPER: &str = "async_wrapper";

pub struct BackgroundAction;

#[async_trait]
impl ActionHandler for BackgroundAction {
    fn name(&self) -> &'static str {
        "async"
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        if session.task.check {
            return Ok(check_mode_skip(&session.host, "check mode not supported for async"));
        }

        let module_args = complex_args_hack(input.complex_args, input.module_args);
        let (module_name, module_args) = resolve_shell(input.module_name, &module_args);

        let tmp = session.ensure_tmp().await?;
        let (module_path, _) = session
            .copy_module(&tmp, &module_name, &module_args, input.inject, input.complex_args)
            .await?;
        session.remote_chmod("a+rx", &module_path, false).await?;

        info!(host = %session.host, jid = %session.jid, limit = session.task.background, "starting background job");
        let opts = ExecuteOptions {
            async_jid: Some(session.jid.to_string()),
            async_module: Some(module_path),
            async_limit: Some(session.task.background),
            // The wrapper removes the directory once the job finishes
            delete_remote_tmp: false,
            ..Default::default()
        };
        session
            .execute_module(ASYNC_WRAPPER, &module_args, input.inject, input.complex_args, opts)
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::executor::testing::MockConnector;
    use crate::executor::{Runner, TaskSpec};
    use crate::inventory::{Host, Inventory};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wrapper_invocation() {
        let mock = MockConnector::new();
        mock.reply(
            "/async_wrapper",
            r#"{"started": 1, "finished": 0, "ansible_job_id": "77.100", "results_file": "/root/.fanout_async/77.100"}"#,
        );
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1"));
        let ctx = mock.context(inv).build();

        let task = Arc::new(TaskSpec::new("command", "sleep 30").background(60));
        let runner = Runner::new(ctx, task);
        let jid = runner.jid().to_string();
        let results = runner.run().await.unwrap();

        assert_eq!(results.contacted["web1"]["ansible_job_id"], json!("77.100"));
        let run = &mock.commands_matching("/async_wrapper")[0];
        let words: Vec<&str> = run.cmd.split_whitespace().collect();
        let at = words.iter().position(|w| w.ends_with("/async_wrapper")).unwrap();
        assert_eq!(words[at + 1], jid);
        assert_eq!(words[at + 2], "60");
        assert!(words[at + 3].ends_with("/command"));
        assert!(words[at + 4].ends_with("/arguments"));
        assert!(!run.cmd.contains("rm -rf"));
        assert!(mock.commands().iter().any(|c| c.cmd.starts_with("chmod a+rx ") && c.cmd.contains("/command")));
    }
}
