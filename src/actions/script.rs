// Transfer a local script and run it on the host

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{check_mode_skip, result_map, ActionHandler, ActionInput};
use crate::executor::args::{split_args, unquote};
use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;

pub struct ScriptAction;

/// Script path plus its arguments, with `creates=`/`removes=` pulled out
#[derive(Debug, Default, PartialEq)]
struct ScriptArgs {
    script: String,
    args: Vec<String>,
    creates: Option<String>,
    removes: Option<String>,
}

fn parse_script_args(module_args: &str) -> Result<ScriptArgs, RunnerError> {
    let mut out = ScriptArgs::default();
    for token in split_args(module_args)? {
        if let Some(path) = token.strip_prefix("creates=") {
            out.creates = Some(unquote(path).to_string());
        } else if let Some(path) = token.strip_prefix("removes=") {
            out.removes = Some(unquote(path).to_string());
        } else if out.script.is_empty() {
            out.script = unquote(&token).to_string();
        } else {
            out.args.push(token);
        }
    }
    Ok(out)
}

fn skipped(host: &str, msg: String) -> ReturnData {
    ReturnData::new(host, result_map(json!({"changed": false, "skipped": true, "msg": msg})))
}

async fn remote_exists(session: &HostSession<'_>, path: &str) -> Result<bool, RunnerError> {
    let cmd = format!("test -e {}", shell_words::quote(path));
    Ok(session.low_level_exec(&cmd, true, None, None).await?.success())
}

#[async_trait]
impl ActionHandler for ScriptAction {
    fn name(&self) -> &'static str {
        "script"
    }

    fn transfers_files(&self) -> bool {
        true
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let host = session.host.clone();
        if session.task.check {
            return Ok(check_mode_skip(&host, "check mode not supported for script"));
        }

        let parsed = parse_script_args(input.module_args)?;
        if parsed.script.is_empty() {
            return Ok(ReturnData::new(
                host,
                result_map(json!({"failed": true, "msg": "script requires a path to a local script"})),
            ));
        }

        if let Some(creates) = &parsed.creates {
            if remote_exists(session, creates).await? {
                return Ok(skipped(&host, format!("skipped, since {} exists", creates)));
            }
        }
        if let Some(removes) = &parsed.removes {
            if !remote_exists(session, removes).await? {
                return Ok(skipped(&host, format!("skipped, since {} does not exist", removes)));
            }
        }

        let mut source = PathBuf::from(&parsed.script);
        if source.is_relative() {
            source = session.ctx.playbook_dir.join(source);
        }
        if !source.is_file() {
            return Ok(ReturnData::new(
                host,
                result_map(json!({"failed": true, "msg": format!("could not find script {}", source.display())})),
            ));
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());

        let tmp = session.ensure_tmp().await?;
        let remote = session.shell.join_path(&[&tmp, &name]);
        session
            .conn
            .put_file(&source, &remote)
            .await
            .map_err(|e| e.into_runner_error(&host))?;

        let mode = if session.target.becomes_unprivileged() { "a+rx" } else { "u+rx" };
        session.remote_chmod(mode, &remote, false).await?;

        let environment = session.environment_string(input.inject)?;
        let mut cmd = format!("{} {}", environment, shell_words::quote(&remote));
        for arg in &parsed.args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        debug!(host = %host, script = %source.display(), "running script");
        let res = session.low_level_exec(cmd.trim(), true, None, None).await?;

        Ok(ReturnData::new(
            host,
            result_map(json!({
                "changed": true,
                "rc": res.exit_code,
                "stdout": res.stdout,
                "stderr": res.stderr,
            })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{exited, MockConnector};
    use crate::executor::{Runner, TaskSpec};
    use crate::inventory::{Host, Inventory};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn inventory() -> Inventory {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1"));
        inv
    }

    #[test]
    fn test_parse_script_args() {
        let parsed = parse_script_args("deploy.sh --fast creates=/opt/app 'two words'").unwrap();
        assert_eq!(
            parsed,
            ScriptArgs {
                script: "deploy.sh".into(),
                args: vec!["--fast".into(), "'two words'".into()],
                creates: Some("/opt/app".into()),
                removes: None,
            }
        );
    }

    #[tokio::test]
    async fn test_script_is_transferred_and_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setup.sh"), "#!/bin/sh\necho ready\n").unwrap();

        let mock = MockConnector::new();
        mock.reply("/setup.sh", "ready\n");
        let ctx = mock.context(inventory()).playbook_dir(dir.path()).build();

        let task = TaskSpec::new("script", "setup.sh --verbose");
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();

        let result = &results.contacted["web1"];
        assert_eq!(result["stdout"], json!("ready\n"));
        assert_eq!(result["changed"], json!(true));
        assert!(mock.puts()[0].remote.ends_with("/setup.sh"));
        let run = mock
            .commands_matching("/setup.sh")
            .into_iter()
            .find(|c| c.cmd.ends_with("--verbose"))
            .unwrap();
        assert!(run.cmd.starts_with("LANG=C "));
    }

    #[tokio::test]
    async fn test_creates_skips_when_present() {
        let mock = MockConnector::new();
        mock.reply_seq("test -e", vec![exited(0, "", "")]);
        let ctx = mock.context(inventory()).build();

        let task = TaskSpec::new("script", "setup.sh creates=/opt/app");
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();

        assert_eq!(results.contacted["web1"]["skipped"], json!(true));
        assert!(mock.puts().is_empty());
    }
}
