// Run the argument string as a shell command, no module involved

use async_trait::async_trait;
use serde_json::json;

use super::{check_mode_skip, result_map, ActionHandler, ActionInput};
use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;

pub struct RawAction;

/// Split an optional `executable=` setting off the command text
pub fn split_executable(module_args: &str) -> (Option<String>, String) {
    let Some(start) = module_args.find("executable=") else {
        return (None, module_args.trim().to_string());
    };
    let value_start = start + "executable=".len();
    let rest = &module_args[value_start..];
    let value_len = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let executable = rest[..value_len].to_string();

    let cmd = format!("{}{}", &module_args[..start], rest[value_len..].trim_start());
    (Some(executable).filter(|e| !e.is_empty()), cmd.trim().to_string())
}

#[async_trait]
impl ActionHandler for RawAction {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        if session.task.check {
            return Ok(check_mode_skip(&session.host, "check mode not supported for raw"));
        }

        let (executable, cmd) = split_executable(input.module_args);
        let res = session
            .low_level_exec(&cmd, true, executable.as_deref(), None)
            .await?;

        Ok(ReturnData::new(
            session.host.clone(),
            result_map(json!({
                "rc": res.exit_code,
                "stdout": res.stdout,
                "stderr": res.stderr,
                "changed": true,
            })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_executable() {
        assert_eq!(
            split_executable("executable=/bin/bash echo $0"),
            (Some("/bin/bash".to_string()), "echo $0".to_string())
        );
        assert_eq!(split_executable("  uptime "), (None, "uptime".to_string()));
    }
}
