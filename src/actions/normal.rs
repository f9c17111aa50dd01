// Transfer and execute a module in the foreground

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{check_mode_skip, ActionHandler, ActionInput};
use crate::executor::{ExecuteOptions, HostSession, ReturnData};
use crate::output::errors::RunnerError;

/// Marker the command module reads to run through the shell
pub const USE_SHELL: &str = "#USE_SHELL";

pub struct NormalAction;

/// Prepend string complex args as quoted k=v pairs so modules without the
/// shared runtime still see them
pub fn complex_args_hack(complex_args: &serde_json::Map<String, Value>, module_args: &str) -> String {
    let mut args = module_args.to_string();
    for (k, v) in complex_args {
        if let Value::String(s) = v {
            args = format!("{}={} {}", k, shell_words::quote(s), args);
        }
    }
    args
}

/// `shell` is `command` with the shell marker
pub fn resolve_shell(module_name: &str, module_args: &str) -> (String, String) {
    if module_name == "shell" {
        ("command".to_string(), format!("{} {}", module_args, USE_SHELL))
    } else {
        (module_name.to_string(), module_args.to_string())
    }
}

#[async_trait]
impl ActionHandler for NormalAction {
    fn name(&self) -> &'static str {
        "normal"
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let module_args = complex_args_hack(input.complex_args, input.module_args);
        let (module_name, mut module_args) = resolve_shell(input.module_name, &module_args);

        if session.task.check {
            if module_name == "command" {
                return Ok(check_mode_skip(
                    &session.host,
                    &format!("check mode not supported for {}", module_name),
                ));
            }
            module_args.push_str(" CHECKMODE=True");
        }
        if session.task.no_log {
            module_args.push_str(" NO_LOG=True");
        }

        debug!(host = %session.host, module = %module_name, "remote module");
        session
            .execute_module(
                &module_name,
                &module_args,
                input.inject,
                input.complex_args,
                ExecuteOptions::default(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_complex_args_hack_quotes_strings_only() {
        let complex = json!({"dest": "/srv/my app", "mode": 644});
        let args = complex_args_hack(complex.as_object().unwrap(), "force=yes");
        assert_eq!(args, "dest='/srv/my app' force=yes");
    }

    #[test]
    fn test_shell_becomes_command() {
        assert_eq!(
            resolve_shell("shell", "echo $HOME"),
            ("command".to_string(), "echo $HOME #USE_SHELL".to_string())
        );
        assert_eq!(
            resolve_shell("command", "ls"),
            ("command".to_string(), "ls".to_string())
        );
    }
}
