// One host's connection plus everything needed to run modules over it:
// remote temp path lifecycle, module transfer and invocation, and the small
// remote helpers action handlers build on

use std::io::Write;

use chrono::Utc;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::args::parse_kv;
use super::context::RunContext;
use super::results::ReturnData;
use super::shell::Shell;
use super::target::Target;
use super::task::TaskSpec;
use super::{CommandResult, Connection, ExecRequest, SSH_TRANSPORTS};
use crate::modules::ModuleStyle;
use crate::output::errors::RunnerError;
use crate::value::{to_object, to_plain_string};
use crate::vars::InjectContext;

/// Sentinel returned when a remote checksum probe produced nothing usable
pub const INVALID_CHECKSUM: &str = "INVALIDCHECKSUM";

/// Options for [`HostSession::execute_module`]
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub async_jid: Option<String>,
    /// Remote path of the module the async wrapper runs
    pub async_module: Option<String>,
    pub async_limit: Option<u64>,
    /// Keep the temp path after this invocation
    pub persist_files: bool,
    pub delete_remote_tmp: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions {
            async_jid: None,
            async_module: None,
            async_limit: None,
            persist_files: false,
            delete_remote_tmp: true,
        }
    }
}

/// Live state of one host execution
pub struct HostSession<'a> {
    pub ctx: &'a RunContext,
    pub task: &'a TaskSpec,
    /// Job id shared by every host of the run
    pub jid: &'a str,
    pub conn: Box<dyn Connection>,
    pub shell: Shell,
    pub target: Target,
    /// Inventory name of the host this execution is for
    pub host: String,
    /// Remote temp path, once created
    pub tmp: Option<String>,
}

impl<'a> HostSession<'a> {
    fn result(&self, result: Map<String, Value>) -> ReturnData {
        ReturnData::new(self.host.clone(), result)
    }

    fn pipelining_blocked_by_escalation(&self) -> bool {
        self.target
            .escalation
            .as_ref()
            .map(|e| !e.method.supports_pipelining())
            .unwrap_or(false)
    }

    /// Module payloads can go over stdin instead of a remote file
    pub fn can_pipeline(&self) -> bool {
        self.conn.has_pipelining()
            && self.ctx.config.pipelining
            && !self.ctx.config.keep_remote_files
            && !self.pipelining_blocked_by_escalation()
    }

    /// Run a raw command on the host.
    ///
    /// Escalation is skipped when the connection already runs as the
    /// escalation target user.
    pub async fn low_level_exec(
        &self,
        cmd: &str,
        sudoable: bool,
        executable: Option<&str>,
        in_data: Option<Vec<u8>>,
    ) -> Result<CommandResult, RunnerError> {
        let mut sudoable = sudoable;
        if let (Some(user), Some(escalation)) = (self.conn.user(), &self.target.escalation) {
            if user == escalation.user {
                sudoable = false;
            }
        }

        let req = ExecRequest {
            cmd: cmd.to_string(),
            tmp: self.tmp.clone(),
            escalation: self.target.escalation.clone(),
            sudoable,
            executable: Some(
                executable
                    .filter(|e| !e.is_empty())
                    .unwrap_or(&self.ctx.config.executable)
                    .to_string(),
            ),
            in_data,
        };

        self.conn
            .exec_command(req)
            .await
            .map_err(|e| e.into_runner_error(&self.host))
    }

    /// Create a fresh remote temp directory and return its path with a
    /// trailing separator
    pub async fn make_tmp_path(&self) -> Result<String, RunnerError> {
        let basefile = format!(
            "fanout-tmp-{}-{}",
            Utc::now().timestamp(),
            self.ctx.locks.random_up_to(1 << 48)
        );

        let escalate_unprivileged = self.target.becomes_unprivileged();
        let connecting_as_root = self.conn.user() == Some("root");
        let mode = (!connecting_as_root || escalate_unprivileged).then_some("a+rx");

        let cmd = self.shell.mkdtemp(
            &self.ctx.config.remote_tmp,
            &self.ctx.config.system_tmp,
            &basefile,
            escalate_unprivileged,
            mode,
        );
        let result = self.low_level_exec(&cmd, false, None, None).await?;

        if result.exit_code != 0 {
            return Err(RunnerError::TempPath(self.tmp_path_failure(&cmd, &result)));
        }

        let last = last_non_blank_line(&result.stdout).trim();
        let path = self.shell.join_path(&[last, ""]);
        if path.is_empty() || path == "/" {
            return Err(RunnerError::TempPath(format!(
                "failed to resolve remote temporary directory from {}: `{}` returned empty string",
                basefile, cmd
            )));
        }

        info!(host = %self.host, tmp = %path, "created remote temp path");
        Ok(path)
    }

    fn tmp_path_failure(&self, cmd: &str, result: &CommandResult) -> String {
        let mut output = if result.exit_code == 5 {
            "Authentication failure.".to_string()
        } else if result.exit_code == 255 && SSH_TRANSPORTS.contains(&self.target.transport.as_str()) {
            if self.ctx.config.verbosity > 3 {
                format!(
                    "SSH encountered an unknown error. The output was:\n{}{}",
                    result.stdout, result.stderr
                )
            } else {
                "SSH encountered an unknown error during the connection. \
                 Re-run the command with -vvvv to enable SSH debugging output \
                 that helps diagnose the issue."
                    .to_string()
            }
        } else if result.stderr.contains("No space left on device") {
            result.stderr.clone()
        } else {
            format!(
                "Authentication or permission failure. In some cases, you may have been able \
                 to authenticate and did not have permissions on the remote directory. Consider \
                 changing the remote temp path in fanout.toml to a path rooted in \"/tmp\". \
                 Failed command was: {}, exited with result {}",
                cmd, result.exit_code
            )
        };

        if !result.stdout.is_empty() {
            output.push_str(&format!(": {}", result.stdout));
        }
        output
    }

    /// The temp path, created on first use
    pub async fn ensure_tmp(&mut self) -> Result<String, RunnerError> {
        match &self.tmp {
            Some(tmp) => Ok(tmp.clone()),
            None => {
                let tmp = self.make_tmp_path().await?;
                self.tmp = Some(tmp.clone());
                Ok(tmp)
            }
        }
    }

    /// Forget the temp path so the next invocation provisions a new one
    pub fn reset_tmp(&mut self) {
        self.tmp = None;
    }

    /// Whether a module of `style` still needs a temp path
    pub fn late_needs_tmp_path(&self, style: ModuleStyle) -> bool {
        if self.tmp.is_some() {
            return false;
        }
        !self.can_pipeline() || style != ModuleStyle::New
    }

    /// Write `data` to `<tmp>/<name>` on the host
    pub async fn transfer_str(&self, tmp: &str, name: &str, data: &str) -> Result<String, RunnerError> {
        let remote = self.shell.join_path(&[tmp, name]);

        let mut local = NamedTempFile::new()?;
        local.write_all(data.as_bytes())?;
        local.flush()?;

        debug!(host = %self.host, remote = %remote, bytes = data.len(), "transferring");
        self.conn
            .put_file(local.path(), &remote)
            .await
            .map_err(|e| e.into_runner_error(&self.host))?;
        Ok(remote)
    }

    /// Configure a module and transfer it, returning its remote path
    pub async fn copy_module(
        &self,
        tmp: &str,
        module_name: &str,
        module_args: &str,
        inject: &InjectContext,
        complex_args: &Map<String, Value>,
    ) -> Result<(String, ModuleStyle), RunnerError> {
        let module =
            self.ctx
                .modules
                .configure(self.conn.as_ref(), module_name, module_args, inject, complex_args)?;
        let path = self.transfer_str(tmp, module_name, &module.data).await?;
        Ok((path, module.style))
    }

    /// Ship and run a module, returning its parsed result
    pub async fn execute_module(
        &mut self,
        module_name: &str,
        module_args: &str,
        inject: &InjectContext,
        complex_args: &Map<String, Value>,
        opts: ExecuteOptions,
    ) -> Result<ReturnData, RunnerError> {
        let module =
            self.ctx
                .modules
                .configure(self.conn.as_ref(), module_name, module_args, inject, complex_args)?;
        let environment = self.environment_string(inject)?;

        if module.style != ModuleStyle::New {
            // Only the shared runtime understands these markers
            if module_args.contains("CHECKMODE=True") {
                return Ok(self.result(skipped_with(
                    "cannot yet run check mode against old-style modules",
                )));
            }
            if module_args.contains("NO_LOG=True") {
                return Ok(self.result(skipped_with("cannot use no_log: with old-style modules")));
            }
        }

        if self.late_needs_tmp_path(module.style) {
            self.ensure_tmp().await?;
        }
        let tmp = self.tmp.clone().unwrap_or_default();
        let remote_module_path = self.shell.join_path(&[&tmp, module_name]);

        let pipelined = module.style == ModuleStyle::New && opts.async_jid.is_none() && self.can_pipeline();
        if !pipelined {
            self.transfer_str(&tmp, module_name, &module.data).await?;
        }

        let mut cmd = String::new();
        let mut in_data = None;
        if module.style != ModuleStyle::New {
            let args = to_plain_string(&self.ctx.templar.render(module_args, inject, false)?);
            let args_data = match module.style {
                ModuleStyle::WantJson => {
                    let mut merged = complex_args.clone();
                    merged.extend(to_object(&parse_kv(&args)?));
                    serde_json::to_string(&merged)?
                }
                _ => args,
            };
            let argsfile = self.transfer_str(&tmp, "arguments", &args_data).await?;
            if self.target.becomes_unprivileged() {
                self.remote_chmod("a+r", &argsfile, false).await?;
            }

            cmd = match &opts.async_jid {
                None => format!("{} {}", remote_module_path, argsfile),
                Some(jid) => async_command(&remote_module_path, jid, &opts, Some(&argsfile)),
            };
        } else {
            match &opts.async_jid {
                None if pipelined => in_data = Some(module.data.clone().into_bytes()),
                None => cmd = remote_module_path.clone(),
                Some(jid) => cmd = async_command(&remote_module_path, jid, &opts, None),
            }
        }

        let shebang = module
            .shebang
            .as_deref()
            .ok_or_else(|| RunnerError::MissingInterpreter(module_name.to_string()))?;

        let cleanup = self.tmp.is_some()
            && !self.ctx.config.keep_remote_files
            && !opts.persist_files
            && opts.delete_remote_tmp;
        let rm_tmp = (cleanup && self.target.becomes_root_or_none()).then_some(tmp.as_str());

        let cmd = self.shell.build_module_command(&environment, shebang, &cmd, rm_tmp);
        debug!(host = %self.host, module = module_name, pipelined, "executing module");
        let res = self.low_level_exec(cmd.trim(), true, None, in_data).await?;

        if cleanup {
            if self.target.becomes_unprivileged() {
                // The escalated user may not own the files; remove as the
                // connecting user instead
                let rm = self.shell.remove(&tmp, true);
                if let Err(e) = self.low_level_exec(&rm, false, None, None).await {
                    warn!(host = %self.host, tmp = %tmp, error = %e, "failed to remove remote temp path");
                }
            }
            self.tmp = None;
        }

        let mut data = super::results::parse_json(&res.stdout);
        if data.get("parsed") == Some(&Value::Bool(false)) {
            let msg = data
                .get("msg")
                .map(to_plain_string)
                .unwrap_or_default();
            data.insert("msg".into(), Value::String(format!("{}{}", msg, res.stderr)));
        }
        Ok(self.result(data))
    }

    /// Remove a temp path left behind by an action, unless remote files
    /// are kept. Best-effort.
    pub async fn cleanup_tmp(&mut self) {
        let Some(tmp) = self.tmp.take() else {
            return;
        };
        if self.ctx.config.keep_remote_files {
            return;
        }
        let rm = self.shell.remove(&tmp, true);
        if let Err(e) = self.low_level_exec(&rm, false, None, None).await {
            warn!(host = %self.host, tmp = %tmp, error = %e, "failed to remove remote temp path");
        }
    }

    pub async fn remote_chmod(&self, mode: &str, path: &str, sudoable: bool) -> Result<CommandResult, RunnerError> {
        let cmd = self.shell.chmod(mode, path);
        self.low_level_exec(&cmd, sudoable, None, None).await
    }

    /// Remote sha256 of `path`, a status code ("1" missing, "2" unreadable,
    /// "3" directory, "4" no hashing tool), or [`INVALID_CHECKSUM`]
    pub async fn remote_checksum(&self, path: &str) -> Result<String, RunnerError> {
        let cmd = self.shell.checksum(path);
        let result = self.low_level_exec(&cmd, true, None, None).await?;
        Ok(checksum_from_output(&result.stdout))
    }

    /// Expand a leading `~` or `~user` on the remote side; `~` alone means
    /// the escalation user's home when escalating
    pub async fn remote_expand_user(&self, path: &str) -> Result<String, RunnerError> {
        if !path.starts_with('~') {
            return Ok(path.to_string());
        }

        let (head, tail) = match path.split_once('/') {
            Some((head, tail)) => (head.to_string(), Some(tail)),
            None => (path.to_string(), None),
        };
        let expand = if head == "~" {
            match (&self.target.escalation, &self.target.user) {
                (Some(escalation), _) => format!("~{}", escalation.user),
                (None, Some(user)) => format!("~{}", user),
                (None, None) => head,
            }
        } else {
            head
        };

        let cmd = self.shell.expand_user(&expand);
        let result = self.low_level_exec(&cmd, false, None, None).await?;
        let initial = last_non_blank_line(&result.stdout).trim();
        if initial.is_empty() {
            return Ok(path.to_string());
        }
        Ok(match tail {
            Some(tail) => self.shell.join_path(&[initial, tail]),
            None => initial.to_string(),
        })
    }

    /// Environment prefix for module commands, from the task's templated
    /// `environment` mapping
    pub fn environment_string(&self, inject: &InjectContext) -> Result<String, RunnerError> {
        let env = match &self.task.environment {
            Some(raw) => self.ctx.templar.template(raw, inject, true)?,
            None => Value::Object(Map::new()),
        };
        let map = match env {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(RunnerError::Environment(other.to_string())),
        };

        Ok(self.shell.env_prefix(
            &self.ctx.config.module_lang,
            map.iter().map(|(k, v)| (k.as_str(), to_plain_string(v))),
        ))
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}

fn skipped_with(msg: &str) -> Map<String, Value> {
    let mut result = Map::new();
    result.insert("skipped".into(), Value::Bool(true));
    result.insert("msg".into(), Value::String(msg.to_string()));
    result
}

fn async_command(module_path: &str, jid: &str, opts: &ExecuteOptions, argsfile: Option<&str>) -> String {
    let mut parts = vec![
        module_path.to_string(),
        jid.to_string(),
        opts.async_limit.unwrap_or(0).to_string(),
        opts.async_module.clone().unwrap_or_default(),
    ];
    if let Some(argsfile) = argsfile {
        parts.push(argsfile.to_string());
    }
    parts.join(" ")
}

pub fn last_non_blank_line(buf: &str) -> &str {
    buf.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("")
}

fn checksum_from_output(stdout: &str) -> String {
    // Empty output usually means the connection dropped mid-probe
    last_non_blank_line(stdout)
        .split_whitespace()
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| INVALID_CHECKSUM.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{exited, MockConnector};
    use crate::executor::{BecomeMethod, BecomeSpec, ConnectParams, Connector};
    use crate::config::RunnerConfig;
    use crate::inventory::{Host, Inventory};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn inventory() -> Inventory {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1").with_user("deploy"));
        inv
    }

    fn target(escalation: Option<BecomeSpec>) -> Target {
        Target {
            host: "web1".into(),
            port: 22,
            user: Some("deploy".into()),
            pass: None,
            transport: "ssh".into(),
            private_key_file: None,
            escalation,
            delegate_host: None,
        }
    }

    async fn session<'a>(
        ctx: &'a RunContext,
        task: &'a TaskSpec,
        mock: &MockConnector,
        escalation: Option<BecomeSpec>,
    ) -> HostSession<'a> {
        let conn = mock
            .connect(&ConnectParams {
                host: "web1".into(),
                user: Some("deploy".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        HostSession {
            ctx,
            task,
            jid: "42",
            conn,
            shell: Shell::Sh,
            target: target(escalation),
            host: "web1".into(),
            tmp: None,
        }
    }

    #[tokio::test]
    async fn test_make_tmp_path() {
        let mock = MockConnector::new();
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let s = session(&ctx, &task, &mock, None).await;

        let tmp = s.make_tmp_path().await.unwrap();
        assert!(tmp.starts_with("$HOME/.fanout/tmp/fanout-tmp-"));
        assert!(tmp.ends_with('/'));

        let cmd = &mock.commands()[0];
        assert!(cmd.cmd.contains("chmod a+rx"));
        assert!(!cmd.escalated);
    }

    #[tokio::test]
    async fn test_tmp_path_uses_system_tmp_for_unprivileged_escalation() {
        let mock = MockConnector::new();
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let s = session(&ctx, &task, &mock, Some(BecomeSpec::new(BecomeMethod::Sudo, "app"))).await;

        let tmp = s.make_tmp_path().await.unwrap();
        assert!(tmp.starts_with("/tmp/fanout-tmp-"));
    }

    #[tokio::test]
    async fn test_tmp_path_failure_messages() {
        let mock = MockConnector::new();
        mock.reply_seq(
            "mkdir -p",
            vec![
                exited(5, "", ""),
                exited(255, "", "ssh: connect"),
                exited(1, "", "mkdir: No space left on device"),
                exited(1, "denied", ""),
            ],
        );
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let s = session(&ctx, &task, &mock, None).await;

        let mut messages = Vec::new();
        for _ in 0..4 {
            match s.make_tmp_path().await {
                Err(RunnerError::TempPath(msg)) => messages.push(msg),
                other => panic!("unexpected: {:?}", other),
            }
        }

        assert_eq!(messages[0], "Authentication failure.");
        assert!(messages[1].starts_with("SSH encountered an unknown error"));
        assert_eq!(messages[2], "mkdir: No space left on device");
        assert!(messages[3].contains("Failed command was: mkdir -p"));
        assert!(messages[3].contains("exited with result 1: denied"));
    }

    #[tokio::test]
    async fn test_tmp_path_rejects_root() {
        let mock = MockConnector::new();
        mock.reply("mkdir -p", "\n");
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let s = session(&ctx, &task, &mock, None).await;

        let err = s.make_tmp_path().await.unwrap_err();
        assert!(err.to_string().contains("failed to resolve remote temporary directory"));
    }

    #[tokio::test]
    async fn test_execute_legacy_module_transfers_and_cleans_up() {
        let mock = MockConnector::new();
        mock.reply("/ping", r#"{"ping": "pong", "changed": false}"#);
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let mut s = session(&ctx, &task, &mock, None).await;

        let inject = InjectContext::new();
        let result = s
            .execute_module("ping", "data=pong", &inject, &Map::new(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.result["ping"], json!("pong"));
        let puts = mock.puts();
        assert_eq!(puts.len(), 2);
        assert!(puts[0].remote.ends_with("/ping"));
        assert!(puts[1].remote.ends_with("/arguments"));
        assert_eq!(puts[1].content, "data=pong");

        let run = &mock.commands_matching("/ping")[0];
        assert!(run.cmd.starts_with("LANG=C LC_CTYPE=C LC_MESSAGES=C /bin/sh "));
        assert!(run.cmd.contains("; rm -rf "));
        assert!(s.tmp.is_none());
    }

    #[tokio::test]
    async fn test_new_style_module_is_pipelined() {
        let mock = MockConnector::new();
        mock.reply("/usr/bin/python", r#"{"rc": 0, "stdout": "up", "changed": true}"#);
        let config = RunnerConfig {
            pipelining: true,
            ..Default::default()
        };
        let ctx = mock.context(inventory()).config(config).build();
        let task = TaskSpec::new("command", "uptime");
        let mut s = session(&ctx, &task, &mock, None).await;

        let result = s
            .execute_module("command", "uptime", &InjectContext::new(), &Map::new(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.rc(), Some(0));
        assert!(mock.puts().is_empty());
        assert!(mock.commands_matching("mkdir").is_empty());
        let run = &mock.commands()[0];
        assert!(run.stdin_text().contains("MODULE_ARGS = \"uptime\""));
        assert!(!run.escalated);
    }

    #[tokio::test]
    async fn test_new_style_module_transferred_without_pipelining() {
        let mock = MockConnector::new();
        mock.without_pipelining();
        mock.reply("/command", r#"{"rc": 0, "stdout": "up", "changed": true}"#);
        let config = RunnerConfig {
            pipelining: true,
            ..Default::default()
        };
        let ctx = mock.context(inventory()).config(config).build();
        let task = TaskSpec::new("command", "uptime");
        let mut s = session(&ctx, &task, &mock, None).await;

        let result = s
            .execute_module("command", "uptime", &InjectContext::new(), &Map::new(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.rc(), Some(0));
        let puts = mock.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].host, "web1");
        assert!(puts[0].remote.ends_with("/command"));
        assert!(puts[0].content.contains("MODULE_ARGS = \"uptime\""));
        let run = &mock.commands_matching("/command")[0];
        assert!(run.stdin.is_none());
    }

    #[tokio::test]
    async fn test_unprivileged_escalation_removes_tmp_separately() {
        let mock = MockConnector::new();
        mock.reply("/ping", r#"{"ping": "pong"}"#);
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let mut s = session(&ctx, &task, &mock, Some(BecomeSpec::new(BecomeMethod::Sudo, "app"))).await;

        s.execute_module("ping", "", &InjectContext::new(), &Map::new(), ExecuteOptions::default())
            .await
            .unwrap();

        let cmds = mock.commands();
        assert!(cmds.iter().any(|c| c.cmd.starts_with("chmod a+r ") && !c.escalated));
        let run = mock.commands_matching("/ping").into_iter().find(|c| c.escalated).unwrap();
        assert!(!run.cmd.contains("rm -rf"));
        let cleanup = cmds.last().unwrap();
        assert!(cleanup.cmd.starts_with("rm -rf /tmp/fanout-tmp-"));
        assert!(!cleanup.escalated);
    }

    #[tokio::test]
    async fn test_legacy_module_skips_check_mode() {
        let mock = MockConnector::new();
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let mut s = session(&ctx, &task, &mock, None).await;

        let result = s
            .execute_module("ping", " CHECKMODE=True", &InjectContext::new(), &Map::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.result["skipped"], json!(true));
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_output_appends_stderr() {
        let mock = MockConnector::new();
        mock.reply_seq("/ping", vec![exited(1, "garbage", "boom")]);
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("ping", "");
        let mut s = session(&ctx, &task, &mock, None).await;

        let result = s
            .execute_module("ping", "", &InjectContext::new(), &Map::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.result["parsed"], json!(false));
        assert_eq!(result.msg(), Some("garbageboom"));
    }

    #[tokio::test]
    async fn test_checksum_probe() {
        let mock = MockConnector::new();
        mock.reply_seq(
            "sha256sum",
            vec![
                exited(0, "abc123  /etc/motd\n", ""),
                exited(0, "3  /etc\n", ""),
                exited(0, "\n", ""),
            ],
        );
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("copy", "");
        let s = session(&ctx, &task, &mock, None).await;

        assert_eq!(s.remote_checksum("/etc/motd").await.unwrap(), "abc123");
        assert_eq!(s.remote_checksum("/etc").await.unwrap(), "3");
        assert_eq!(s.remote_checksum("/gone").await.unwrap(), INVALID_CHECKSUM);
    }

    #[tokio::test]
    async fn test_expand_user_honors_escalation() {
        let mock = MockConnector::new();
        mock.reply("echo ~app", "/home/app\n");
        let ctx = mock.context(inventory()).build();
        let task = TaskSpec::new("copy", "");
        let s = session(&ctx, &task, &mock, Some(BecomeSpec::new(BecomeMethod::Sudo, "app"))).await;

        assert_eq!(s.remote_expand_user("~/conf/app.ini").await.unwrap(), "/home/app/conf/app.ini");
        assert_eq!(s.remote_expand_user("/abs").await.unwrap(), "/abs");
    }

    #[tokio::test]
    async fn test_environment_must_be_mapping() {
        let mock = MockConnector::new();
        let ctx = mock.context(inventory()).build();
        let mut inject = InjectContext::new();
        inject.insert("proxy", json!("http://proxy:3128"));

        let task = TaskSpec::new("ping", "").environment(json!({"http_proxy": "{{ proxy }}"}));
        let s = session(&ctx, &task, &mock, None).await;
        assert_eq!(
            s.environment_string(&inject).unwrap(),
            "LANG=C LC_CTYPE=C LC_MESSAGES=C http_proxy=http://proxy:3128"
        );

        let task = TaskSpec::new("ping", "").environment(json!(["not", "a", "map"]));
        let s = session(&ctx, &task, &mock, None).await;
        assert!(matches!(s.environment_string(&inject), Err(RunnerError::Environment(_))));
    }
}
