// Local command execution without SSH

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CommandResult, ConnectParams, Connection, ConnectionError, Connector, ExecRequest};

/// Local connection for executing commands on the control machine
pub struct LocalConnection {
    host_name: String,
    user: Option<String>,
}

impl LocalConnection {
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
            user: std::env::var("USER").ok(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec_command(&self, req: ExecRequest) -> Result<CommandResult, ConnectionError> {
        let executable = req.executable.as_deref().unwrap_or("/bin/sh");
        let wrapped = req.effective_become().map(|b| b.wrap(&req.cmd, executable));
        let (cmd, stdin) = match &wrapped {
            Some(w) => (w.command.as_str(), w.stdin(req.in_data.as_deref())),
            None => (req.cmd.as_str(), req.in_data.clone()),
        };

        debug!(host = %self.host_name, cmd = %cmd, "local exec");

        let mut child = Command::new(executable)
            .arg("-c")
            .arg(cmd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ConnectionError::Exec(format!("Failed to execute local command: {}", e))
            })?;

        if let Some(data) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // The command may exit without draining its input
                match pipe.write_all(&data).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                    _ => {}
                }
                drop(pipe);
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stdout = match &wrapped {
            Some(w) => w.strip_marker(&stdout).to_string(),
            None => stdout,
        };

        Ok(CommandResult {
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError> {
        debug!(host = %self.host_name, local = %local.display(), remote, "local put");
        tokio::fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::Transfer {
                remote: remote.to_string(),
                message: format!("failed to copy {}: {}", local.display(), e),
            })
    }

    fn has_pipelining(&self) -> bool {
        true
    }

    fn transport(&self) -> &str {
        "local"
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

/// Opens [`LocalConnection`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, ConnectionError> {
        Ok(Box::new(LocalConnection::new(params.host.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BecomeMethod, BecomeSpec};

    #[tokio::test]
    async fn test_local_exec() {
        let conn = LocalConnection::new("localhost");
        let result = conn
            .exec_command(ExecRequest::new("echo 'hello world'"))
            .await
            .unwrap();

        assert!(result.success());
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_local_exec_failure() {
        let conn = LocalConnection::new("localhost");
        let result = conn.exec_command(ExecRequest::new("exit 1")).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_local_exec_pipes_stdin() {
        let conn = LocalConnection::new("localhost");
        let mut req = ExecRequest::new("cat");
        req.in_data = Some(b"{\"ping\": \"pong\"}".to_vec());

        let result = conn.exec_command(req).await.unwrap();
        assert_eq!(result.stdout, "{\"ping\": \"pong\"}");
    }

    #[tokio::test]
    async fn test_escalation_ignored_when_not_sudoable() {
        let conn = LocalConnection::new("localhost");
        let mut req = ExecRequest::new("echo plain");
        req.escalation = Some(BecomeSpec::new(BecomeMethod::Sudo, "root"));
        req.sudoable = false;

        assert!(req.effective_become().is_none());
        let result = conn.exec_command(req).await.unwrap();
        assert_eq!(result.stdout.trim(), "plain");
    }

    #[tokio::test]
    async fn test_put_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut src = NamedTempFile::new().unwrap();
        write!(src, "test content").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("copied");

        let conn = LocalConnector
            .connect(&ConnectParams {
                host: "localhost".into(),
                transport: "local".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        conn.put_file(src.path(), dest.to_str().unwrap()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "test content");
        assert_eq!(conn.transport(), "local");
    }
}
