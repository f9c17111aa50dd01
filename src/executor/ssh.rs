// SSH transport over libssh2

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{KeyboardInteractivePrompt, Session};
use tracing::{debug, warn};

use super::{CommandResult, ConnectParams, Connection, ConnectionError, Connector, ExecRequest};

/// Run blocking libssh2 work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, ConnectionError>
where
    F: FnOnce() -> Result<T, ConnectionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConnectionError::Exec(format!("ssh worker failed: {}", e)))?
}

/// Opens authenticated [`SshConnection`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, ConnectionError> {
        let params = params.clone();
        let conn = blocking(move || SshConnection::open(&params)).await?;
        Ok(Box::new(conn))
    }
}

/// One authenticated SSH session to a host
pub struct SshConnection {
    session: Session,
    host_name: String,
    user: String,
}

impl SshConnection {
    fn open(params: &ConnectParams) -> Result<Self, ConnectionError> {
        let connect_err = |message: String| ConnectionError::Connect {
            host: params.host.clone(),
            message,
        };
        let timeout = Duration::from_secs(params.timeout_secs.max(1));

        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(format!("Invalid address: {}", e)))?
            .next()
            .ok_or_else(|| connect_err("address resolved to nothing".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| connect_err(format!("Connection failed: {}", e)))?;

        let mut session = Session::new()
            .map_err(|e| connect_err(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| connect_err(format!("SSH handshake failed: {}", e)))?;

        let user = params
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        if !authenticate(&session, &user, params) {
            return Err(ConnectionError::Auth {
                host: params.host.clone(),
                user,
            });
        }

        // Commands may legitimately run longer than the connect timeout
        session.set_timeout(0);

        debug!(host = %params.host, port = params.port, user = %user, "ssh session established");

        Ok(SshConnection {
            session,
            host_name: params
                .delegate_host
                .clone()
                .unwrap_or_else(|| params.host.clone()),
            user,
        })
    }
}

/// Try agent, then key files, then password and keyboard-interactive
fn authenticate(session: &Session, user: &str, params: &ConnectParams) -> bool {
    if let Ok(mut agent) = session.agent() {
        if agent.connect().is_ok() {
            agent.list_identities().ok();
            for identity in agent.identities().unwrap_or_default() {
                if agent.userauth(user, &identity).is_ok() {
                    return true;
                }
            }
        }
    }

    let home = std::env::var("HOME").ok().map(PathBuf::from);
    let key_paths = params
        .private_key_file
        .iter()
        .map(PathBuf::from)
        .chain(
            home.iter()
                .flat_map(|h| [h.join(".ssh/id_ed25519"), h.join(".ssh/id_rsa")]),
        );

    for key_path in key_paths {
        if key_path.exists()
            && session
                .userauth_pubkey_file(user, None, &key_path, None)
                .is_ok()
        {
            return true;
        }
    }

    if let Some(password) = &params.password {
        if session.userauth_password(user, password).is_ok() {
            return true;
        }
        // Some PAM setups only offer keyboard-interactive
        let mut prompter = PasswordPrompter(password.clone());
        if session
            .userauth_keyboard_interactive(user, &mut prompter)
            .is_ok()
        {
            return true;
        }
    }

    session.authenticated()
}

/// Answers every keyboard-interactive prompt with the password
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}

fn exec_blocking(
    session: &Session,
    cmd: &str,
    stdin: Option<&[u8]>,
) -> Result<CommandResult, ConnectionError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| ConnectionError::Exec(format!("Failed to open channel: {}", e)))?;
    channel
        .exec(cmd)
        .map_err(|e| ConnectionError::Exec(format!("Failed to execute command: {}", e)))?;

    if let Some(data) = stdin {
        channel.write_all(data)?;
    }
    channel
        .send_eof()
        .map_err(|e| ConnectionError::Exec(format!("Failed to close stdin: {}", e)))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    channel.read_to_string(&mut stdout)?;
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close().ok();
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
    })
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec_command(&self, req: ExecRequest) -> Result<CommandResult, ConnectionError> {
        let executable = req
            .executable
            .clone()
            .unwrap_or_else(|| "/bin/sh".to_string());
        let wrapped = req.effective_become().map(|b| b.wrap(&req.cmd, &executable));
        let (cmd, stdin) = match &wrapped {
            Some(w) => (w.command.clone(), w.stdin(req.in_data.as_deref())),
            None => (req.cmd.clone(), req.in_data.clone()),
        };

        debug!(host = %self.host_name, cmd = %cmd, "ssh exec");

        let session = self.session.clone();
        let mut result =
            blocking(move || exec_blocking(&session, &cmd, stdin.as_deref())).await?;

        if let Some(w) = &wrapped {
            result.stdout = w.strip_marker(&result.stdout).to_string();
        }
        Ok(result)
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError> {
        debug!(host = %self.host_name, local = %local.display(), remote, "sftp put");

        let session = self.session.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        blocking(move || {
            let transfer_err = |message: String| ConnectionError::Transfer {
                remote: remote.clone(),
                message,
            };
            let content = std::fs::read(&local)
                .map_err(|e| transfer_err(format!("failed to read {}: {}", local.display(), e)))?;
            let sftp = session
                .sftp()
                .map_err(|e| transfer_err(format!("Failed to open SFTP: {}", e)))?;
            let mut remote_file = sftp
                .create(Path::new(&remote))
                .map_err(|e| transfer_err(format!("Failed to create remote file: {}", e)))?;
            remote_file
                .write_all(&content)
                .map_err(|e| transfer_err(format!("Failed to write remote file: {}", e)))
        })
        .await
    }

    fn has_pipelining(&self) -> bool {
        true
    }

    fn transport(&self) -> &str {
        "ssh"
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn user(&self) -> Option<&str> {
        Some(&self.user)
    }

    async fn close(&self) {
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            warn!(host = %self.host_name, error = %e, "ssh disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Bind then drop a listener to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let params = ConnectParams {
            host: "127.0.0.1".into(),
            port,
            transport: "ssh".into(),
            timeout_secs: 2,
            ..Default::default()
        };

        let err = SshConnector.connect(&params).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Connect { .. }));
        assert!(err.to_string().contains("127.0.0.1"));
    }

    #[test]
    fn test_password_prompter_answers_all_prompts() {
        let mut prompter = PasswordPrompter("pw".into());
        let prompts = [
            ssh2::Prompt {
                text: "Password: ".into(),
                echo: false,
            },
            ssh2::Prompt {
                text: "Again: ".into(),
                echo: false,
            },
        ];
        assert_eq!(prompter.prompt("u", "", &prompts), vec!["pw", "pw"]);
    }
}
