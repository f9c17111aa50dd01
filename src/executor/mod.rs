// Executor module - host fanout engine and its connection seam

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::output::errors::RunnerError;

pub mod args;
pub mod async_jobs;
pub mod become_cmd;
pub mod context;
pub mod host;
pub mod local;
pub mod results;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod shell;
pub mod ssh;
pub mod target;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use async_jobs::{AsyncPoller, PollResults};
pub use become_cmd::{BecomeMethod, BecomeSpec};
pub use context::{RunContext, RunContextBuilder, RunLocks};
pub use host::HostExecutor;
pub use local::{LocalConnection, LocalConnector};
pub use results::{parse_json, partition, ReturnData, RunResults};
pub use scheduler::Runner;
pub use session::{ExecuteOptions, HostSession};
pub use shell::Shell;
pub use ssh::{SshConnection, SshConnector};
pub use target::{DelegateContext, Target};
pub use task::TaskSpec;

/// Transports whose exit status 255 means the SSH layer itself failed
pub const SSH_TRANSPORTS: &[&str] = &["ssh", "smart", "paramiko"];

/// Errors raised by connection implementations
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("authentication failed for {user}@{host}")]
    Auth { host: String, user: String },

    #[error("command execution failed: {0}")]
    Exec(String),

    #[error("file transfer to {remote} failed: {message}")]
    Transfer { remote: String, message: String },

    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Classify for the engine: transfer failures keep their kind, everything
    /// else means the host could not be reached
    pub fn into_runner_error(self, host: &str) -> RunnerError {
        match self {
            ConnectionError::Transfer { remote, message } => RunnerError::Transfer { remote, message },
            other => RunnerError::ConnectionFailed {
                host: host.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Everything a connector needs to open one host connection
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub transport: String,
    pub private_key_file: Option<String>,
    /// Inventory host the connection acts for, when it differs from `host`
    pub delegate_host: Option<String>,
    pub timeout_secs: u64,
}

/// One remote command invocation
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: String,
    pub tmp: Option<String>,
    /// Escalation to apply; honored only when `sudoable` is set
    pub escalation: Option<BecomeSpec>,
    pub sudoable: bool,
    pub executable: Option<String>,
    /// Bytes written to the command's stdin (pipelined module payload)
    pub in_data: Option<Vec<u8>>,
}

impl ExecRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        ExecRequest {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    /// The escalation that actually applies to this command
    pub fn effective_become(&self) -> Option<&BecomeSpec> {
        if self.sudoable {
            self.escalation.as_ref()
        } else {
            None
        }
    }
}

/// Result of executing a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Common trait for all connection types (SSH, local, etc.)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a command and return the result
    async fn exec_command(&self, req: ExecRequest) -> Result<CommandResult, ConnectionError>;

    /// Copy a local file to the target
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError>;

    /// Whether module payloads may be piped over stdin
    fn has_pipelining(&self) -> bool;

    /// Shell dialect the transport prefers, if any
    fn default_shell(&self) -> Option<&str> {
        None
    }

    /// File suffixes tried when locating modules for this transport
    fn module_suffixes(&self) -> &[&str] {
        &["", ".sh", ".py"]
    }

    /// Transport name (`ssh`, `local`, ...)
    fn transport(&self) -> &str;

    /// Get the host name for this connection
    fn host_name(&self) -> &str;

    /// The user commands run as before escalation
    fn user(&self) -> Option<&str>;

    async fn close(&self) {}
}

/// Opens connections; one implementation per set of transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Routes `local` to [`LocalConnector`] and the SSH family to [`SshConnector`]
#[derive(Default)]
pub struct DefaultConnector {
    local: LocalConnector,
    ssh: SshConnector,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, ConnectionError> {
        match params.transport.as_str() {
            "local" => self.local.connect(params).await,
            t if SSH_TRANSPORTS.contains(&t) => self.ssh.connect(params).await,
            other => Err(ConnectionError::UnsupportedTransport(other.to_string())),
        }
    }
}
