// Scripted connection used by executor, dispatcher and poller tests

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::context::RunContextBuilder;
use super::{CommandResult, ConnectParams, Connection, ConnectionError, Connector, ExecRequest};
use crate::inventory::Inventory;

/// One command seen by a mock connection
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub host: String,
    pub cmd: String,
    pub escalated: bool,
    pub stdin: Option<Vec<u8>>,
}

impl ExecRecord {
    pub fn stdin_text(&self) -> String {
        self.stdin
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default()
    }
}

/// One file transfer seen by a mock connection
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub host: String,
    pub remote: String,
    pub content: String,
}

struct Rule {
    needle: String,
    replies: VecDeque<CommandResult>,
}

#[derive(Default)]
pub struct MockState {
    pub connects: Mutex<Vec<ConnectParams>>,
    pub commands: Mutex<Vec<ExecRecord>>,
    pub puts: Mutex<Vec<PutRecord>>,
    rules: Mutex<Vec<Rule>>,
    unreachable: Mutex<HashSet<String>>,
    no_pipelining: Mutex<bool>,
}

impl MockState {
    fn reply_for(&self, cmd: &str) -> CommandResult {
        let mut rules = self.rules.lock();
        if let Some(rule) = rules.iter_mut().find(|r| cmd.contains(&r.needle)) {
            // The last scripted reply repeats
            if rule.replies.len() > 1 {
                if let Some(reply) = rule.replies.pop_front() {
                    return reply;
                }
            }
            if let Some(reply) = rule.replies.front() {
                return reply.clone();
            }
        }

        if cmd.contains("mkdir -p") {
            if let Some(pos) = cmd.rfind("echo ") {
                return ok(&format!("{}\n", &cmd[pos + 5..]));
            }
        }
        ok("")
    }
}

pub fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn exited(exit_code: i32, stdout: &str, stderr: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

/// Connector whose connections replay scripted output
#[derive(Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `needle` with `stdout`
    pub fn reply(&self, needle: &str, stdout: &str) -> &Self {
        self.reply_seq(needle, vec![ok(stdout)])
    }

    /// Answer commands containing `needle` with each result in turn
    pub fn reply_seq(&self, needle: &str, replies: Vec<CommandResult>) -> &Self {
        self.state.rules.lock().push(Rule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn unreachable(&self, host: &str) -> &Self {
        self.state.unreachable.lock().insert(host.to_string());
        self
    }

    pub fn without_pipelining(&self) -> &Self {
        *self.state.no_pipelining.lock() = true;
        self
    }

    pub fn commands(&self) -> Vec<ExecRecord> {
        self.state.commands.lock().clone()
    }

    pub fn commands_matching(&self, needle: &str) -> Vec<ExecRecord> {
        self.commands()
            .into_iter()
            .filter(|c| c.cmd.contains(needle))
            .collect()
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.state.puts.lock().clone()
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.state.connects.lock().clone()
    }

    /// Context builder wired to this connector
    pub fn context(&self, inventory: Inventory) -> RunContextBuilder {
        RunContextBuilder::new(Arc::new(inventory)).connector(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, ConnectionError> {
        self.state.connects.lock().push(params.clone());
        let name = params.delegate_host.clone().unwrap_or_else(|| params.host.clone());
        if self.state.unreachable.lock().contains(&params.host) {
            return Err(ConnectionError::Connect {
                host: params.host.clone(),
                message: "Connection refused".to_string(),
            });
        }
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            host_name: name,
            user: params.user.clone(),
            pipelining: !*self.state.no_pipelining.lock(),
        }))
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    host_name: String,
    user: Option<String>,
    pipelining: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn exec_command(&self, req: ExecRequest) -> Result<CommandResult, ConnectionError> {
        let escalated = req.effective_become().is_some();
        self.state.commands.lock().push(ExecRecord {
            host: self.host_name.clone(),
            cmd: req.cmd.clone(),
            escalated,
            stdin: req.in_data.clone(),
        });
        Ok(self.state.reply_for(&req.cmd))
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError> {
        let content = std::fs::read_to_string(local)?;
        self.state.puts.lock().push(PutRecord {
            host: self.host_name.clone(),
            remote: remote.to_string(),
            content,
        });
        Ok(())
    }

    fn has_pipelining(&self) -> bool {
        self.pipelining
    }

    fn transport(&self) -> &str {
        "ssh"
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}
