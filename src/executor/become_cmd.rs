// Privilege escalation command wrapping

use std::fmt;
use std::str::FromStr;

use rand::distributions::Uniform;
use rand::Rng;

use crate::output::errors::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeMethod {
    Sudo,
    Su,
    Pbrun,
    Pfexec,
    Doas,
}

impl BecomeMethod {
    fn default_exe(self) -> &'static str {
        match self {
            BecomeMethod::Sudo => "sudo",
            BecomeMethod::Su => "su",
            BecomeMethod::Pbrun => "pbrun",
            BecomeMethod::Pfexec => "pfexec",
            BecomeMethod::Doas => "doas",
        }
    }

    fn default_flags(self) -> &'static str {
        match self {
            BecomeMethod::Sudo => "-H",
            _ => "",
        }
    }

    /// `su` reads its password from a terminal, so stdin cannot carry a module
    pub fn supports_pipelining(self) -> bool {
        !matches!(self, BecomeMethod::Su)
    }
}

impl FromStr for BecomeMethod {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sudo" => Ok(BecomeMethod::Sudo),
            "su" => Ok(BecomeMethod::Su),
            "pbrun" => Ok(BecomeMethod::Pbrun),
            "pfexec" => Ok(BecomeMethod::Pfexec),
            "doas" => Ok(BecomeMethod::Doas),
            other => Err(RunnerError::Config(format!(
                "Privilege escalation method not found: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for BecomeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_exe())
    }
}

/// Resolved escalation settings for one host execution
#[derive(Clone, PartialEq, Eq)]
pub struct BecomeSpec {
    pub method: BecomeMethod,
    pub user: String,
    pub password: Option<String>,
    pub exe: Option<String>,
    pub flags: Option<String>,
}

impl fmt::Debug for BecomeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BecomeSpec")
            .field("method", &self.method)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("exe", &self.exe)
            .finish()
    }
}

/// A command wrapped for escalation
#[derive(Debug, Clone)]
pub struct BecomeCommand {
    pub command: String,
    /// Echoed before the real command runs; output before it is noise
    pub success_key: String,
    /// Line to write to stdin before any payload
    pub stdin_prefix: Option<String>,
}

impl BecomeSpec {
    pub fn new(method: BecomeMethod, user: impl Into<String>) -> Self {
        BecomeSpec {
            method,
            user: user.into(),
            password: None,
            exe: None,
            flags: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_exe(mut self, exe: Option<String>) -> Self {
        self.exe = exe;
        self
    }

    /// True when escalating to anyone other than root
    pub fn is_unprivileged(&self) -> bool {
        self.user != "root"
    }

    /// Wrap `cmd` so it runs as the target user through `shell`
    pub fn wrap(&self, cmd: &str, shell: &str) -> BecomeCommand {
        let randbits: String = rand::thread_rng()
            .sample_iter(Uniform::new_inclusive(b'a', b'z'))
            .take(32)
            .map(char::from)
            .collect();
        let success_key = format!("BECOME-SUCCESS-{}", randbits);

        let exe = self
            .exe
            .as_deref()
            .unwrap_or_else(|| self.method.default_exe());
        let flags = self
            .flags
            .as_deref()
            .unwrap_or_else(|| self.method.default_flags());
        let inner = shell_words::quote(&format!("echo {}; {}", success_key, cmd)).into_owned();
        let user = shell_words::quote(&self.user).into_owned();

        let wrapped = match self.method {
            BecomeMethod::Sudo => format!(
                "{exe} -k && {exe} {flags} -S -p \"[sudo via fanout, key={bits}] password: \" -u {user} {shell} -c {inner}",
                bits = randbits,
            ),
            BecomeMethod::Su => format!(
                "{exe} {flags} {user} -c {}",
                shell_words::quote(&format!("{} -c {}", shell, inner))
            ),
            BecomeMethod::Pbrun => format!("{exe} -b {flags} -u {user} {inner}"),
            // pfexec resolves the user from its own exec attributes
            BecomeMethod::Pfexec => format!("{exe} {flags} {shell} -c {inner}"),
            BecomeMethod::Doas => format!("{exe} {flags} -u {user} {shell} -c {inner}"),
        };

        let command = format!("{} -c {}", shell, shell_words::quote(&wrapped));
        let stdin_prefix = self
            .password
            .as_ref()
            .filter(|_| matches!(self.method, BecomeMethod::Sudo | BecomeMethod::Su | BecomeMethod::Pbrun))
            .map(|p| format!("{}\n", p));

        BecomeCommand {
            command,
            success_key,
            stdin_prefix,
        }
    }
}

impl BecomeCommand {
    /// Drop everything up to and including the success marker line
    pub fn strip_marker<'a>(&self, stdout: &'a str) -> &'a str {
        match stdout.find(&self.success_key) {
            Some(pos) => {
                let rest = &stdout[pos + self.success_key.len()..];
                rest.strip_prefix("\r\n")
                    .or_else(|| rest.strip_prefix('\n'))
                    .unwrap_or(rest)
            }
            None => stdout,
        }
    }

    /// Bytes for stdin: the password line first, then any payload
    pub fn stdin(&self, payload: Option<&[u8]>) -> Option<Vec<u8>> {
        match (&self.stdin_prefix, payload) {
            (None, None) => None,
            (prefix, payload) => {
                let mut data = prefix.clone().unwrap_or_default().into_bytes();
                if let Some(p) = payload {
                    data.extend_from_slice(p);
                }
                Some(data)
            }
        }
    }
}
