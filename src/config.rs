// Engine configuration: TOML file, then FANOUT_* environment, then CLI

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::output::errors::RunnerError;

/// Settings shared by every host execution of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound on parallel host workers
    pub forks: usize,
    /// Base for per-task remote temp directories
    pub remote_tmp: String,
    /// World-accessible base used when escalating to a non-root user
    pub system_tmp: String,
    /// Leave generated remote files in place after the task
    pub keep_remote_files: bool,
    /// Pipe new-style modules over stdin when the connection allows it
    pub pipelining: bool,
    /// Directories searched for modules, in order
    pub module_paths: Vec<PathBuf>,
    /// Fall back to the modules compiled into the binary
    pub builtin_modules: bool,
    pub remote_port: u16,
    pub remote_user: Option<String>,
    /// Transport name: `ssh`, `smart`, `paramiko` or `local`
    pub transport: String,
    /// Shell used to run remote commands
    pub executable: String,
    /// Value of LANG/LC_CTYPE/LC_MESSAGES on the remote side
    pub module_lang: String,
    pub become_method: String,
    pub become_user: String,
    pub become_exe: Option<String>,
    pub error_on_undefined_vars: bool,
    pub private_key_file: Option<PathBuf>,
    /// Connection timeout in seconds
    pub timeout: u64,
    /// Seconds between polls of background jobs
    pub poll_interval: u64,
    pub verbosity: u8,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            forks: 5,
            remote_tmp: "$HOME/.fanout/tmp".to_string(),
            system_tmp: "/tmp".to_string(),
            keep_remote_files: false,
            pipelining: false,
            module_paths: Vec::new(),
            builtin_modules: true,
            remote_port: 22,
            remote_user: None,
            transport: "ssh".to_string(),
            executable: "/bin/sh".to_string(),
            module_lang: "C".to_string(),
            become_method: "sudo".to_string(),
            become_user: "root".to_string(),
            become_exe: None,
            error_on_undefined_vars: true,
            private_key_file: None,
            timeout: 10,
            poll_interval: 15,
            verbosity: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    defaults: RunnerConfig,
}

impl RunnerConfig {
    /// Load configuration from an explicit file, `FANOUT_CONFIG`, or
    /// `./fanout.toml`, then apply environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self, RunnerError> {
        let mut config = match Self::find_config_file(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => RunnerConfig::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(env_path) = std::env::var("FANOUT_CONFIG") {
            return Some(PathBuf::from(env_path));
        }
        let local = PathBuf::from("fanout.toml");
        local.is_file().then_some(local)
    }

    pub fn from_file(path: &Path) -> Result<Self, RunnerError> {
        let content = std::fs::read_to_string(path).map_err(|e| RunnerError::Io {
            message: format!("Failed to read config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        debug!(path = %path.display(), "loaded configuration file");
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, RunnerError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| RunnerError::Config(e.to_string()))?;
        Ok(file.defaults)
    }

    /// Apply `FANOUT_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn flag(value: &str) -> bool {
            matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "yes" | "true" | "on"
            )
        }

        if let Some(v) = lookup("FANOUT_FORKS").and_then(|v| v.parse().ok()) {
            self.forks = v;
        }
        if let Some(v) = lookup("FANOUT_REMOTE_TMP") {
            self.remote_tmp = v;
        }
        if let Some(v) = lookup("FANOUT_KEEP_REMOTE_FILES") {
            self.keep_remote_files = flag(&v);
        }
        if let Some(v) = lookup("FANOUT_PIPELINING") {
            self.pipelining = flag(&v);
        }
        if let Some(v) = lookup("FANOUT_LIBRARY") {
            self.module_paths = std::env::split_paths(&v).collect();
        }
        if let Some(v) = lookup("FANOUT_REMOTE_PORT").and_then(|v| v.parse().ok()) {
            self.remote_port = v;
        }
        if let Some(v) = lookup("FANOUT_REMOTE_USER") {
            self.remote_user = Some(v);
        }
        if let Some(v) = lookup("FANOUT_TRANSPORT") {
            self.transport = v;
        }
        if let Some(v) = lookup("FANOUT_EXECUTABLE") {
            self.executable = v;
        }
        if let Some(v) = lookup("FANOUT_MODULE_LANG") {
            self.module_lang = v;
        }
        if let Some(v) = lookup("FANOUT_BECOME_METHOD") {
            self.become_method = v;
        }
        if let Some(v) = lookup("FANOUT_BECOME_USER") {
            self.become_user = v;
        }
        if let Some(v) = lookup("FANOUT_BECOME_EXE") {
            self.become_exe = Some(v);
        }
        if let Some(v) = lookup("FANOUT_ERROR_ON_UNDEFINED_VARS") {
            self.error_on_undefined_vars = flag(&v);
        }
        if let Some(v) = lookup("FANOUT_PRIVATE_KEY_FILE") {
            self.private_key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FANOUT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.timeout = v;
        }
    }

    /// Forks clamped to at least one worker
    pub fn effective_forks(&self) -> usize {
        self.forks.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.forks, 5);
        assert_eq!(config.remote_port, 22);
        assert_eq!(config.executable, "/bin/sh");
        assert!(!config.pipelining);
        assert!(config.error_on_undefined_vars);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RunnerConfig::from_toml(
            r#"
[defaults]
forks = 20
pipelining = true
module_paths = ["/opt/modules"]
"#,
        )
        .unwrap();

        assert_eq!(config.forks, 20);
        assert!(config.pipelining);
        assert_eq!(config.module_paths, vec![PathBuf::from("/opt/modules")]);
        assert_eq!(config.transport, "ssh");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[defaults]\nremote_user = \"deploy\"").unwrap();

        let config = RunnerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.remote_user.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = RunnerConfig::from_toml("[defaults]\nforks = \"many\"").unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FANOUT_FORKS", "12"),
            ("FANOUT_PIPELINING", "yes"),
            ("FANOUT_REMOTE_USER", "ops"),
            ("FANOUT_TIMEOUT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = RunnerConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.forks, 12);
        assert!(config.pipelining);
        assert_eq!(config.remote_user.as_deref(), Some("ops"));
        assert_eq!(config.timeout, 10);
    }
}
