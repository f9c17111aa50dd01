// Error types for the fanout engine

use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;
use thiserror::Error;

use crate::template::TemplateError;

/// Decide whether error output should carry ANSI colors
fn should_use_colors() -> bool {
    // https://no-color.org/
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// All errors raised by the engine.
///
/// Host-scoped failures are captured by the per-host executor and turned into
/// a `ReturnData`; only `Interrupted`, `Config` and `Inventory` normally reach
/// the caller of `Runner::run`.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The transport could not reach or authenticate against the host
    #[error("FAILED: {message}")]
    ConnectionFailed { host: String, message: String },

    /// Remote temporary directory could not be created
    #[error("{0}")]
    TempPath(String),

    /// A templated variable added extra k=v pairs to the module arguments
    #[error(
        "A variable inserted a new parameter into the module args. \
         Be sure to quote variables if they contain equal signs (for example: \"{{{{var}}}}\")."
    )]
    ArgumentInjection { before: usize, after: usize },

    /// A templated variable smuggled an engine-internal marker into the arguments
    #[error("A variable tried to add {0} to the module arguments.")]
    ForbiddenArgument(String),

    /// Argument string could not be split (unbalanced quotes or template blocks)
    #[error("error parsing argument string '{0}', try quoting the entire line.")]
    ArgumentSyntax(String),

    /// Duplicate k=v parameter
    #[error("a duplicate parameter was found in the argument string ({0})")]
    DuplicateArgument(String),

    #[error("{message}")]
    ModuleNotFound {
        module: String,
        message: String,
        core_missing: bool,
    },

    #[error("module is missing interpreter line")]
    MissingInterpreter(String),

    #[error("One or more undefined variables: {0}")]
    UndefinedVariable(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("environment must be a dictionary, received {0}")]
    Environment(String),

    #[error("file transfer to {remote} failed: {message}")]
    Transfer { remote: String, message: String },

    /// The task cannot run as written (async with loops, async on a local action)
    #[error("{0}")]
    Task(String),

    #[error("interrupted")]
    Interrupted,

    /// A handler or worker broke its contract (wrong result type, panicked)
    #[error("internal error: {0}")]
    Contract(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TemplateError> for RunnerError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::Undefined(msg) => RunnerError::UndefinedVariable(msg),
            TemplateError::Render(msg) => RunnerError::Template(msg),
        }
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl RunnerError {
    /// True for errors caused by undefined template variables
    pub fn is_undefined(&self) -> bool {
        matches!(self, RunnerError::UndefinedVariable(_))
    }

    /// Render the error for a terminal, with a heading and an optional hint
    pub fn render(&self) -> String {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        let heading = match self {
            RunnerError::ConnectionFailed { .. } => "UNREACHABLE",
            RunnerError::TempPath(_) => "TEMP PATH ERROR",
            RunnerError::ArgumentInjection { .. }
            | RunnerError::ForbiddenArgument(_)
            | RunnerError::ArgumentSyntax(_)
            | RunnerError::DuplicateArgument(_) => "ARGUMENT ERROR",
            RunnerError::ModuleNotFound { .. } | RunnerError::MissingInterpreter(_) => {
                "MODULE ERROR"
            }
            RunnerError::UndefinedVariable(_) | RunnerError::Template(_) => "TEMPLATE ERROR",
            RunnerError::Task(_) => "TASK ERROR",
            RunnerError::Interrupted => "INTERRUPTED",
            RunnerError::Config(_) => "CONFIG ERROR",
            RunnerError::Inventory(_) => "INVENTORY ERROR",
            RunnerError::Io { .. } => "I/O ERROR",
            _ => "ERROR",
        };

        let mut out = format!("{}: {}\n", heading.red().bold(), self);

        match self {
            RunnerError::ConnectionFailed { host, .. } => {
                out.push_str(&format!("  {} {}\n", "Host:".dimmed(), host));
            }
            RunnerError::Io {
                path: Some(path), ..
            } => {
                out.push_str(&format!("  {} {}\n", "Path:".dimmed(), path.display()));
            }
            _ => {}
        }

        if let Some(hint) = suggest_fix(self) {
            out.push('\n');
            out.push_str(&format!("{}: {}\n", "Hint".yellow().bold(), hint));
        }

        out
    }
}

/// Suggest common fixes for errors
pub fn suggest_fix(error: &RunnerError) -> Option<String> {
    match error {
        RunnerError::ConnectionFailed { message, .. } => {
            let lower = message.to_lowercase();
            if lower.contains("refused") {
                Some("Ensure SSH service is running on the target host".to_string())
            } else if lower.contains("timed out") || lower.contains("timeout") {
                Some("Check network connectivity and firewall rules".to_string())
            } else if lower.contains("authentication") {
                Some("Verify SSH key or password is correct".to_string())
            } else {
                None
            }
        }
        RunnerError::ModuleNotFound {
            core_missing: true, ..
        } => Some("Add the core module directory with -M or enable builtin modules".to_string()),
        RunnerError::ModuleNotFound { .. } => {
            Some("Check the module name and the configured module paths".to_string())
        }
        RunnerError::UndefinedVariable(_) => {
            Some("Define the variable or guard the task with a `when` condition".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injection_message_mentions_quoting() {
        let err = RunnerError::ArgumentInjection {
            before: 1,
            after: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("inserted a new parameter"));
        assert!(msg.contains("\"{{var}}\""));
    }

    #[test]
    fn test_render_connection_error() {
        let err = RunnerError::ConnectionFailed {
            host: "web1".to_string(),
            message: "Connection refused".to_string(),
        };

        let clean = console::strip_ansi_codes(&err.render()).to_string();
        assert!(clean.contains("UNREACHABLE"));
        assert!(clean.contains("web1"));
        assert!(clean.contains("SSH service"));
    }

    #[test]
    fn test_template_error_conversion() {
        let err: RunnerError = TemplateError::Undefined("'foo' is undefined".into()).into();
        assert!(err.is_undefined());

        let err: RunnerError = TemplateError::Render("syntax".into()).into();
        assert!(!err.is_undefined());
    }
}
