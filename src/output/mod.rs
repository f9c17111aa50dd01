// Output: error types, file diffs and the terminal printer

pub mod diff;
pub mod errors;
pub mod terminal;

pub use diff::{file_diff, generate_unified_diff, render_diff};
pub use errors::RunnerError;
pub use terminal::{format_result, Status, TerminalCallback};

/// How the binary reports results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Per-host lines as hosts finish
    #[default]
    Text,
    /// One JSON document with contacted and dark hosts after the run
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (expected text or json)", other)),
        }
    }
}
