// fanout - host-fanout task execution engine
//
// Ships a module to every host matching a pattern, runs it (optionally
// escalated, delegated, retried or in the background) and partitions the
// outcomes into contacted and unreachable hosts.

pub mod actions;
pub mod config;
pub mod executor;
pub mod inventory;
pub mod modules;
pub mod output;
pub mod plugins;
pub mod template;
pub mod value;
pub mod vars;

pub use config::RunnerConfig;
pub use executor::{AsyncPoller, ReturnData, RunContext, RunResults, Runner, TaskSpec};
pub use inventory::{Host, HostGroup, Inventory};
pub use output::RunnerError;

/// Version of the fanout engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::RunnerConfig;
    pub use crate::executor::{RunContext, RunResults, Runner, TaskSpec};
    pub use crate::inventory::{Host, Inventory};
    pub use crate::output::RunnerError;
    pub use crate::plugins::{CallbackManager, RunnerCallbacks};
}
