// Plugin infrastructure: run callbacks

pub mod callbacks;

pub use callbacks::{
    AggregateStats, CallbackManager, HostStats, JsonLogCallback, ResultMap, RunnerCallbacks,
};
