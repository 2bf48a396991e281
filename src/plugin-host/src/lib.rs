//! Worker-pool orchestration for a single loaded plugin: spawns and
//! supervises `plugin-worker` child processes, dispatches invocations to
//! them, and keeps the pool alive across crashes and load failures.

mod error;
mod pool;
mod worker;

pub use error::HostError;
pub use pool::{PluginHost, PoolLifecycle, PoolStatus, MAX_LOAD_FAILURES, RELOAD_DELAY};
pub use worker::{Worker, WorkerState};
