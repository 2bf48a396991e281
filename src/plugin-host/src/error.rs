//! Host-local error taxonomy — failures that never cross the worker
//! boundary (`plugin_protocol::ErrorDetails` is reserved for that). Plays
//! the role `hyperlight_host::HyperlightError` plays for the teacher.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker process exited unexpectedly")]
    WorkerCrashed,

    #[error("worker I/O error: {0}")]
    Io(#[from] plugin_protocol::FramingError),

    #[error("no invocation found for token {0}")]
    UnknownInvocation(Uuid),

    #[error("plugin host is shutting down")]
    ShuttingDown,

    #[error("plugin host has no ready worker to serve this invocation")]
    NotReady,

    #[error("operation timed out waiting for a worker")]
    PoolExhausted,
}
