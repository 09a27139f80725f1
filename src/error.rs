use thiserror::Error;

/// Errors surfaced by the supervisor and the process registry.
///
/// Clone is required so a single start attempt can deliver the same
/// outcome to every caller attached to it. Transient health-check
/// failures are absorbed inside the supervisor and never appear here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The OS could not launch the process at all. Not retried.
    #[error("failed to spawn process: {0}")]
    SpawnFailure(String),

    /// The service never answered its health check within the start
    /// timeout. The spawned process is left running; a later ensure()
    /// may attempt again.
    #[error("service '{name}' did not become healthy within {timeout_ms}ms")]
    StartTimeout { name: String, timeout_ms: u64 },

    /// A live process already exists under this logical id.
    #[error("process '{0}' is already running")]
    DuplicateProcess(String),

    /// No live process is registered under this logical id.
    #[error("no process registered under '{0}'")]
    ProcessNotFound(String),

    /// The input stream is gone: the process exited or stdin was
    /// explicitly closed. Recoverable, never a panic.
    #[error("stdin for process '{0}' is closed")]
    StreamClosed(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
