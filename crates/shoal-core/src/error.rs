//! Error types and stable error codes
//!
//! Every warning the runtime logs and every `ShoalError` it returns carries a
//! [`Code`]: a `{name, code}` pair where only the numeric code takes part in
//! equality. Codes live in the `6100..6200` range.
//!
//! The last error raised on the current thread is kept in a thread-local
//! slot so that callers of fire-and-forget control operations can inspect it.

use core::fmt;
use std::cell::Cell;
use std::io;

/// Stable identifier of an error condition
#[derive(Clone, Copy)]
pub struct Code {
    pub name: &'static str,
    pub code: u64,
}

impl Code {
    pub const fn new(name: &'static str, code: u64) -> Self {
        Self { name, code }
    }

    /// Sentinel for "no error"
    pub const NONE: Code = Code::new("none", 0);
}

impl PartialEq for Code {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Code {}

impl core::hash::Hash for Code {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.code.hash(state);
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.code)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ============================================================================
// Codes
// ============================================================================

pub const ERR_SESSION_DISCARD_DATA: Code = Code::new("session_discard_data", 6101);
pub const ERR_WORKER_EXIT_TIMEOUT: Code = Code::new("worker_exit_timeout", 6102);
pub const ERR_WORKER_UNPROCESSED_DATA: Code = Code::new("worker_unprocessed_data", 6103);
pub const ERR_INVALID_PARAMS: Code = Code::new("invalid_params", 6104);
pub const ERR_WRONG_OPERATION: Code = Code::new("wrong_operation", 6105);
pub const ERR_PROTOCOL: Code = Code::new("protocol_error", 6106);
pub const ERR_TEARDOWN: Code = Code::new("teardown_failed", 6107);
pub const ERR_UNKNOWN_COMMAND: Code = Code::new("unknown_command", 6108);
pub const ERR_WORKER_SHUTTING_DOWN: Code = Code::new("worker_shutting_down", 6109);
pub const ERR_CONFIG: Code = Code::new("config_invalid", 6110);
pub const ERR_PIPE_UNAVAILABLE: Code = Code::new("pipe_unavailable", 6111);
pub const ERR_NOT_RUNNING: Code = Code::new("not_running", 6112);
pub const ERR_IO: Code = Code::new("io_error", 6113);
pub const ERR_WORKER_PANICKED: Code = Code::new("worker_panicked", 6114);

// ============================================================================
// ShoalError
// ============================================================================

/// Result type for coordinator operations
pub type ShoalResult<T> = Result<T, ShoalError>;

/// Errors returned synchronously to callers
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    /// Target worker id outside `[0, worker_num + task_worker_num)`
    #[error("worker id {id} out of range (total {total})")]
    InvalidTarget { id: usize, total: usize },

    /// Parameter rejected by the control surface
    #[error("invalid parameter: {0}")]
    InvalidParams(String),

    /// Target has no usable pipe in this topology
    #[error("worker {0} has no usable pipe")]
    PipeUnavailable(usize),

    /// Target's pipe stayed full for the whole control-send wait
    #[error("pipe of worker {0} is full")]
    PipeFull(usize),

    /// Operation not valid in the calling context
    #[error("wrong operation: {0}")]
    WrongOperation(&'static str),

    /// Malformed message on a worker pipe
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Fatal configuration problem, reported at build time
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Command id with no registered handler
    #[error("unknown command {0}")]
    UnknownCommand(u32),

    /// Server is not running
    #[error("server not running")]
    NotRunning,

    /// A worker thread panicked instead of returning
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShoalError {
    /// Stable code for this error
    pub fn code(&self) -> Code {
        match self {
            ShoalError::InvalidTarget { .. } | ShoalError::InvalidParams(_) => ERR_INVALID_PARAMS,
            ShoalError::PipeUnavailable(_) | ShoalError::PipeFull(_) => ERR_PIPE_UNAVAILABLE,
            ShoalError::WrongOperation(_) => ERR_WRONG_OPERATION,
            ShoalError::Protocol(_) => ERR_PROTOCOL,
            ShoalError::Config(_) => ERR_CONFIG,
            ShoalError::UnknownCommand(_) => ERR_UNKNOWN_COMMAND,
            ShoalError::NotRunning => ERR_NOT_RUNNING,
            ShoalError::WorkerPanicked(_) => ERR_WORKER_PANICKED,
            ShoalError::Io(_) => ERR_IO,
        }
    }
}

// ============================================================================
// Last-error slot
// ============================================================================

thread_local! {
    static LAST_ERROR: Cell<Code> = const { Cell::new(Code::NONE) };
}

/// Record `code` as the last error of this thread
#[inline]
pub fn set_last_error(code: Code) {
    LAST_ERROR.with(|c| c.set(code));
}

/// Last error recorded on this thread, `Code::NONE` if cleared
#[inline]
pub fn last_error() -> Code {
    LAST_ERROR.with(|c| c.get())
}

#[inline]
pub fn clear_last_error() {
    set_last_error(Code::NONE);
}
