//! # shoal-core
//!
//! Core types for the shoal worker lifecycle and shutdown coordinator.
//!
//! This crate is platform-agnostic and contains no event-loop or OS code.
//! Pipes, signals and the worker loop live in `shoal-runtime`.
//!
//! ## Modules
//!
//! - `state` - Worker status, worker type, topology and dispatch mode enums
//! - `event` - The 24-byte event header exchanged over worker pipes
//! - `error` - Error type, stable error codes and the last-error slot
//! - `log` - Reopenable log sink and `tracing` subscriber setup
//! - `env` - Environment variable utilities

pub mod state;
pub mod event;
pub mod error;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use state::{DispatchMode, Topology, WorkerStatus, WorkerType};
pub use event::{flags, EventRecord, EventType};
pub use error::{Code, ShoalError, ShoalResult};
pub use log::LogSink;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Protocol and sizing constants
pub mod constants {
    /// Size of the fixed event header on worker pipes
    pub const EVENT_HEAD_SIZE: usize = 24;

    /// Maximum workers (event + task) in one pool
    pub const MAX_WORKERS: usize = 1024;

    /// Default graceful exit budget in seconds
    pub const DEFAULT_MAX_WAIT_TIME: u64 = 3;

    /// Default largest payload carried by a single pipe datagram
    pub const DEFAULT_IPC_MAX_SIZE: usize = 8192;

    /// Default loop poll timeout in milliseconds (-1 = infinite)
    pub const DEFAULT_LOOP_TIMEOUT_MS: i64 = -1;

    /// No-worker sentinel for thread-local identity
    pub const WORKER_NONE: usize = usize::MAX;
}
