//! # shoal-runtime
//!
//! Worker loops, pipes and the shutdown coordinator for the shoal server.
//!
//! This crate provides:
//! - The worker pool and per-worker pipes
//! - An event loop over a pluggable poller (`poll(2)` by default)
//! - The event dispatcher and the shutdown coordinator
//! - Topology strategies for process, thread and base workers
//! - Signal handling and worker launchers

pub mod config;
pub mod clock;
pub mod pipe;
pub mod message_bus;
pub mod worker;
pub mod session;
pub mod reactor;
pub mod callbacks;
pub mod server;
pub mod context;
pub mod topology;
pub mod shutdown;
pub mod dispatcher;
pub mod signal;
pub mod entry;
pub mod launcher;
pub mod tls;

// Re-exports
pub use config::ServerConfig;
pub use clock::{Clock, ManualClock, SystemClock};
pub use callbacks::{add_global_hook, CallbackError, CallbackResult, GlobalHook, WorkerExit};
pub use context::WorkerContext;
pub use entry::start_worker;
pub use launcher::{run_base_worker, spawn_thread_workers, ThreadWorkers};
#[cfg(unix)]
pub use launcher::fork_process_workers;
pub use message_bus::{EventData, MessageBus};
pub use reactor::{EventLoop, FdKind, Interest, PollPoller, Poller, Readiness};
pub use server::{Server, ServerBuilder, WorkerStopMessage};
pub use session::{Session, SessionTable};
pub use shutdown::{stop_async_worker, Phase, Trigger};
pub use worker::{Worker, WorkerPool, WorkerSnapshot};
