//! # shoal - multi-worker event server core
//!
//! Worker lifecycle, event dispatch and graceful shutdown for servers that
//! run their request handling on a pool of workers.
//!
//! ## Features
//!
//! - **Three topologies**: worker processes, worker threads, or one base loop
//! - **Graceful drain**: a stopping worker finishes queued writes before exit,
//!   bounded by `max_wait_time`
//! - **Request ceiling**: workers recycle themselves after `max_request`
//! - **Control surface**: `kill_worker`, `shutdown`, worker commands
//!
//! ## Quick Start
//!
//! ```ignore
//! use shoal::{Runtime, Server, ServerConfig, Topology};
//!
//! fn main() {
//!     shoal::init_logging();
//!
//!     let config = ServerConfig::new().topology(Topology::Thread).worker_num(4);
//!     let server = Server::builder(config)
//!         .on_pipe_message(|_, worker, ev| {
//!             tracing::info!(worker_id = worker.id, len = ev.data.len(), "message");
//!             Ok(())
//!         })
//!         .build()
//!         .unwrap();
//!
//!     let mut runtime = Runtime::new(server);
//!     runtime.block_on(|server| {
//!         // talk to the workers through server.send_control / pipes
//!     });
//! }
//! ```
//!
//! ## Shutdown
//!
//! ```text
//!   Running ──trigger──▶ Draining ──▶ ExitPending ──loop dry or deadline──▶ Terminated
//!      │                    │
//!      │ triggers:          └─ topology drain: listeners, connection reads,
//!      │  request ceiling      pipe reads, timers
//!      │  Shutdown record
//!      │  SIGTERM
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;

// Re-export core types
pub use shoal_core::{
    constants, flags, Code, DispatchMode, EventRecord, EventType, ShoalError, ShoalResult, Topology,
    WorkerStatus, WorkerType,
};
pub use shoal_core::error;
pub use shoal_core::log::{init as init_logging, init_with as init_logging_with, set_flush_enabled, LogSink};

// Re-export env utilities
pub use shoal_core::{env_get, env_get_bool, env_get_opt, env_get_str};

// Re-export runtime types
pub use shoal_runtime::{
    add_global_hook, start_worker, CallbackError, CallbackResult, Clock, EventData, GlobalHook,
    ManualClock, Server, ServerBuilder, ServerConfig, Session, SystemClock, Worker, WorkerContext,
    WorkerExit, WorkerSnapshot,
};
pub use shoal_runtime::{run_base_worker, spawn_thread_workers, ThreadWorkers};
#[cfg(unix)]
pub use shoal_runtime::fork_process_workers;

enum Running {
    Threads(ThreadWorkers),
    Base(JoinHandle<ShoalResult<i32>>),
}

/// Runtime handle for a built server
///
/// Thread and base topologies run in the background after `start()`.
/// Process topology forks and supervises from the calling thread, so it
/// only runs through `run()`.
pub struct Runtime {
    server: Arc<Server>,
    running: Option<Running>,
}

impl Runtime {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server, running: None }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Start the workers in the background
    pub fn start(&mut self) -> ShoalResult<()> {
        if self.running.is_some() {
            return Err(ShoalError::WrongOperation("runtime already started"));
        }
        let running = match self.server.config().topology {
            Topology::Thread => Running::Threads(spawn_thread_workers(&self.server)?),
            Topology::Base => {
                let server = self.server.clone();
                let handle = std::thread::Builder::new()
                    .name("shoal-base".into())
                    .spawn(move || run_base_worker(&server))?;
                Running::Base(handle)
            }
            Topology::Process => {
                return Err(ShoalError::WrongOperation("process topology runs through run()"));
            }
        };
        self.running = Some(running);
        Ok(())
    }

    /// Run until every worker has exited
    pub fn run(&mut self) -> ShoalResult<i32> {
        match self.server.config().topology {
            #[cfg(unix)]
            Topology::Process => fork_process_workers(&self.server),
            #[cfg(not(unix))]
            Topology::Process => Err(ShoalError::WrongOperation("process topology needs unix")),
            _ => {
                self.start()?;
                self.wait()
            }
        }
    }

    /// Run `f` with the workers started, then shut down
    pub fn block_on<F, T>(&mut self, f: F) -> ShoalResult<T>
    where
        F: FnOnce(&Arc<Server>) -> T,
    {
        self.start()?;
        let result = f(&self.server);
        self.shutdown()?;
        Ok(result)
    }

    /// Stop the server and wait for the workers
    pub fn shutdown(&mut self) -> ShoalResult<i32> {
        if self.running.is_none() {
            return Ok(0);
        }
        self.server.shutdown();
        self.wait()
    }

    fn wait(&mut self) -> ShoalResult<i32> {
        match self.running.take() {
            None => Ok(0),
            Some(Running::Threads(workers)) => {
                let mut code = 0;
                for (_, result) in workers.join() {
                    let c = result?;
                    if c != 0 {
                        code = c;
                    }
                }
                Ok(code)
            }
            Some(Running::Base(handle)) => handle.join().unwrap_or(Err(ShoalError::WorkerPanicked(0))),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(code = %e.code(), error = %e, "runtime shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_block_on_thread_runtime() {
        let stops = Arc::new(AtomicUsize::new(0));
        let seen = stops.clone();
        let config = ServerConfig::new().topology(Topology::Thread).worker_num(3);
        let server = Server::builder(config)
            .on_worker_stop(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let mut runtime = Runtime::new(server);
        let workers = runtime.block_on(|server| server.pool().total()).unwrap();
        assert_eq!(workers, 3);
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        assert!(!runtime.server().is_running());
    }

    #[test]
    fn test_process_runtime_has_no_background_start() {
        let config = ServerConfig::new().topology(Topology::Process).worker_num(1);
        let server = Server::builder(config).build().unwrap();
        let mut runtime = Runtime::new(server);
        assert!(matches!(runtime.start(), Err(ShoalError::WrongOperation(_))));
    }

    #[test]
    fn test_start_twice_fails() {
        let config = ServerConfig::new().topology(Topology::Base).worker_num(1);
        let mut runtime = Runtime::new(Server::builder(config).build().unwrap());
        runtime.start().unwrap();
        assert!(runtime.start().is_err());
        assert_eq!(runtime.shutdown().unwrap(), 0);
    }
}
