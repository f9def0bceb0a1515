//! Application callbacks and lifecycle hooks
//!
//! Callbacks are opaque to the runtime: it decides *when* they run and keeps
//! worker status and counters consistent around them, nothing more.
//!
//! Hooks come in two scopes. Server hooks are registered on the builder and
//! belong to one server. Global hooks are process-wide and run before the
//! server-level ones.

use std::sync::{Arc, Mutex, OnceLock};

use shoal_core::EventRecord;

use crate::context::WorkerContext;
use crate::message_bus::EventData;
use crate::reactor::{FdKind, Readiness};
use crate::server::Server;
use crate::worker::Worker;

/// Failure reported by an application callback
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<&str> for CallbackError {
    fn from(s: &str) -> Self {
        CallbackError(s.to_string())
    }
}

impl From<String> for CallbackError {
    fn from(s: String) -> Self {
        CallbackError(s)
    }
}

pub type CallbackResult = Result<(), CallbackError>;

/// How a worker occupant ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled(i32),
}

impl WorkerExit {
    #[inline]
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::Exited(0))
    }
}

pub type DataHandler = Arc<dyn Fn(&Server, &Worker, &EventData<'_>) -> CallbackResult + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&Server, &Worker, &EventRecord) + Send + Sync>;
pub type WorkerHandler = Arc<dyn Fn(&Server, &Worker) + Send + Sync>;
pub type WorkerErrorHandler = Arc<dyn Fn(&Server, &Worker, WorkerExit) + Send + Sync>;
pub type ServerHandler = Arc<dyn Fn(&Server) + Send + Sync>;
/// Command handler: arguments in, reply bytes or error text out
pub type CommandHandler = Arc<dyn Fn(&Server, &[u8]) -> Result<Vec<u8>, String> + Send + Sync>;
pub type CoroutineCounter = Arc<dyn Fn() -> usize + Send + Sync>;
/// Readiness on a listener or connection registered in a worker loop
pub type SocketHandler = Arc<dyn Fn(&mut WorkerContext, Readiness, FdKind) + Send + Sync>;

#[derive(Default, Clone)]
pub struct Callbacks {
    pub on_receive: Option<DataHandler>,
    pub on_packet: Option<DataHandler>,
    pub on_connect: Option<EventHandler>,
    pub on_close: Option<EventHandler>,
    pub on_buffer_full: Option<EventHandler>,
    pub on_buffer_empty: Option<EventHandler>,
    pub on_finish: Option<DataHandler>,
    pub on_pipe_message: Option<DataHandler>,
    pub on_worker_start: Option<WorkerHandler>,
    pub on_worker_stop: Option<WorkerHandler>,
    pub on_worker_exit: Option<WorkerHandler>,
    pub on_worker_error: Option<WorkerErrorHandler>,
    pub on_before_shutdown: Option<ServerHandler>,
    pub on_socket_ready: Option<SocketHandler>,
    pub coroutine_count: Option<CoroutineCounter>,
}

/// Server-scoped hooks
#[derive(Default, Clone)]
pub struct ServerHooks {
    pub worker_start: Vec<WorkerHandler>,
    pub worker_stop: Vec<WorkerHandler>,
}

// ── Global hooks ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalHook {
    BeforeWorkerStart,
    BeforeWorkerStop,
    /// Runs once, for the first event worker to drain after the server stopped
    BeforeServerShutdown,
}

type HookList = Mutex<Vec<(GlobalHook, WorkerHandler)>>;

static GLOBAL_HOOKS: OnceLock<HookList> = OnceLock::new();

fn global_hooks() -> &'static HookList {
    GLOBAL_HOOKS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a process-wide hook
pub fn add_global_hook<F>(kind: GlobalHook, f: F)
where
    F: Fn(&Server, &Worker) + Send + Sync + 'static,
{
    global_hooks()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push((kind, Arc::new(f)));
}

/// Run every global hook of `kind`, in registration order
pub fn run_global_hooks(kind: GlobalHook, server: &Server, worker: &Worker) {
    let hooks: Vec<WorkerHandler> = global_hooks()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|(k, _)| *k == kind)
        .map(|(_, h)| h.clone())
        .collect();
    for hook in hooks {
        hook(server, worker);
    }
}
