//! Server: shared state of every worker
//!
//! A `Server` is built once, wrapped in an `Arc` and handed to every worker
//! loop. It owns the worker pool, the session table, the listening sockets
//! and the application callbacks, and exposes the control surface
//! (`kill_worker`, `shutdown`, `handle_worker_exit`).

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use shoal_core::error::set_last_error;
use shoal_core::{EventRecord, ShoalError, ShoalResult, Topology, WorkerType};

use crate::callbacks::{
    CallbackResult, Callbacks, CommandHandler, CoroutineCounter, ServerHooks, SocketHandler, WorkerExit,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::context::WorkerContext;
use crate::message_bus::EventData;
use crate::pipe::{PipeEnd, WorkerPipe};
use crate::reactor::{FdKind, Readiness};
use crate::session::SessionTable;
use crate::tls;
use crate::worker::{send_record, Worker, WorkerPool};

/// Capacity of the Base-topology worker-stop queue
const STOP_QUEUE_CAPACITY: usize = 64;

/// Notice that a worker began draining, for the task pool / supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStopMessage {
    pub pid: i32,
    pub worker_id: usize,
}

pub struct Server {
    config: ServerConfig,
    pool: WorkerPool,
    sessions: SessionTable,
    listeners: Vec<TcpListener>,
    callbacks: Callbacks,
    hooks: ServerHooks,
    commands: HashMap<u32, CommandHandler>,
    running: AtomicBool,
    /// Requests served by every worker of this process
    request_count: AtomicU64,
    stop_queue: ArrayQueue<WorkerStopMessage>,
    /// Receive pipe of the Base-topology event loop
    control: WorkerPipe,
    clock: Arc<dyn Clock>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[inline]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    #[inline]
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    #[inline]
    pub fn hooks(&self) -> &ServerHooks {
        &self.hooks
    }

    #[inline]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn listener_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|l| l.as_raw_fd()).collect()
    }

    pub fn command(&self, id: u32) -> Option<&CommandHandler> {
        self.commands.get(&id)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    #[inline]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_request_count(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Endpoint worker `id` reads its events from
    pub fn receive_end(&self, id: usize) -> Option<&PipeEnd> {
        let worker = self.pool.get(id)?;
        match worker.pipe_worker() {
            Some(end) => Some(end),
            None if self.is_base_loop(worker) => Some(&self.control.worker),
            None => None,
        }
    }

    fn is_base_loop(&self, worker: &Worker) -> bool {
        self.config.topology == Topology::Base && worker.kind == WorkerType::Event
    }

    /// Deliver a control record to worker `id`
    pub fn send_control(&self, id: usize, record: &EventRecord) -> ShoalResult<()> {
        let worker = self.pool.worker(id)?;
        if worker.pipe().is_none() && self.is_base_loop(worker) {
            return send_record(&self.control.master, id, record);
        }
        self.pool.send_control(id, record)
    }

    /// Ask a worker to shut down gracefully
    ///
    /// `None` targets the worker bound to the calling thread. Fails without
    /// side effects on an unknown id, and records the error code in the
    /// thread's last-error slot.
    pub fn kill_worker(&self, target: Option<usize>) -> ShoalResult<()> {
        let result = match target.or_else(tls::try_current_worker_id) {
            None => Err(ShoalError::WrongOperation("kill_worker(None) outside a worker")),
            Some(id) if id >= self.pool.total() => Err(ShoalError::InvalidTarget {
                id,
                total: self.pool.total(),
            }),
            Some(id) => self.send_control(id, &EventRecord::shutdown()),
        };
        if let Err(e) = &result {
            set_last_error(e.code());
            tracing::warn!(code = %e.code(), error = %e, "kill_worker failed");
        }
        result
    }

    /// Stop the whole server: mark it stopped and ask every worker to drain
    ///
    /// The notice carries `SERVER_STOP` so forked workers, which hold their
    /// own copy of the running flag, learn that the server is going down.
    pub fn shutdown(&self) {
        self.set_running(false);
        for id in 0..self.pool.total() {
            if let Err(e) = self.send_control(id, &EventRecord::server_shutdown()) {
                tracing::warn!(code = %e.code(), worker_id = id, error = %e, "shutdown notice not delivered");
            }
        }
    }

    /// A worker occupant ended; report it and free the slot for reuse
    ///
    /// Returns true if the slot was reset for a new occupant, which happens
    /// while the server is still running.
    pub fn handle_worker_exit(&self, id: usize, exit: WorkerExit) -> ShoalResult<bool> {
        let worker = self.pool.worker(id)?;
        if !exit.is_clean() {
            tracing::warn!(worker_id = id, ?exit, "worker exited abnormally");
            if let Some(cb) = &self.callbacks.on_worker_error {
                cb(self, worker, exit);
            }
        }
        if !self.is_running() {
            return Ok(false);
        }
        self.pool.respawn(id)?;
        Ok(true)
    }

    /// Queue a worker-stop notice. Returns it back if the queue is full.
    pub fn push_worker_stop(&self, msg: WorkerStopMessage) -> Result<(), WorkerStopMessage> {
        self.stop_queue.push(msg)
    }

    pub fn pop_worker_stop(&self) -> Option<WorkerStopMessage> {
        self.stop_queue.pop()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ServerBuilder {
    config: ServerConfig,
    listeners: Vec<TcpListener>,
    callbacks: Callbacks,
    hooks: ServerHooks,
    commands: HashMap<u32, CommandHandler>,
    clock: Arc<dyn Clock>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            callbacks: Callbacks::default(),
            hooks: ServerHooks::default(),
            commands: HashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_receive<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventData<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_receive = Some(Arc::new(f));
        self
    }

    pub fn on_packet<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventData<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_packet = Some(Arc::new(f));
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventRecord) + Send + Sync + 'static,
    {
        self.callbacks.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventRecord) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_buffer_full<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventRecord) + Send + Sync + 'static,
    {
        self.callbacks.on_buffer_full = Some(Arc::new(f));
        self
    }

    pub fn on_buffer_empty<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventRecord) + Send + Sync + 'static,
    {
        self.callbacks.on_buffer_empty = Some(Arc::new(f));
        self
    }

    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventData<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_finish = Some(Arc::new(f));
        self
    }

    pub fn on_pipe_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, &EventData<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_pipe_message = Some(Arc::new(f));
        self
    }

    pub fn on_worker_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker) + Send + Sync + 'static,
    {
        self.callbacks.on_worker_start = Some(Arc::new(f));
        self
    }

    pub fn on_worker_stop<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker) + Send + Sync + 'static,
    {
        self.callbacks.on_worker_stop = Some(Arc::new(f));
        self
    }

    pub fn on_worker_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker) + Send + Sync + 'static,
    {
        self.callbacks.on_worker_exit = Some(Arc::new(f));
        self
    }

    pub fn on_worker_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker, WorkerExit) + Send + Sync + 'static,
    {
        self.callbacks.on_worker_error = Some(Arc::new(f));
        self
    }

    pub fn on_before_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server) + Send + Sync + 'static,
    {
        self.callbacks.on_before_shutdown = Some(Arc::new(f));
        self
    }

    pub fn on_socket_ready<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WorkerContext, Readiness, FdKind) + Send + Sync + 'static,
    {
        let handler: SocketHandler = Arc::new(f);
        self.callbacks.on_socket_ready = Some(handler);
        self
    }

    pub fn coroutine_count<F>(mut self, f: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        let counter: CoroutineCounter = Arc::new(f);
        self.callbacks.coroutine_count = Some(counter);
        self
    }

    /// Server-level hook run after the global before-start hooks
    pub fn hook_worker_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker) + Send + Sync + 'static,
    {
        self.hooks.worker_start.push(Arc::new(f));
        self
    }

    /// Server-level hook run after the global before-stop hooks
    pub fn hook_worker_stop<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server, &Worker) + Send + Sync + 'static,
    {
        self.hooks.worker_stop.push(Arc::new(f));
        self
    }

    pub fn command<F>(mut self, id: u32, f: F) -> Self
    where
        F: Fn(&Server, &[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.commands.insert(id, Arc::new(f));
        self
    }

    /// Validate and create the server, sizing the pool and its pipes
    pub fn build(self) -> ShoalResult<Arc<Server>> {
        self.config.validate()?;
        if self.config.task_worker_num > 0 && self.callbacks.on_finish.is_none() {
            return Err(ShoalError::Config(
                "task workers configured without an on_finish callback".into(),
            ));
        }
        for listener in &self.listeners {
            listener.set_nonblocking(true)?;
        }

        let pool = WorkerPool::new(&self.config)?;
        let control = WorkerPipe::new()?;
        Ok(Arc::new(Server {
            config: self.config,
            pool,
            sessions: SessionTable::new(),
            listeners: self.listeners,
            callbacks: self.callbacks,
            hooks: self.hooks,
            commands: self.commands,
            running: AtomicBool::new(true),
            request_count: AtomicU64::new(0),
            stop_queue: ArrayQueue::new(STOP_QUEUE_CAPACITY),
            control,
            clock: self.clock,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::error::{last_error, ERR_INVALID_PARAMS, ERR_WRONG_OPERATION};
    use shoal_core::EventType;

    fn config(topology: Topology) -> ServerConfig {
        ServerConfig::new().topology(topology).worker_num(2)
    }

    #[test]
    fn test_task_workers_require_on_finish() {
        let err = Server::builder(config(Topology::Process).task_worker_num(1))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ShoalError::Config(_)));

        let ok = Server::builder(config(Topology::Process).task_worker_num(1))
            .on_finish(|_, _, _| Ok(()))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_kill_worker_out_of_range_has_no_side_effects() {
        let server = Server::builder(config(Topology::Thread)).build().unwrap();
        let err = server.kill_worker(Some(2)).unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_PARAMS);
        assert_eq!(last_error(), ERR_INVALID_PARAMS);

        for w in server.pool().iter() {
            assert_eq!(w.pipe_master().unwrap().pending_len(), 0);
            let mut buf = [0u8; 64];
            assert!(w.pipe_worker().unwrap().recv(&mut buf).is_err());
            assert!(!w.is_shutting_down());
        }
    }

    #[test]
    fn test_kill_current_worker_outside_worker() {
        let server = Server::builder(config(Topology::Thread)).build().unwrap();
        let err = std::thread::spawn(move || server.kill_worker(None).unwrap_err())
            .join()
            .unwrap();
        assert_eq!(err.code(), ERR_WRONG_OPERATION);
    }

    #[test]
    fn test_kill_worker_sends_shutdown_record() {
        let server = Server::builder(config(Topology::Thread)).build().unwrap();
        server.kill_worker(Some(1)).unwrap();

        let mut buf = [0u8; 64];
        let n = server.receive_end(1).unwrap().recv(&mut buf).unwrap();
        let rec = EventRecord::from_bytes(&buf[..n]).unwrap();
        assert_eq!(rec.kind(), Ok(EventType::Shutdown));
    }

    #[test]
    fn test_kill_worker_on_full_pipe_fails_synchronously() {
        use shoal_core::error::ERR_PIPE_UNAVAILABLE;
        let server = Server::builder(config(Topology::Thread)).build().unwrap();
        let master = server.pool().slot(1).pipe_master().unwrap();
        master.set_nonblocking(true).unwrap();
        let filler = vec![0u8; 4096];
        while !master.has_pending() {
            master.send(&filler).unwrap();
        }

        let err = server.kill_worker(Some(1)).unwrap_err();
        assert!(matches!(err, ShoalError::PipeFull(1)));
        assert_eq!(last_error(), ERR_PIPE_UNAVAILABLE);
    }

    #[test]
    fn test_shutdown_notice_marks_server_stop() {
        let server = Server::builder(config(Topology::Process)).build().unwrap();
        server.shutdown();
        assert!(!server.is_running());

        let mut buf = [0u8; 64];
        for id in 0..2 {
            let n = server.receive_end(id).unwrap().recv(&mut buf).unwrap();
            let rec = EventRecord::from_bytes(&buf[..n]).unwrap();
            assert_eq!(rec.kind(), Ok(EventType::Shutdown));
            assert!(rec.has_flag(shoal_core::flags::SERVER_STOP));
        }
    }

    #[test]
    fn test_base_loop_uses_control_pipe() {
        let server = Server::builder(ServerConfig::new().topology(Topology::Base).worker_num(1))
            .build()
            .unwrap();
        server.kill_worker(Some(0)).unwrap();
        let mut buf = [0u8; 64];
        let n = server.receive_end(0).unwrap().recv(&mut buf).unwrap();
        assert_eq!(EventRecord::from_bytes(&buf[..n]).unwrap().kind(), Ok(EventType::Shutdown));
    }

    #[test]
    fn test_worker_exit_reports_and_respawns() {
        use std::sync::atomic::AtomicUsize;
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let server = Server::builder(config(Topology::Process))
            .on_worker_error(move |_, _, exit| {
                assert_eq!(exit, WorkerExit::Signaled(9));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        server.pool().get(0).unwrap().add_request_count();
        assert!(server.handle_worker_exit(0, WorkerExit::Signaled(9)).unwrap());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(server.pool().get(0).unwrap().request_count(), 0);

        assert!(server.handle_worker_exit(1, WorkerExit::Exited(0)).unwrap());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        server.set_running(false);
        assert!(!server.handle_worker_exit(1, WorkerExit::Exited(1)).unwrap());
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_queue() {
        let server = Server::builder(ServerConfig::new().topology(Topology::Base).worker_num(1))
            .build()
            .unwrap();
        let msg = WorkerStopMessage { pid: 42, worker_id: 0 };
        server.push_worker_stop(msg).unwrap();
        assert_eq!(server.pop_worker_stop(), Some(msg));
        assert_eq!(server.pop_worker_stop(), None);
    }
}
