//! Worker records and the worker pool
//!
//! The pool owns a dense array of worker slots sized once at startup. Ids
//! `[0, worker_num)` are event workers, the rest are task workers. Any
//! worker may read any slot; status and counters are written by the owning
//! worker only (or by the coordinator acting for it).

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shoal_core::{EventRecord, ShoalError, ShoalResult, Topology, WorkerStatus, WorkerType};

use crate::config::ServerConfig;
use crate::pipe::{PipeEnd, WorkerPipe};

/// Longest a control send waits for room on a full pipe
pub const CONTROL_SEND_WAIT: Duration = Duration::from_millis(100);

/// Send a header-only control record without queueing it
pub(crate) fn send_record(pipe: &PipeEnd, target: usize, record: &EventRecord) -> ShoalResult<()> {
    let mut head = *record;
    head.len = 0;
    match pipe.send_now(&head.to_bytes(), CONTROL_SEND_WAIT) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ShoalError::PipeFull(target)),
        Err(e) => Err(e.into()),
    }
}

/// One execution unit: OS process, OS thread or logical slot
pub struct Worker {
    pub id: usize,
    pub kind: WorkerType,
    status: AtomicU8,
    request_count: AtomicU64,
    coroutine_num: AtomicUsize,
    /// 0 = unlimited
    max_request: u64,
    pid: AtomicI32,
    /// Already removed from the pool's active event-worker count
    exit_counted: AtomicBool,
    pipe: Option<Arc<WorkerPipe>>,
}

impl Worker {
    fn new(id: usize, kind: WorkerType, max_request: u64, pipe: Option<Arc<WorkerPipe>>) -> Self {
        Self {
            id,
            kind,
            status: AtomicU8::new(WorkerStatus::Idle as u8),
            request_count: AtomicU64::new(0),
            coroutine_num: AtomicUsize::new(0),
            max_request,
            pid: AtomicI32::new(0),
            exit_counted: AtomicBool::new(false),
            pipe,
        }
    }

    #[inline]
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.status().is_shutting_down()
    }

    /// Idle -> Busy. Returns false if the worker was not idle.
    #[inline]
    pub fn set_busy(&self) -> bool {
        self.status
            .compare_exchange(
                WorkerStatus::Idle as u8,
                WorkerStatus::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Busy -> Idle. A worker that is shutting down stays shutting down.
    #[inline]
    pub fn set_idle(&self) -> bool {
        self.status
            .compare_exchange(
                WorkerStatus::Busy as u8,
                WorkerStatus::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter ShuttingDown. Returns the previous status.
    #[inline]
    pub fn begin_shutdown(&self) -> WorkerStatus {
        WorkerStatus::from(
            self.status
                .swap(WorkerStatus::ShuttingDown as u8, Ordering::AcqRel),
        )
    }

    #[inline]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_request_count(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn max_request(&self) -> u64 {
        self.max_request
    }

    /// True once the lifetime request count reached the ceiling
    #[inline]
    pub fn has_exceeded_limit(&self) -> bool {
        self.max_request > 0 && self.request_count() >= self.max_request
    }

    #[inline]
    pub fn coroutine_num(&self) -> usize {
        self.coroutine_num.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_coroutine_num(&self, n: usize) {
        self.coroutine_num.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn pipe(&self) -> Option<&Arc<WorkerPipe>> {
        self.pipe.as_ref()
    }

    /// Endpoint that delivers to this worker
    pub fn pipe_master(&self) -> Option<&PipeEnd> {
        self.pipe.as_deref().map(|p| &p.master)
    }

    /// Endpoint this worker reads from and replies on
    pub fn pipe_worker(&self) -> Option<&PipeEnd> {
        self.pipe.as_deref().map(|p| &p.worker)
    }

    /// Owned copy of the record
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            kind: self.kind,
            status: self.status(),
            request_count: self.request_count(),
            coroutine_num: self.coroutine_num(),
            max_request: self.max_request,
            pid: self.pid(),
        }
    }

    /// Reset for reuse after the previous occupant exited
    fn reset(&self) {
        self.status.store(WorkerStatus::Idle as u8, Ordering::Release);
        self.request_count.store(0, Ordering::Relaxed);
        self.coroutine_num.store(0, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
    }
}

/// Private copy of a worker record taken when shutdown begins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub kind: WorkerType,
    pub status: WorkerStatus,
    pub request_count: u64,
    pub coroutine_num: usize,
    pub max_request: u64,
    pub pid: i32,
}

/// Dense array of worker slots
pub struct WorkerPool {
    workers: Vec<Worker>,
    topology: Topology,
    worker_num: usize,
    task_worker_num: usize,
    reactor_num: usize,
    /// Event workers that have not begun shutdown
    running_event_workers: AtomicUsize,
    before_shutdown_fired: AtomicBool,
}

impl WorkerPool {
    /// Size the pool and create pipes
    ///
    /// Event workers in Base topology share the single loop and get no pipe.
    pub fn new(config: &ServerConfig) -> ShoalResult<Self> {
        let total = config.total_workers();
        let mut workers = Vec::with_capacity(total);
        for id in 0..total {
            let kind = if id < config.worker_num {
                WorkerType::Event
            } else {
                WorkerType::Task
            };
            let pipe = if kind == WorkerType::Event && config.topology == Topology::Base {
                None
            } else {
                Some(Arc::new(WorkerPipe::new()?))
            };
            let max_request = match kind {
                WorkerType::Event => config.max_request,
                WorkerType::Task => 0,
            };
            workers.push(Worker::new(id, kind, max_request, pipe));
        }

        Ok(Self {
            workers,
            topology: config.topology,
            worker_num: config.worker_num,
            task_worker_num: config.task_worker_num,
            reactor_num: config.effective_reactor_num(),
            running_event_workers: AtomicUsize::new(config.worker_num),
            before_shutdown_fired: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn get(&self, id: usize) -> Option<&Worker> {
        self.workers.get(id)
    }

    /// Slot by id
    ///
    /// # Panics
    ///
    /// If `id` is out of range. Use [`WorkerPool::get`] for untrusted ids.
    #[inline]
    pub fn slot(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    /// Lookup that reports out-of-range ids as errors
    pub fn worker(&self, id: usize) -> ShoalResult<&Worker> {
        self.workers.get(id).ok_or(ShoalError::InvalidTarget {
            id,
            total: self.workers.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    #[inline]
    pub fn worker_num(&self) -> usize {
        self.worker_num
    }

    #[inline]
    pub fn task_worker_num(&self) -> usize {
        self.task_worker_num
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn reactor_num(&self) -> usize {
        self.reactor_num
    }

    /// Reactor slice a worker belongs to in thread mode
    #[inline]
    pub fn reactor_of(&self, id: usize) -> usize {
        id % self.reactor_num
    }

    /// Write a control record into the target's master-facing endpoint
    ///
    /// The record is on the pipe when this returns `Ok`; a pipe that stays
    /// full for [`CONTROL_SEND_WAIT`] fails with `PipeFull`.
    pub fn send_control(&self, target: usize, record: &EventRecord) -> ShoalResult<()> {
        let worker = self.worker(target)?;
        let pipe = worker
            .pipe_master()
            .ok_or(ShoalError::PipeUnavailable(target))?;
        send_record(pipe, target, record)
    }

    /// Event workers that have not begun shutdown
    #[inline]
    pub fn running_event_workers(&self) -> usize {
        self.running_event_workers.load(Ordering::Acquire)
    }

    /// Remove `id` from the active event-worker count, once per occupant
    ///
    /// Returns the count left after removal, or `None` if this occupant was
    /// already removed or is not an event worker.
    pub fn leave_active(&self, id: usize) -> Option<usize> {
        let worker = self.get(id)?;
        if worker.kind != WorkerType::Event || worker.exit_counted.swap(true, Ordering::AcqRel) {
            return None;
        }
        let prev = self
            .running_event_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        Some(prev.saturating_sub(1))
    }

    /// Claim the right to run the before-shutdown hook
    ///
    /// True for exactly one caller over the pool's lifetime.
    pub fn claim_before_shutdown(&self) -> bool {
        self.before_shutdown_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reset a slot for a new occupant, keeping its pipe
    pub fn respawn(&self, id: usize) -> ShoalResult<&Worker> {
        let worker = self.worker(id)?;
        worker.reset();
        if worker.exit_counted.swap(false, Ordering::AcqRel) {
            self.running_event_workers.fetch_add(1, Ordering::AcqRel);
        }
        Ok(worker)
    }

    /// Flush every worker's queued pipe writes, best effort
    pub fn drain_pipes(&self) {
        for worker in &self.workers {
            let Some(pipe) = worker.pipe() else { continue };
            match pipe.drain() {
                Ok(0) => {}
                Ok(left) => tracing::debug!(worker_id = worker.id, left, "pipe writes left undrained"),
                Err(e) => tracing::debug!(worker_id = worker.id, error = %e, "pipe drain failed"),
            }
        }
    }
}
