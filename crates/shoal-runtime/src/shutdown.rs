//! Shutdown coordinator
//!
//! Drives a worker through `Running -> Draining -> ExitPending -> Terminated`.
//! The sequence is shared by all topologies; what gets released is decided
//! by the worker's [`TopologyStrategy`](crate::topology::TopologyStrategy).
//!
//! The exit deadline is only checked at end-of-iteration checkpoints, so a
//! loop blocked inside a callback overruns it by that callback's duration.

use shoal_core::error::{ERR_TEARDOWN, ERR_WORKER_EXIT_TIMEOUT};
use shoal_core::{Topology, WorkerType};

use crate::callbacks::{run_global_hooks, GlobalHook};
use crate::context::WorkerContext;
use crate::reactor::EndSlot;
use crate::worker::WorkerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    ExitPending,
    Terminated,
}

/// What started the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    RequestLimit,
    ControlMessage,
    Signal(i32),
}

/// State owned by a draining worker
#[derive(Debug)]
pub struct ShutdownContext {
    /// Copy of the pool slot taken when draining began
    pub snapshot: WorkerSnapshot,
    pub trigger: Trigger,
    pub start_secs: i64,
    pub deadline_secs: i64,
    exit_hook_ran: bool,
}

impl ShutdownContext {
    /// Whole seconds left before forced termination
    pub fn remaining_secs(&self, now_secs: i64) -> i64 {
        self.deadline_secs - now_secs
    }
}

/// Begin a graceful shutdown of the worker bound to `ctx`
///
/// Safe to call more than once; only the first call drains.
pub fn stop_async_worker(ctx: &mut WorkerContext, trigger: Trigger) {
    let server = ctx.server.clone();
    let pool = server.pool();
    let worker = pool.slot(ctx.worker_id);
    let prev = worker.begin_shutdown();

    // Forked workers each hold a private pool, so there only worker 0 may claim
    let may_claim = server.config().topology != Topology::Process || worker.id == 0;
    if worker.kind == WorkerType::Event
        && pool.leave_active(worker.id).is_some()
        && !server.is_running()
        && may_claim
        && pool.claim_before_shutdown()
    {
        run_global_hooks(GlobalHook::BeforeServerShutdown, &server, worker);
        if let Some(cb) = &server.callbacks().on_before_shutdown {
            cb(&server);
        }
    }

    if !server.config().reload_async {
        tracing::info!(worker_id = ctx.worker_id, ?trigger, "worker stopping without drain");
        ctx.event_loop.stop();
        ctx.phase = Phase::Terminated;
        return;
    }

    if ctx.shutdown.is_some() || ctx.event_loop.wait_exit() {
        tracing::debug!(worker_id = ctx.worker_id, ?trigger, "shutdown already in progress");
        return;
    }

    let start_secs = ctx.clock.now_secs();
    let max_wait = server.config().max_wait_time as i64;
    ctx.shutdown = Some(ShutdownContext {
        snapshot: worker.snapshot(),
        trigger,
        start_secs,
        deadline_secs: start_secs + max_wait,
        exit_hook_ran: false,
    });
    ctx.phase = Phase::Draining;
    tracing::info!(
        worker_id = ctx.worker_id,
        ?trigger,
        previous = %prev,
        requests = worker.request_count(),
        max_wait,
        "worker draining"
    );

    if let Some(fd) = ctx.receive_end().map(|end| end.fd()) {
        if ctx.event_loop.registration(fd).is_some_and(|r| r.interest.read) {
            if let Err(e) = ctx.event_loop.remove_read(fd) {
                tracing::warn!(
                    code = %ERR_TEARDOWN,
                    worker_id = ctx.worker_id,
                    fd,
                    error = %e,
                    "remove pipe read failed"
                );
            }
        }
    }

    let strategy = ctx.strategy;
    strategy.begin_drain(ctx);

    ctx.event_loop.set_wait_exit();
    ctx.event_loop.set_end_callback(EndSlot::TryExit, try_exit_callback);
    ctx.phase = Phase::ExitPending;
    try_to_exit(ctx);
}

fn try_exit_callback(ctx: &mut WorkerContext) {
    try_to_exit(ctx);
}

/// One exit checkpoint: stop the loop if it ran dry or the deadline passed
pub fn try_to_exit(ctx: &mut WorkerContext) {
    if !ctx.event_loop.is_running() {
        return;
    }
    let strategy = ctx.strategy;
    if strategy.is_exit_ready(ctx) {
        terminate(ctx);
        return;
    }

    let hook_pending = ctx.shutdown.as_ref().is_some_and(|s| !s.exit_hook_ran);
    if hook_pending {
        if let Some(sd) = ctx.shutdown.as_mut() {
            sd.exit_hook_ran = true;
        }
        let server = ctx.server.clone();
        if let Some(cb) = &server.callbacks().on_worker_exit {
            cb(&server, server.pool().slot(ctx.worker_id));
        }
        if strategy.is_exit_ready(ctx) {
            terminate(ctx);
            return;
        }
    }

    let Some(remaining) = ctx.shutdown.as_ref().map(|s| s.remaining_secs(ctx.clock.now_secs())) else {
        return;
    };
    if remaining <= 0 {
        tracing::warn!(
            code = %ERR_WORKER_EXIT_TIMEOUT,
            worker_id = ctx.worker_id,
            registered = ctx.event_loop.registered(),
            timers = ctx.event_loop.timers.len(),
            "worker exit timeout, forced termination"
        );
        terminate(ctx);
    } else {
        ctx.event_loop.shrink_timeout(remaining * 1000);
    }
}

fn terminate(ctx: &mut WorkerContext) {
    ctx.event_loop.stop();
    ctx.phase = Phase::Terminated;
    tracing::debug!(worker_id = ctx.worker_id, "worker loop stopped");
}
