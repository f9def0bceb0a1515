//! Worker entry loop
//!
//! `start_worker` runs one worker occupant from identity binding to
//! teardown. Phases, in order:
//!
//! 1. bind the worker id to the thread, record the pid
//! 2. build the loop: pipe read registration, listeners, timer callback
//! 3. signal handlers (skipped in thread topology)
//! 4. coroutine sampler for coroutine load-balancing dispatch modes
//! 5. start hooks, then `on_worker_start`
//! 6. run the loop until it stops
//! 7. drain buffered pipe writes
//! 8. topology teardown
//! 9. stop hooks, `on_worker_stop`, unprocessed-data check
//! 10. unbind the thread

use std::os::unix::io::RawFd;
use std::sync::Arc;

use shoal_core::error::{clear_last_error, ERR_TEARDOWN, ERR_WORKER_UNPROCESSED_DATA};
use shoal_core::{ShoalResult, WorkerType};

use crate::callbacks::{run_global_hooks, GlobalHook};
use crate::context::WorkerContext;
use crate::dispatcher::on_pipe_receive;
use crate::reactor::{EndSlot, EventLoop, FdKind, Interest, Poller, Readiness};
use crate::server::Server;
use crate::shutdown::Phase;
use crate::{signal, tls};

/// Run worker `worker_id` on the calling thread until its loop stops
///
/// Returns the loop's exit code.
pub fn start_worker(server: Arc<Server>, worker_id: usize, poller: Box<dyn Poller>) -> ShoalResult<i32> {
    server.pool().worker(worker_id)?;

    // 1
    tls::set_worker_id(worker_id);
    server.pool().slot(worker_id).set_pid(std::process::id() as i32);

    let event_loop = EventLoop::new(poller, server.config().loop_timeout_ms);
    let mut ctx = WorkerContext::new(server, worker_id, event_loop);
    let result = run_phases(&mut ctx);

    // 10
    tls::clear();
    result.map(|()| ctx.exit_code)
}

fn run_phases(ctx: &mut WorkerContext) -> ShoalResult<()> {
    let server = ctx.server.clone();
    let config = server.config();
    let worker = server.pool().slot(ctx.worker_id);

    // 2, 3: a failure here only skips the loop run
    let init = init_loop(ctx).and_then(|()| {
        if config.topology.installs_signal_handlers() {
            signal::install()?;
            ctx.event_loop.set_end_callback(EndSlot::Signal, signal::signal_end_callback);
        }
        Ok(())
    });

    // 4
    if config.dispatch_mode.samples_coroutines() {
        ctx.event_loop.set_end_callback(EndSlot::WorkerCallback, sample_coroutines);
    }

    // 5
    for other in server.pool().iter().filter(|w| w.id != ctx.worker_id) {
        if let Some(end) = other.pipe_master() {
            if let Err(e) = end.set_nonblocking(true) {
                tracing::debug!(worker_id = ctx.worker_id, peer = other.id, error = %e, "peer pipe left blocking");
            }
        }
    }
    run_global_hooks(GlobalHook::BeforeWorkerStart, &server, worker);
    for hook in &server.hooks().worker_start {
        hook(&server, worker);
    }
    clear_last_error();
    if let Some(cb) = &server.callbacks().on_worker_start {
        cb(&server, worker);
    }
    worker.set_idle();
    tracing::info!(
        worker_id = ctx.worker_id,
        kind = %worker.kind,
        topology = %config.topology,
        poller = ctx.event_loop.poller_name(),
        "worker started"
    );

    // 6
    let loop_result = match init {
        Ok(()) => {
            ctx.event_loop.start();
            run_loop(ctx)
        }
        Err(e) => {
            tracing::error!(code = %e.code(), worker_id = ctx.worker_id, error = %e, "worker init failed");
            ctx.exit_code = -1;
            Err(e)
        }
    };

    // 7
    server.pool().drain_pipes();

    // 8
    let strategy = ctx.strategy;
    strategy.teardown(ctx);

    // 9
    run_global_hooks(GlobalHook::BeforeWorkerStop, &server, worker);
    for hook in &server.hooks().worker_stop {
        hook(&server, worker);
    }
    if let Some(cb) = &server.callbacks().on_worker_stop {
        cb(&server, worker);
    }
    if !ctx.bus_is_empty() {
        tracing::warn!(
            code = %ERR_WORKER_UNPROCESSED_DATA,
            worker_id = ctx.worker_id,
            "worker stopped with an unprocessed message"
        );
        if let Some(bus) = ctx.bus.as_mut() {
            bus.clear();
        }
    }
    ctx.shutdown = None;
    ctx.phase = Phase::Terminated;
    tracing::info!(
        worker_id = ctx.worker_id,
        requests = worker.request_count(),
        exit_code = ctx.exit_code,
        "worker stopped"
    );
    loop_result
}

fn init_loop(ctx: &mut WorkerContext) -> ShoalResult<()> {
    let server = ctx.server.clone();
    if let Some(end) = server.receive_end(ctx.worker_id) {
        end.set_nonblocking(true)?;
        ctx.event_loop.add(end.fd(), FdKind::PipeWorker, Interest::READ)?;
    }

    let is_event = server.pool().slot(ctx.worker_id).kind == WorkerType::Event;
    if is_event && server.config().topology.worker_owns_listeners() {
        for fd in server.listener_fds() {
            ctx.event_loop.add(fd, FdKind::Listener, Interest::READ)?;
        }
    }

    ctx.event_loop.set_end_callback(EndSlot::Timer, run_timers);
    Ok(())
}

/// Wait, dispatch, run end callbacks; repeat while running
fn run_loop(ctx: &mut WorkerContext) -> ShoalResult<()> {
    let mut ready: Vec<Readiness> = Vec::with_capacity(64);
    while ctx.event_loop.is_running() {
        ready.clear();
        let now = ctx.now_ms();
        if let Err(e) = ctx.event_loop.wait(now, &mut ready) {
            tracing::error!(worker_id = ctx.worker_id, error = %e, "poller wait failed");
            ctx.exit_code = -1;
            ctx.event_loop.stop();
            return Err(e.into());
        }
        for ev in ready.iter().copied() {
            dispatch_ready(ctx, ev);
        }
        for (_, cb) in ctx.event_loop.end_callbacks() {
            cb(ctx);
        }
    }
    Ok(())
}

fn dispatch_ready(ctx: &mut WorkerContext, ev: Readiness) {
    let Some(reg) = ctx.event_loop.registration(ev.fd) else {
        return;
    };
    let hangup = ev.readable && !reg.interest.read;
    if reg.interest.write && (ev.writable || hangup) {
        match reg.kind {
            FdKind::PipeWorker => flush_pipe(ctx, ev.fd),
            _ => on_socket_ready(ctx, ev, reg.kind),
        }
    }

    let Some(reg) = ctx.event_loop.registration(ev.fd) else {
        return;
    };
    if ev.readable && reg.interest.read {
        match reg.kind {
            FdKind::PipeWorker => on_pipe_receive(ctx),
            FdKind::Listener | FdKind::Connection => on_socket_ready(ctx, ev, reg.kind),
        }
    }
}

fn flush_pipe(ctx: &mut WorkerContext, fd: RawFd) {
    let server = ctx.server.clone();
    let Some(end) = server.receive_end(ctx.worker_id) else {
        return;
    };
    let done = match end.flush() {
        Ok(left) => left == 0,
        Err(e) => {
            tracing::warn!(worker_id = ctx.worker_id, error = %e, "pipe flush failed");
            true
        }
    };
    if done {
        if let Err(e) = ctx.event_loop.set_write(fd, FdKind::PipeWorker, false) {
            tracing::debug!(worker_id = ctx.worker_id, error = %e, "pipe write interest not cleared");
        }
    }
}

fn on_socket_ready(ctx: &mut WorkerContext, ev: Readiness, kind: FdKind) {
    let handler = ctx.server.callbacks().on_socket_ready.clone();
    match handler {
        Some(handler) => handler(ctx, ev, kind),
        None => {
            // Nobody consumes it; drop the registration instead of spinning
            tracing::warn!(worker_id = ctx.worker_id, fd = ev.fd, ?kind, "socket ready without a handler");
            if let Err(e) = ctx.event_loop.del(ev.fd) {
                tracing::warn!(code = %ERR_TEARDOWN, worker_id = ctx.worker_id, fd = ev.fd, error = %e, "deregister failed");
            }
        }
    }
}

/// `Timer` end callback
fn run_timers(ctx: &mut WorkerContext) {
    let now = ctx.now_ms();
    for cb in ctx.event_loop.timers.take_expired(now) {
        cb(ctx);
    }
}

/// `WorkerCallback` end callback
fn sample_coroutines(ctx: &mut WorkerContext) {
    if let Some(count) = &ctx.server.callbacks().coroutine_count {
        ctx.worker().set_coroutine_num(count());
    }
}
