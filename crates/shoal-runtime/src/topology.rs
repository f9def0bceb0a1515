//! Topology-specific drain and teardown
//!
//! The coordinator's sequence is the same for every topology; what differs
//! is which loop resources a draining worker gives up and which connections
//! it owns at teardown. Each topology is one stateless strategy, selected
//! once from the server's configuration.
//!
//! | Topology | begin_drain                                              | teardown             |
//! |----------|----------------------------------------------------------|----------------------|
//! | Process  | drop listeners, stop reading connections, cancel timers  | deregister the rest  |
//! | Thread   | stop reading this slice's pipes and connections          | close slice sessions |
//! | Base     | post a worker-stop notice to the task pool               | close all sessions   |

use std::os::unix::io::RawFd;

use shoal_core::error::ERR_TEARDOWN;
use shoal_core::Topology;

use crate::context::WorkerContext;
use crate::reactor::FdKind;
use crate::server::WorkerStopMessage;

pub trait TopologyStrategy: Send + Sync {
    fn topology(&self) -> Topology;

    /// Release loop resources so the loop can run dry
    fn begin_drain(&self, ctx: &mut WorkerContext);

    /// Whether the loop has nothing left worth waiting for
    fn is_exit_ready(&self, ctx: &WorkerContext) -> bool {
        ctx.event_loop.if_exit()
    }

    /// Close what this worker owns once its loop has stopped
    fn teardown(&self, ctx: &mut WorkerContext);
}

static PROCESS: ProcessStrategy = ProcessStrategy;
static THREAD: ThreadStrategy = ThreadStrategy;
static BASE: BaseStrategy = BaseStrategy;

pub fn strategy_for(topology: Topology) -> &'static dyn TopologyStrategy {
    match topology {
        Topology::Process => &PROCESS,
        Topology::Thread => &THREAD,
        Topology::Base => &BASE,
    }
}

fn log_teardown(worker_id: usize, fd: RawFd, what: &str, result: std::io::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(code = %ERR_TEARDOWN, worker_id, fd, error = %e, "{} failed", what);
    }
}

/// Deregister everything still in the loop
fn release_registrations(ctx: &mut WorkerContext) {
    let kinds = [FdKind::PipeWorker, FdKind::Listener, FdKind::Connection];
    for kind in kinds {
        for fd in ctx.event_loop.fds_of(kind) {
            let result = ctx.event_loop.del(fd);
            log_teardown(ctx.worker_id, fd, "deregister", result);
        }
    }
}

/// Close sessions, optionally only those of one reactor slice
fn close_sessions(ctx: &mut WorkerContext, reactor_id: Option<u16>) -> usize {
    let server = ctx.server.clone();
    let mut closed = 0;
    for session in server.sessions().live(reactor_id) {
        if ctx.event_loop.registration(session.fd).is_some() {
            let result = ctx.event_loop.del(session.fd);
            log_teardown(ctx.worker_id, session.fd, "deregister connection", result);
        }
        if session.close() {
            server.sessions().remove(session.session_id);
            closed += 1;
        }
    }
    closed
}

// ── Process ─────────────────────────────────────────────────────────

pub struct ProcessStrategy;

impl TopologyStrategy for ProcessStrategy {
    fn topology(&self) -> Topology {
        Topology::Process
    }

    fn begin_drain(&self, ctx: &mut WorkerContext) {
        for fd in ctx.event_loop.fds_of(FdKind::Listener) {
            let result = ctx.event_loop.del(fd);
            log_teardown(ctx.worker_id, fd, "remove listener", result);
        }
        for fd in ctx.event_loop.fds_of(FdKind::Connection) {
            let result = ctx.event_loop.remove_read(fd);
            log_teardown(ctx.worker_id, fd, "remove connection read", result);
        }
        let cancelled = ctx.event_loop.timers.clear();
        tracing::debug!(worker_id = ctx.worker_id, cancelled, "process worker draining");
    }

    fn teardown(&self, ctx: &mut WorkerContext) {
        release_registrations(ctx);
    }
}

// ── Thread ──────────────────────────────────────────────────────────

pub struct ThreadStrategy;

impl TopologyStrategy for ThreadStrategy {
    fn topology(&self) -> Topology {
        Topology::Thread
    }

    fn begin_drain(&self, ctx: &mut WorkerContext) {
        let server = ctx.server.clone();
        let pool = server.pool();
        let reactor_id = ctx.reactor_id();

        for worker in pool.iter().filter(|w| pool.reactor_of(w.id) == reactor_id) {
            let Some(end) = worker.pipe_worker() else { continue };
            let fd = end.fd();
            if ctx.event_loop.registration(fd).is_some_and(|r| r.interest.read) {
                let result = ctx.event_loop.remove_read(fd);
                log_teardown(ctx.worker_id, fd, "remove pipe read", result);
            }
        }

        for session in server.sessions().live(Some(reactor_id as u16)) {
            if ctx.event_loop.registration(session.fd).is_some_and(|r| r.interest.read) {
                let result = ctx.event_loop.remove_read(session.fd);
                log_teardown(ctx.worker_id, session.fd, "remove connection read", result);
            }
        }
        tracing::debug!(worker_id = ctx.worker_id, reactor_id, "thread slice draining");
    }

    fn teardown(&self, ctx: &mut WorkerContext) {
        let reactor_id = ctx.reactor_id() as u16;
        let closed = close_sessions(ctx, Some(reactor_id));
        release_registrations(ctx);
        tracing::debug!(worker_id = ctx.worker_id, reactor_id, closed, "thread slice torn down");
    }
}

// ── Base ────────────────────────────────────────────────────────────

pub struct BaseStrategy;

impl TopologyStrategy for BaseStrategy {
    fn topology(&self) -> Topology {
        Topology::Base
    }

    fn begin_drain(&self, ctx: &mut WorkerContext) {
        let msg = WorkerStopMessage {
            pid: std::process::id() as i32,
            worker_id: ctx.worker_id,
        };
        if let Err(msg) = ctx.server.push_worker_stop(msg) {
            tracing::warn!(
                code = %ERR_TEARDOWN,
                worker_id = msg.worker_id,
                "worker-stop queue full, notice dropped"
            );
        }
    }

    /// Listeners stay registered in Base, so they do not hold the loop open
    fn is_exit_ready(&self, ctx: &WorkerContext) -> bool {
        ctx.event_loop.timers.is_empty()
            && [FdKind::PipeWorker, FdKind::Connection].iter().all(|&kind| {
                ctx.event_loop
                    .fds_of(kind)
                    .iter()
                    .all(|&fd| ctx.event_loop.registration(fd).map_or(true, |r| r.interest.is_empty()))
            })
    }

    fn teardown(&self, ctx: &mut WorkerContext) {
        let closed = close_sessions(ctx, None);
        release_registrations(ctx);
        tracing::debug!(worker_id = ctx.worker_id, closed, "base loop torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::reactor::{EventLoop, Interest, PollPoller};
    use crate::server::Server;
    use crate::session::Session;

    fn ctx(config: ServerConfig, worker_id: usize) -> WorkerContext {
        let server = Server::builder(config).build().unwrap();
        let lp = EventLoop::new(Box::new(PollPoller::new()), -1);
        WorkerContext::new(server, worker_id, lp)
    }

    #[test]
    fn test_process_drain_keeps_writes() {
        let mut ctx = ctx(ServerConfig::new().topology(Topology::Process).worker_num(1), 0);
        ctx.event_loop.add(100, FdKind::Listener, Interest::READ).unwrap();
        ctx.event_loop.add(101, FdKind::Connection, Interest::BOTH).unwrap();
        ctx.event_loop.add(102, FdKind::Connection, Interest::READ).unwrap();
        ctx.event_loop.timers.add(0, 5000, Box::new(|_| {}));

        let strategy = ctx.strategy;
        strategy.begin_drain(&mut ctx);

        assert!(ctx.event_loop.registration(100).is_none());
        assert_eq!(ctx.event_loop.registration(101).unwrap().interest, Interest::WRITE);
        assert!(ctx.event_loop.registration(102).is_none());
        assert!(ctx.event_loop.timers.is_empty());
        assert!(!ctx.strategy.is_exit_ready(&ctx));

        ctx.event_loop.set_write(101, FdKind::Connection, false).unwrap();
        assert!(ctx.strategy.is_exit_ready(&ctx));
    }

    #[test]
    fn test_thread_drain_is_slice_scoped() {
        let config = ServerConfig::new().topology(Topology::Thread).worker_num(4);
        let mut ctx = ctx(config, 2);
        let sessions = ctx.server.sessions().clone();
        sessions.insert(Session::new(1, 201, 2));
        sessions.insert(Session::new(2, 202, 1));
        ctx.event_loop.add(201, FdKind::Connection, Interest::READ).unwrap();
        ctx.event_loop.add(202, FdKind::Connection, Interest::READ).unwrap();
        let own = ctx.receive_end().unwrap().fd();
        ctx.event_loop.add(own, FdKind::PipeWorker, Interest::READ).unwrap();

        let strategy = ctx.strategy;
        strategy.begin_drain(&mut ctx);

        assert!(ctx.event_loop.registration(own).is_none());
        assert!(ctx.event_loop.registration(201).is_none());
        assert_eq!(ctx.event_loop.registration(202).unwrap().interest, Interest::READ);

        // Teardown closes only this slice's sessions
        let strategy = ctx.strategy;
        strategy.teardown(&mut ctx);
        assert!(sessions.get(1).is_none());
        assert!(!sessions.get(2).unwrap().is_closed());
        assert_eq!(ctx.event_loop.registered(), 0);
    }

    #[test]
    fn test_base_drain_posts_stop_notice() {
        let config = ServerConfig::new().topology(Topology::Base).worker_num(1);
        let mut ctx = ctx(config, 0);
        ctx.event_loop.add(300, FdKind::Listener, Interest::READ).unwrap();

        let strategy = ctx.strategy;
        strategy.begin_drain(&mut ctx);

        let msg = ctx.server.pop_worker_stop().unwrap();
        assert_eq!(msg.worker_id, 0);
        assert_eq!(msg.pid, std::process::id() as i32);
        // Loop untouched, listener does not block exit
        assert!(ctx.event_loop.registration(300).is_some());
        assert!(ctx.strategy.is_exit_ready(&ctx));
    }

    #[test]
    fn test_failed_removal_is_tolerated() {
        let mut ctx = ctx(ServerConfig::new().topology(Topology::Process).worker_num(1), 0);
        // Nothing registered: teardown has nothing to do and must not panic
        let strategy = ctx.strategy;
        strategy.teardown(&mut ctx);
        log_teardown(0, 5, "remove", ctx.event_loop.del(5));
        assert_eq!(ctx.event_loop.registered(), 0);
    }
}
