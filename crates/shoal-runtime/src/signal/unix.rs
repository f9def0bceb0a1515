//! Unix signal installation and per-iteration handling

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use shoal_core::ShoalResult;

use crate::context::WorkerContext;
use crate::shutdown::{stop_async_worker, Phase, Trigger};
use crate::tls;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Last signal received, 0 = none
static PENDING: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signo: libc::c_int) {
    PENDING.store(signo, Ordering::SeqCst);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn rtmin() -> Option<libc::c_int> {
            Some(libc::SIGRTMIN())
        }
    } else {
        fn rtmin() -> Option<libc::c_int> {
            None
        }
    }
}

/// Install the worker's handlers. Later calls are no-ops.
pub fn install() -> ShoalResult<()> {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let record = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let handled = [
        Signal::SIGTERM,
        Signal::SIGWINCH,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ];
    unsafe {
        for sig in handled {
            sigaction(sig, &record).map_err(io::Error::from)?;
        }
        sigaction(Signal::SIGPIPE, &ignore).map_err(io::Error::from)?;

        if let Some(rt) = rtmin() {
            let mut act: libc::sigaction = std::mem::zeroed();
            act.sa_sigaction = on_signal as libc::sighandler_t;
            act.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut act.sa_mask);
            if libc::sigaction(rt, &act, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
    }
    tracing::debug!("signal handlers installed");
    Ok(())
}

/// Take the pending signal number, if any
pub fn take_pending() -> Option<i32> {
    match PENDING.swap(0, Ordering::SeqCst) {
        0 => None,
        signo => Some(signo),
    }
}

/// Act on one signal in the worker's loop context
pub fn handle_signal(ctx: &mut WorkerContext, signo: i32) {
    if !ctx.server.is_running() || tls::try_current_worker_id().is_none() {
        tracing::debug!(signo, "signal ignored outside a running worker");
        return;
    }

    match signo {
        libc::SIGTERM => {
            if ctx.event_loop.is_running() {
                stop_async_worker(ctx, Trigger::Signal(signo));
            } else {
                ctx.worker().begin_shutdown();
                ctx.event_loop.stop();
                ctx.phase = Phase::Terminated;
            }
        }
        libc::SIGWINCH => reopen_log(ctx.worker_id),
        s if Some(s) == rtmin() => reopen_log(ctx.worker_id),
        libc::SIGHUP | libc::SIGUSR1 | libc::SIGUSR2 => {
            tracing::debug!(worker_id = ctx.worker_id, signo, "signal has no worker action");
        }
        _ => {}
    }
}

fn reopen_log(worker_id: usize) {
    match shoal_core::log::reopen() {
        Ok(()) => tracing::info!(worker_id, "log file reopened"),
        Err(e) => tracing::warn!(worker_id, error = %e, "log reopen failed"),
    }
}

/// `Signal` end callback: consume at most one pending signal
pub fn signal_end_callback(ctx: &mut WorkerContext) {
    if let Some(signo) = take_pending() {
        handle_signal(ctx, signo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{Topology, WorkerStatus};

    use crate::config::ServerConfig;
    use crate::reactor::{EventLoop, FdKind, Interest, PollPoller};
    use crate::server::Server;

    fn ctx(running: bool) -> WorkerContext {
        let server = Server::builder(ServerConfig::new().topology(Topology::Process).worker_num(1))
            .build()
            .unwrap();
        let mut lp = EventLoop::new(Box::new(PollPoller::new()), -1);
        if running {
            lp.start();
        }
        WorkerContext::new(server, 0, lp)
    }

    #[test]
    fn test_sigterm_drains_running_loop() {
        let mut ctx = ctx(true);
        ctx.event_loop.add(700, FdKind::Connection, Interest::WRITE).unwrap();
        tls::set_worker_id(0);
        handle_signal(&mut ctx, libc::SIGTERM);
        tls::clear();

        assert_eq!(ctx.phase, Phase::ExitPending);
        assert_eq!(ctx.shutdown.as_ref().unwrap().trigger, Trigger::Signal(libc::SIGTERM));
        assert!(ctx.event_loop.is_running());
    }

    #[test]
    fn test_sigterm_stops_idle_loop() {
        let mut ctx = ctx(false);
        tls::set_worker_id(0);
        handle_signal(&mut ctx, libc::SIGTERM);
        tls::clear();

        assert_eq!(ctx.worker().status(), WorkerStatus::ShuttingDown);
        assert_eq!(ctx.phase, Phase::Terminated);
        assert!(ctx.shutdown.is_none());
    }

    #[test]
    fn test_signal_ignored_without_bound_worker() {
        let mut ctx = ctx(true);
        handle_signal(&mut ctx, libc::SIGTERM);
        assert_eq!(ctx.worker().status(), WorkerStatus::Idle);
        assert_eq!(ctx.phase, Phase::Running);
    }

    #[test]
    fn test_signal_ignored_after_server_stopped() {
        let mut ctx = ctx(true);
        ctx.server.set_running(false);
        tls::set_worker_id(0);
        handle_signal(&mut ctx, libc::SIGTERM);
        tls::clear();
        assert_eq!(ctx.phase, Phase::Running);
    }

    #[test]
    fn test_placeholder_signals_leave_worker_alone() {
        let mut ctx = ctx(true);
        tls::set_worker_id(0);
        for signo in [libc::SIGHUP, libc::SIGUSR1, libc::SIGUSR2, libc::SIGWINCH] {
            handle_signal(&mut ctx, signo);
        }
        tls::clear();
        assert_eq!(ctx.worker().status(), WorkerStatus::Idle);
        assert!(ctx.event_loop.is_running());
    }
}
