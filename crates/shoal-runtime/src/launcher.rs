//! Launchers: put worker occupants on threads, a loop, or child processes
//!
//! Each launcher restarts a worker whose loop returned while the server is
//! still running (request ceiling, `kill_worker`), reporting the exit through
//! [`Server::handle_worker_exit`].

use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use shoal_core::{ShoalError, ShoalResult, Topology};

use crate::callbacks::WorkerExit;
use crate::entry::start_worker;
use crate::reactor::PollPoller;
use crate::server::Server;

fn require(server: &Server, topology: Topology, what: &'static str) -> ShoalResult<()> {
    if server.config().topology != topology {
        return Err(ShoalError::WrongOperation(what));
    }
    Ok(())
}

/// Run occupants of slot `id` until one returns after the server stopped
fn supervise_slot(server: Arc<Server>, id: usize) -> ShoalResult<i32> {
    loop {
        let code = start_worker(server.clone(), id, Box::new(PollPoller::new()))?;
        if !server.is_running() {
            return Ok(code);
        }
        if !server.handle_worker_exit(id, WorkerExit::Exited(code))? {
            return Ok(code);
        }
        tracing::info!(worker_id = id, code, "restarting worker");
    }
}

// ── Thread ──────────────────────────────────────────────────────────

/// Handles of running worker threads
pub struct ThreadWorkers {
    handles: Vec<(usize, JoinHandle<ShoalResult<i32>>)>,
}

impl ThreadWorkers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker thread, in id order
    pub fn join(self) -> Vec<(usize, ShoalResult<i32>)> {
        self.handles
            .into_iter()
            .map(|(id, h)| (id, h.join().unwrap_or(Err(ShoalError::WorkerPanicked(id)))))
            .collect()
    }
}

fn spawn_slots(server: &Arc<Server>, ids: Range<usize>) -> ShoalResult<ThreadWorkers> {
    let mut handles = Vec::with_capacity(ids.len());
    for id in ids {
        let server = server.clone();
        let handle = thread::Builder::new()
            .name(format!("shoal-worker-{}", id))
            .spawn(move || supervise_slot(server, id))?;
        handles.push((id, handle));
    }
    Ok(ThreadWorkers { handles })
}

/// Start one thread per worker slot (event and task workers)
pub fn spawn_thread_workers(server: &Arc<Server>) -> ShoalResult<ThreadWorkers> {
    require(server, Topology::Thread, "spawn_thread_workers needs thread topology")?;
    let workers = spawn_slots(server, 0..server.pool().total())?;
    tracing::info!(workers = workers.len(), "worker threads started");
    Ok(workers)
}

// ── Base ────────────────────────────────────────────────────────────

/// Run the single base-topology loop on the calling thread
///
/// Task workers get a thread each and are joined once the base loop is
/// done. If the base loop fails the server is stopped so they return too.
pub fn run_base_worker(server: &Arc<Server>) -> ShoalResult<i32> {
    require(server, Topology::Base, "run_base_worker needs base topology")?;
    let tasks = spawn_slots(server, server.pool().worker_num()..server.pool().total())?;
    if !tasks.is_empty() {
        tracing::info!(workers = tasks.len(), "task worker threads started");
    }

    let result = run_base_loop(server);
    if result.is_err() && server.is_running() {
        server.shutdown();
    }
    for (id, task) in tasks.join() {
        if let Err(e) = task {
            tracing::warn!(code = %e.code(), worker_id = id, error = %e, "task worker failed");
        }
    }
    result
}

fn run_base_loop(server: &Arc<Server>) -> ShoalResult<i32> {
    loop {
        let code = start_worker(server.clone(), 0, Box::new(PollPoller::new()))?;
        while let Some(msg) = server.pop_worker_stop() {
            tracing::info!(pid = msg.pid, worker_id = msg.worker_id, "worker stop notice");
        }
        if !server.is_running() || !server.handle_worker_exit(0, WorkerExit::Exited(code))? {
            return Ok(code);
        }
        tracing::info!(code, "restarting base loop");
    }
}

// ── Process ─────────────────────────────────────────────────────────

#[cfg(unix)]
pub use self::process::fork_process_workers;

#[cfg(unix)]
mod process {
    use std::collections::HashMap;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};

    use shoal_core::{ShoalResult, Topology};

    use super::require;
    use crate::callbacks::WorkerExit;
    use crate::entry::start_worker;
    use crate::reactor::PollPoller;
    use crate::server::Server;
    use crate::signal;

    /// Poll interval of the supervisor's reap loop
    const REAP_INTERVAL: Duration = Duration::from_millis(100);

    fn spawn_child(server: &Arc<Server>, id: usize) -> ShoalResult<Pid> {
        match unsafe { fork() }.map_err(io::Error::from)? {
            ForkResult::Parent { child } => {
                server.pool().slot(id).set_pid(child.as_raw());
                Ok(child)
            }
            ForkResult::Child => {
                let code = match start_worker(server.clone(), id, Box::new(PollPoller::new())) {
                    Ok(code) => code,
                    Err(e) => {
                        tracing::error!(worker_id = id, code = %e.code(), error = %e, "worker failed");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    /// Fork one child per worker slot and supervise them
    ///
    /// Returns once every child has exited. SIGTERM to the supervisor stops
    /// the server and forwards a shutdown notice to every child.
    pub fn fork_process_workers(server: &Arc<Server>) -> ShoalResult<i32> {
        require(server, Topology::Process, "fork_process_workers needs process topology")?;
        signal::install()?;

        let mut children: HashMap<Pid, usize> = HashMap::new();
        for id in 0..server.pool().total() {
            children.insert(spawn_child(server, id)?, id);
        }
        tracing::info!(workers = children.len(), "worker processes started");

        while !children.is_empty() {
            if signal::take_pending() == Some(libc::SIGTERM) && server.is_running() {
                tracing::info!("supervisor received SIGTERM, stopping workers");
                server.shutdown();
            }

            let (pid, exit) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, WorkerExit::Exited(code)),
                Ok(WaitStatus::Signaled(pid, sig, _)) => (pid, WorkerExit::Signaled(sig as i32)),
                Ok(WaitStatus::StillAlive) => {
                    std::thread::sleep(REAP_INTERVAL);
                    continue;
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(io::Error::from(e).into()),
            };

            let Some(id) = children.remove(&pid) else { continue };
            tracing::info!(worker_id = id, pid = pid.as_raw(), ?exit, "worker process exited");
            if server.handle_worker_exit(id, exit)? {
                children.insert(spawn_child(server, id)?, id);
            }
        }
        Ok(0)
    }
}
