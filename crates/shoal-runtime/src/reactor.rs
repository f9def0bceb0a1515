//! # Per-worker event loop
//!
//! Every worker runs one single-threaded loop. The loop keeps its own
//! registry of descriptors (what each descriptor is and which directions it
//! waits on) on top of a [`Poller`] that does the actual readiness waiting.
//!
//! ```text
//!   ┌──────────────── one iteration ─────────────────┐
//!   │ wait(min(timeout_msec, next timer))            │
//!   │   → readable pipe_worker   → dispatcher        │
//!   │   → writable               → flush queue       │
//!   │   → listener / connection  → forwarder         │
//!   │ end callbacks, in slot order:                  │
//!   │   Timer → Signal → TryExit → WorkerCallback    │
//!   └────────────────────────────────────────────────┘
//! ```
//!
//! The loop may exit once nothing waits for reads or writes and no timer is
//! pending ([`EventLoop::if_exit`]).

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;

use crate::context::WorkerContext;

// ── Registrations ───────────────────────────────────────────────────

/// What a registered descriptor is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdKind {
    /// This worker's own receive endpoint
    PipeWorker,
    Listener,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const BOTH: Interest = Interest { read: true, write: true };

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub kind: FdKind,
    pub interest: Interest,
}

/// One ready descriptor reported by a poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

// ── Poller ──────────────────────────────────────────────────────────

/// Readiness notifier the loop is built on
pub trait Poller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout_ms` (-1 = forever) and append ready descriptors
    ///
    /// An interrupted wait returns `Ok` with nothing appended so the loop
    /// gets to its end callbacks (signal delivery).
    fn wait(&mut self, timeout_ms: i64, ready: &mut Vec<Readiness>) -> io::Result<()>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// `poll(2)` backed poller
#[derive(Default)]
pub struct PollPoller {
    fds: HashMap<RawFd, Interest>,
    pollfds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(interest: Interest) -> libc::c_short {
        let mut events = 0;
        if interest.read {
            events |= libc::POLLIN;
        }
        if interest.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

fn not_registered(fd: RawFd) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("fd {} not registered", fd))
}

impl Poller for PollPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.fds.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} already registered", fd),
            ));
        }
        self.fds.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let slot = self.fds.get_mut(&fd).ok_or_else(|| not_registered(fd))?;
        *slot = interest;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.remove(&fd).map(|_| ()).ok_or_else(|| not_registered(fd))
    }

    fn wait(&mut self, timeout_ms: i64, ready: &mut Vec<Readiness>) -> io::Result<()> {
        self.pollfds.clear();
        self.pollfds.extend(self.fds.iter().map(|(&fd, &interest)| libc::pollfd {
            fd,
            events: Self::events(interest),
            revents: 0,
        }));

        let timeout = timeout_ms.clamp(-1, libc::c_int::MAX as i64) as libc::c_int;
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for p in self.pollfds.iter().filter(|p| p.revents != 0) {
            let hangup = p.revents & (libc::POLLERR | libc::POLLHUP) != 0;
            ready.push(Readiness {
                fd: p.fd,
                readable: p.revents & libc::POLLIN != 0 || hangup,
                writable: p.revents & libc::POLLOUT != 0,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

// ── Timers ──────────────────────────────────────────────────────────

pub type TimerId = u64;

pub type TimerCallback = Box<dyn FnOnce(&mut WorkerContext)>;

/// One-shot timers ordered by deadline
#[derive(Default)]
pub struct TimerTable {
    entries: BTreeMap<(i64, TimerId), TimerCallback>,
    next_id: TimerId,
}

impl TimerTable {
    /// Schedule `cb` to run `after_ms` after `now_ms`
    pub fn add(&mut self, now_ms: i64, after_ms: i64, cb: TimerCallback) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((now_ms + after_ms.max(0), id), cb);
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let key = self.entries.keys().find(|(_, tid)| *tid == id).copied();
        key.and_then(|k| self.entries.remove(&k)).is_some()
    }

    /// Cancel everything. Returns how many timers were pending.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at `now_ms`
    pub fn take_expired(&mut self, now_ms: i64) -> Vec<TimerCallback> {
        let later = self.entries.split_off(&(now_ms + 1, 0));
        let due = std::mem::replace(&mut self.entries, later);
        due.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── End-of-iteration callbacks ──────────────────────────────────────

/// Slots of the end-of-iteration chain, run in ascending order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndSlot {
    Timer = 0,
    Signal = 1,
    TryExit = 2,
    WorkerCallback = 3,
}

pub type EndCallback = fn(&mut WorkerContext);

// ── EventLoop ───────────────────────────────────────────────────────

pub struct EventLoop {
    poller: Box<dyn Poller>,
    registry: HashMap<RawFd, Registration>,
    running: bool,
    wait_exit: bool,
    /// -1 = infinite
    timeout_msec: i64,
    pub timers: TimerTable,
    end_callbacks: BTreeMap<EndSlot, EndCallback>,
}

impl EventLoop {
    pub fn new(poller: Box<dyn Poller>, timeout_msec: i64) -> Self {
        Self {
            poller,
            registry: HashMap::new(),
            running: false,
            wait_exit: false,
            timeout_msec,
            timers: TimerTable::default(),
            end_callbacks: BTreeMap::new(),
        }
    }

    pub fn poller_name(&self) -> &'static str {
        self.poller.name()
    }

    // ── registry ──

    pub fn add(&mut self, fd: RawFd, kind: FdKind, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty interest"));
        }
        self.poller.register(fd, interest)?;
        self.registry.insert(fd, Registration { kind, interest });
        Ok(())
    }

    /// Change interest; an empty interest removes the registration
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if !self.registry.contains_key(&fd) {
            return Err(not_registered(fd));
        }
        if interest.is_empty() {
            return self.del(fd);
        }
        self.poller.reregister(fd, interest)?;
        if let Some(reg) = self.registry.get_mut(&fd) {
            reg.interest = interest;
        }
        Ok(())
    }

    /// Stop waiting for reads on `fd`, keeping any write interest
    pub fn remove_read(&mut self, fd: RawFd) -> io::Result<()> {
        let reg = self.registry.get(&fd).copied().ok_or_else(|| not_registered(fd))?;
        self.set_interest(fd, Interest { read: false, ..reg.interest })
    }

    /// Toggle write interest, registering `fd` as `kind` if needed
    pub fn set_write(&mut self, fd: RawFd, kind: FdKind, enable: bool) -> io::Result<()> {
        match self.registry.get(&fd).copied() {
            Some(reg) => self.set_interest(fd, Interest { write: enable, ..reg.interest }),
            None if enable => self.add(fd, kind, Interest::WRITE),
            None => Ok(()),
        }
    }

    pub fn del(&mut self, fd: RawFd) -> io::Result<()> {
        self.registry.remove(&fd).ok_or_else(|| not_registered(fd))?;
        self.poller.deregister(fd)
    }

    pub fn registration(&self, fd: RawFd) -> Option<Registration> {
        self.registry.get(&fd).copied()
    }

    /// Registered descriptors of one kind, in ascending order
    pub fn fds_of(&self, kind: FdKind) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .registry
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(&fd, _)| fd)
            .collect();
        fds.sort_unstable();
        fds
    }

    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    // ── run state ──

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    #[inline]
    pub fn wait_exit(&self) -> bool {
        self.wait_exit
    }

    pub fn set_wait_exit(&mut self) {
        self.wait_exit = true;
    }

    #[inline]
    pub fn timeout_msec(&self) -> i64 {
        self.timeout_msec
    }

    /// Lower the poll timeout; a larger value than the current one is ignored
    pub fn shrink_timeout(&mut self, ms: i64) {
        let ms = ms.max(0);
        if self.timeout_msec < 0 || ms < self.timeout_msec {
            self.timeout_msec = ms;
        }
    }

    /// Nothing waits for reads or writes and no timer is pending
    pub fn if_exit(&self) -> bool {
        self.registry.values().all(|r| r.interest.is_empty()) && self.timers.is_empty()
    }

    // ── end callbacks ──

    /// Install `cb` in `slot` unless the slot is taken. True if installed.
    pub fn set_end_callback(&mut self, slot: EndSlot, cb: EndCallback) -> bool {
        match self.end_callbacks.entry(slot) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(cb);
                true
            }
        }
    }

    pub fn has_end_callback(&self, slot: EndSlot) -> bool {
        self.end_callbacks.contains_key(&slot)
    }

    /// Installed callbacks in slot order
    pub fn end_callbacks(&self) -> Vec<(EndSlot, EndCallback)> {
        self.end_callbacks.iter().map(|(s, cb)| (*s, *cb)).collect()
    }

    // ── waiting ──

    /// Wait for readiness, bounded by the loop timeout and the next timer
    pub fn wait(&mut self, now_ms: i64, ready: &mut Vec<Readiness>) -> io::Result<()> {
        let mut timeout = self.timeout_msec;
        if let Some(deadline) = self.timers.next_deadline() {
            let until = (deadline - now_ms).max(0);
            if timeout < 0 || until < timeout {
                timeout = until;
            }
        }
        self.poller.wait(timeout, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_loop() -> EventLoop {
        EventLoop::new(Box::new(PollPoller::new()), -1)
    }

    #[derive(Default)]
    struct Calls {
        ops: Vec<(&'static str, RawFd)>,
        timeouts: Vec<i64>,
    }

    /// Poller that records what the loop asks of it
    struct RecordingPoller(std::rc::Rc<std::cell::RefCell<Calls>>);

    impl Poller for RecordingPoller {
        fn register(&mut self, fd: RawFd, _: Interest) -> io::Result<()> {
            self.0.borrow_mut().ops.push(("register", fd));
            Ok(())
        }

        fn reregister(&mut self, fd: RawFd, _: Interest) -> io::Result<()> {
            self.0.borrow_mut().ops.push(("reregister", fd));
            Ok(())
        }

        fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            self.0.borrow_mut().ops.push(("deregister", fd));
            Ok(())
        }

        fn wait(&mut self, timeout_ms: i64, _: &mut Vec<Readiness>) -> io::Result<()> {
            self.0.borrow_mut().timeouts.push(timeout_ms);
            Ok(())
        }
    }

    #[test]
    fn test_wait_bounded_by_timer_and_timeout() {
        let calls = std::rc::Rc::new(std::cell::RefCell::new(Calls::default()));
        let mut lp = EventLoop::new(Box::new(RecordingPoller(calls.clone())), -1);
        let mut ready = Vec::new();

        lp.wait(0, &mut ready).unwrap();
        lp.timers.add(1000, 250, Box::new(|_| {}));
        lp.wait(1000, &mut ready).unwrap();
        lp.shrink_timeout(100);
        lp.wait(1000, &mut ready).unwrap();
        // Overdue timers never produce a negative timeout
        lp.wait(5000, &mut ready).unwrap();

        assert_eq!(calls.borrow().timeouts, vec![-1, 250, 100, 0]);
        assert_eq!(lp.poller_name(), "unknown");
    }

    #[test]
    fn test_registry_drives_poller() {
        let calls = std::rc::Rc::new(std::cell::RefCell::new(Calls::default()));
        let mut lp = EventLoop::new(Box::new(RecordingPoller(calls.clone())), -1);

        lp.add(7, FdKind::PipeWorker, Interest::READ).unwrap();
        lp.set_write(7, FdKind::PipeWorker, true).unwrap();
        lp.remove_read(7).unwrap();
        lp.set_write(7, FdKind::PipeWorker, false).unwrap();
        // Write interest on an unknown fd registers it
        lp.set_write(8, FdKind::PipeWorker, true).unwrap();
        assert!(lp.add(9, FdKind::Listener, Interest::default()).is_err());

        assert_eq!(
            calls.borrow().ops,
            vec![
                ("register", 7),
                ("reregister", 7),
                ("reregister", 7),
                ("deregister", 7),
                ("register", 8),
            ]
        );
        assert_eq!(lp.fds_of(FdKind::PipeWorker), vec![8]);
    }

    #[test]
    fn test_remove_read_keeps_write() {
        let mut lp = new_loop();
        lp.add(10, FdKind::Connection, Interest::BOTH).unwrap();
        lp.remove_read(10).unwrap();
        assert_eq!(lp.registration(10).unwrap().interest, Interest::WRITE);
        assert!(!lp.if_exit());

        lp.set_write(10, FdKind::Connection, false).unwrap();
        assert!(lp.registration(10).is_none());
        assert!(lp.if_exit());
    }

    #[test]
    fn test_del_unknown_fd_fails() {
        let mut lp = new_loop();
        assert_eq!(lp.del(99).unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(lp.remove_read(99).is_err());
    }

    #[test]
    fn test_timeout_only_shrinks() {
        let mut lp = new_loop();
        assert_eq!(lp.timeout_msec(), -1);
        lp.shrink_timeout(3000);
        assert_eq!(lp.timeout_msec(), 3000);
        lp.shrink_timeout(5000);
        assert_eq!(lp.timeout_msec(), 3000);
        lp.shrink_timeout(1000);
        assert_eq!(lp.timeout_msec(), 1000);
    }

    #[test]
    fn test_end_callbacks_ordered_and_idempotent() {
        fn a(_: &mut WorkerContext) {}
        fn b(_: &mut WorkerContext) {}

        let mut lp = new_loop();
        assert!(lp.set_end_callback(EndSlot::WorkerCallback, a));
        assert!(lp.set_end_callback(EndSlot::TryExit, a));
        assert!(lp.set_end_callback(EndSlot::Timer, b));
        assert!(!lp.set_end_callback(EndSlot::TryExit, b));

        let slots: Vec<EndSlot> = lp.end_callbacks().into_iter().map(|(s, _)| s).collect();
        assert_eq!(slots, vec![EndSlot::Timer, EndSlot::TryExit, EndSlot::WorkerCallback]);
    }

    #[test]
    fn test_timers_expire_in_order() {
        let mut timers = TimerTable::default();
        timers.add(1000, 50, Box::new(|_| {}));
        let second = timers.add(1000, 10, Box::new(|_| {}));
        timers.add(1000, 500, Box::new(|_| {}));
        assert_eq!(timers.next_deadline(), Some(1010));

        assert!(timers.cancel(second));
        assert!(!timers.cancel(second));
        assert_eq!(timers.take_expired(1050).len(), 1);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.clear(), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_pending_timer_blocks_exit() {
        let mut lp = new_loop();
        assert!(lp.if_exit());
        lp.timers.add(0, 10, Box::new(|_| {}));
        assert!(!lp.if_exit());
    }

    #[test]
    fn test_poll_reports_readable_pipe() {
        use std::os::unix::io::AsRawFd;
        let (a, b) = std::os::unix::net::UnixDatagram::pair().unwrap();

        let mut lp = new_loop();
        lp.add(b.as_raw_fd(), FdKind::PipeWorker, Interest::READ).unwrap();
        let mut ready = Vec::new();
        a.send(b"x").unwrap();
        lp.shrink_timeout(1000);
        lp.wait(0, &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, b.as_raw_fd());
        assert!(ready[0].readable);
    }
}
