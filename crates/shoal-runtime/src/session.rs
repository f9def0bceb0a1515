//! Connection sessions seen by workers
//!
//! The session table is shared by every worker of a process. Lookups hand
//! out `Arc<Session>` clones so no map guard is held across callbacks or
//! loop operations.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

pub struct Session {
    pub session_id: i64,
    pub fd: RawFd,
    /// Reactor slice that owns the connection
    pub reactor_id: u16,
    closed: AtomicBool,
    /// Bytes forwarded to a worker but not yet dispatched
    recv_queued_bytes: AtomicI64,
    /// Milliseconds since the epoch of the last dispatch
    last_dispatch_time: AtomicI64,
    owned: Mutex<Option<OwnedFd>>,
}

impl Session {
    /// Session over a descriptor owned elsewhere
    pub fn new(session_id: i64, fd: RawFd, reactor_id: u16) -> Self {
        Self {
            session_id,
            fd,
            reactor_id,
            closed: AtomicBool::new(false),
            recv_queued_bytes: AtomicI64::new(0),
            last_dispatch_time: AtomicI64::new(0),
            owned: Mutex::new(None),
        }
    }

    /// Session that closes `fd` when the connection is closed
    pub fn owning(session_id: i64, fd: OwnedFd, reactor_id: u16) -> Self {
        let session = Self::new(session_id, fd.as_raw_fd(), reactor_id);
        *session.owned.lock().unwrap_or_else(|e| e.into_inner()) = Some(fd);
        session
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and release an owned descriptor. True on first close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.owned.lock().unwrap_or_else(|e| e.into_inner()).take();
        true
    }

    pub fn add_queued_bytes(&self, n: i64) {
        self.recv_queued_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_queued_bytes(&self, n: i64) {
        self.recv_queued_bytes.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn recv_queued_bytes(&self) -> i64 {
        self.recv_queued_bytes.load(Ordering::Relaxed)
    }

    pub fn set_last_dispatch_time(&self, ms: i64) {
        self.last_dispatch_time.store(ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn last_dispatch_time(&self) -> i64 {
        self.last_dispatch_time.load(Ordering::Relaxed)
    }
}

/// Concurrent map of live sessions keyed by session id
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<DashMap<i64, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.inner.insert(session.session_id, session.clone());
        session
    }

    pub fn get(&self, session_id: i64) -> Option<Arc<Session>> {
        self.inner.get(&session_id).map(|s| s.value().clone())
    }

    pub fn remove(&self, session_id: i64) -> Option<Arc<Session>> {
        self.inner.remove(&session_id).map(|(_, s)| s)
    }

    /// Mark a session closed. Returns it if it existed.
    pub fn mark_closed(&self, session_id: i64) -> Option<Arc<Session>> {
        let session = self.get(session_id)?;
        session.close();
        Some(session)
    }

    /// Open sessions, optionally restricted to one reactor slice
    pub fn live(&self, reactor_id: Option<u16>) -> Vec<Arc<Session>> {
        self.inner
            .iter()
            .filter(|s| !s.is_closed())
            .filter(|s| reactor_id.map_or(true, |r| s.reactor_id == r))
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
