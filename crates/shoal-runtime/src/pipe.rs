//! Worker pipes
//!
//! Each worker owns one `AF_UNIX` datagram socketpair. Datagrams keep message
//! boundaries, so one header plus its payload always arrive together.
//!
//! ```text
//!    other workers / master                      worker loop
//!            │                                        ▲
//!            ▼  send                          recv    │
//!      ┌───────────┐      socketpair       ┌───────────┐
//!      │  master   │ ◄───────────────────► │  worker   │
//!      └───────────┘                       └───────────┘
//!            ▲  recv (replies)          send (replies)│
//! ```
//!
//! Sends never block the loop: a send that would block is queued on the
//! endpoint and flushed later, either when the loop reports the descriptor
//! writable or by the final drain at worker exit.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use shoal_core::constants::EVENT_HEAD_SIZE;
use shoal_core::{flags, EventRecord};

/// Upper bound on the blocking part of a final drain
const DRAIN_WAIT: Duration = Duration::from_millis(200);

/// One side of a worker socketpair
pub struct PipeEnd {
    sock: UnixDatagram,
    nonblocking: AtomicBool,
    pending: Mutex<VecDeque<Vec<u8>>>,
}

impl PipeEnd {
    fn new(sock: UnixDatagram) -> Self {
        Self {
            sock,
            nonblocking: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn set_nonblocking(&self, enable: bool) -> io::Result<()> {
        self.sock.set_nonblocking(enable)?;
        self.nonblocking.store(enable, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queued datagrams not yet written
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0
    }

    /// Send one datagram, queueing it if the socket would block
    ///
    /// Order is preserved: while anything is queued, new datagrams go to the
    /// back of the queue.
    pub fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let mut queue = self.pending();
        if queue.is_empty() {
            match self.sock.send(datagram) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        queue.push_back(datagram.to_vec());
        Ok(())
    }

    /// Send one datagram now, waiting at most `wait` for room
    ///
    /// Never queues. Anything already queued is flushed first so order is
    /// kept; if the peer does not make room in time the send fails with
    /// `WouldBlock` and nothing of `datagram` was written.
    pub fn send_now(&self, datagram: &[u8], wait: Duration) -> io::Result<()> {
        let start = Instant::now();
        loop {
            let sent = match self.flush() {
                Ok(0) => self.send_dontwait(datagram),
                Ok(_) => Err(io::ErrorKind::WouldBlock.into()),
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            let elapsed = start.elapsed();
            if elapsed >= wait {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.wait_writable(wait - elapsed)?;
        }
    }

    /// Non-blocking send regardless of the socket's blocking mode
    fn send_dontwait(&self, datagram: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            libc::send(
                self.fd(),
                datagram.as_ptr() as *const libc::c_void,
                datagram.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_writable(&self, wait: Duration) -> io::Result<()> {
        let wait_ms = wait.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, wait_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Send a header and payload, splitting into chunks above `max_size`
    ///
    /// Chunked messages carry `CHUNK_BEGIN`, `CHUNK`, `CHUNK_END` in order and
    /// each header's `len` is the length of its own chunk.
    pub fn send_message(&self, record: &EventRecord, payload: &[u8], max_size: usize) -> io::Result<()> {
        let room = max_size.saturating_sub(EVENT_HEAD_SIZE).max(1);
        if payload.len() <= room {
            let mut head = *record;
            head.len = payload.len() as u32;
            return self.send(&frame(&head, payload));
        }

        let chunks: Vec<&[u8]> = payload.chunks(room).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut head = *record;
            head.len = chunk.len() as u32;
            head.flags = (record.flags & !flags::CHUNK_MASK)
                | match i {
                    0 => flags::CHUNK_BEGIN,
                    n if n == last => flags::CHUNK_END,
                    _ => flags::CHUNK,
                };
            self.send(&frame(&head, chunk))?;
        }
        Ok(())
    }

    /// Receive one datagram
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    /// Write queued datagrams until the queue is empty or the socket is full
    ///
    /// Returns the number of datagrams still queued.
    pub fn flush(&self) -> io::Result<usize> {
        let mut queue = self.pending();
        while let Some(front) = queue.front() {
            match self.sock.send(front) {
                Ok(_) => {
                    queue.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(queue.len())
    }

    /// Flush with a bounded wait for the peer to make room
    ///
    /// Whatever is still queued after [`DRAIN_WAIT`] is left in place.
    pub fn drain(&self) -> io::Result<usize> {
        let start = Instant::now();
        loop {
            let left = self.flush()?;
            if left == 0 {
                return Ok(0);
            }
            let elapsed = start.elapsed();
            if elapsed >= DRAIN_WAIT {
                return Ok(left);
            }
            self.wait_writable(DRAIN_WAIT - elapsed)?;
        }
    }
}

fn frame(head: &EventRecord, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EVENT_HEAD_SIZE + payload.len());
    buf.extend_from_slice(&head.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Socketpair connecting a worker with everyone who talks to it
pub struct WorkerPipe {
    /// Written by other workers and the master; replies are read here
    pub master: PipeEnd,
    /// Read by the owning worker; replies are written here
    pub worker: PipeEnd,
}

impl WorkerPipe {
    pub fn new() -> io::Result<Self> {
        let (master, worker) = UnixDatagram::pair()?;
        let pipe = Self {
            master: PipeEnd::new(master),
            worker: PipeEnd::new(worker),
        };
        pipe.worker.set_nonblocking(true)?;
        Ok(pipe)
    }

    /// Flush both directions, best effort
    pub fn drain(&self) -> io::Result<usize> {
        let left = self.master.drain()?;
        Ok(left + self.worker.drain()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_boundaries() {
        let pipe = WorkerPipe::new().unwrap();
        let rec = EventRecord::new(shoal_core::EventType::RecvData, 5);
        pipe.master.send_message(&rec, b"hello", 8192).unwrap();
        pipe.master.send_message(&rec, b"world!", 8192).unwrap();

        let mut buf = [0u8; 128];
        let n = pipe.worker.recv(&mut buf).unwrap();
        assert_eq!(n, EVENT_HEAD_SIZE + 5);
        let head = EventRecord::from_bytes(&buf[..n]).unwrap();
        assert_eq!(head.len, 5);
        assert_eq!(&buf[EVENT_HEAD_SIZE..n], b"hello");

        let n = pipe.worker.recv(&mut buf).unwrap();
        assert_eq!(&buf[EVENT_HEAD_SIZE..n], b"world!");
    }

    #[test]
    fn test_chunk_flags() {
        let pipe = WorkerPipe::new().unwrap();
        let rec = EventRecord::new(shoal_core::EventType::PipeMessage, 1);
        let payload = vec![7u8; 20];
        // 8 bytes of room per datagram: 8 + 8 + 4
        pipe.master.send_message(&rec, &payload, EVENT_HEAD_SIZE + 8).unwrap();

        let mut buf = [0u8; 64];
        let mut seen = Vec::new();
        for _ in 0..3 {
            let n = pipe.worker.recv(&mut buf).unwrap();
            let head = EventRecord::from_bytes(&buf[..n]).unwrap();
            seen.push((head.flags & flags::CHUNK_MASK, head.len));
        }
        assert_eq!(
            seen,
            vec![(flags::CHUNK_BEGIN, 8), (flags::CHUNK, 8), (flags::CHUNK_END, 4)]
        );
    }

    #[test]
    fn test_send_now_fails_on_full_peer() {
        let pipe = WorkerPipe::new().unwrap();
        let datagram = vec![0u8; 4096];
        // Blocking mode on the socket does not make send_now block
        assert!(!pipe.master.is_nonblocking());
        let mut sent = 0;
        loop {
            match pipe.master.send_now(&datagram, Duration::ZERO) {
                Ok(()) => sent += 1,
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
                    break;
                }
            }
            assert!(sent < 100_000, "socket never filled");
        }
        let err = pipe.master.send_now(b"late", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(pipe.master.pending_len(), 0);

        // Room again after the reader drains one datagram
        let mut buf = vec![0u8; 8192];
        pipe.worker.recv(&mut buf).unwrap();
        pipe.master.send_now(b"late", Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn test_would_block_queues_then_flushes() {
        let pipe = WorkerPipe::new().unwrap();
        pipe.master.set_nonblocking(true).unwrap();
        let datagram = vec![0u8; 4096];

        // Fill the socket buffer until sends start queueing.
        let mut sent = 0;
        while !pipe.master.has_pending() {
            pipe.master.send(&datagram).unwrap();
            sent += 1;
            assert!(sent < 100_000, "socket never filled");
        }
        assert_eq!(pipe.master.pending_len(), 1);

        // Reader drains everything; flush writes the rest.
        let mut buf = vec![0u8; 8192];
        let mut received = 0;
        while received < sent {
            match pipe.worker.recv(&mut buf) {
                Ok(_) => received += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    pipe.master.flush().unwrap();
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        }
        assert_eq!(received, sent);
        assert!(!pipe.master.has_pending());
    }
}
