//! Event header carried over worker pipes
//!
//! Every message on a worker pipe starts with a fixed 24-byte header:
//!
//! ```text
//! ┌──────┬───────┬────────────┬─────────┬──────────────┬──────────┐
//! │ type │ flags │ reactor_id │   len   │  session_id  │   time   │
//! │  u8  │  u8   │    u16     │   u32   │     i64      │   f64    │
//! └──────┴───────┴────────────┴─────────┴──────────────┴──────────┘
//!   0      1       2            4         8              16      24
//! ```
//!
//! All fields are little-endian. `len` is the payload length that follows
//! the header (for chunked messages, the length of this chunk only).

use core::fmt;

use crate::constants::EVENT_HEAD_SIZE;

/// Event kinds routed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    RecvData = 0,
    RecvDatagram = 1,
    Close = 2,
    Connect = 3,
    BufferFull = 4,
    BufferEmpty = 5,
    Finish = 6,
    PipeMessage = 7,
    CommandRequest = 8,
    CommandResponse = 9,
    Shutdown = 10,
}

impl EventType {
    /// Events that belong to the application rather than the coordinator
    #[inline]
    pub const fn is_application(&self) -> bool {
        !matches!(self, EventType::Shutdown)
    }
}

impl TryFrom<u8> for EventType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            0 => EventType::RecvData,
            1 => EventType::RecvDatagram,
            2 => EventType::Close,
            3 => EventType::Connect,
            4 => EventType::BufferFull,
            5 => EventType::BufferEmpty,
            6 => EventType::Finish,
            7 => EventType::PipeMessage,
            8 => EventType::CommandRequest,
            9 => EventType::CommandResponse,
            10 => EventType::Shutdown,
            other => return Err(other),
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::RecvData => "recv_data",
            EventType::RecvDatagram => "recv_datagram",
            EventType::Close => "close",
            EventType::Connect => "connect",
            EventType::BufferFull => "buffer_full",
            EventType::BufferEmpty => "buffer_empty",
            EventType::Finish => "finish",
            EventType::PipeMessage => "pipe_message",
            EventType::CommandRequest => "command_request",
            EventType::CommandResponse => "command_response",
            EventType::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Header flag bits
pub mod flags {
    /// First datagram of a chunked message
    pub const CHUNK_BEGIN: u8 = 1 << 0;
    /// Middle datagram of a chunked message
    pub const CHUNK: u8 = 1 << 1;
    /// Last datagram of a chunked message
    pub const CHUNK_END: u8 = 1 << 2;
    /// Reply carries an error description instead of a result
    pub const ERROR: u8 = 1 << 3;
    /// Shutdown record sent because the whole server is stopping
    pub const SERVER_STOP: u8 = 1 << 4;

    pub const CHUNK_MASK: u8 = CHUNK_BEGIN | CHUNK | CHUNK_END;
}

/// Fixed-size header preceding every pipe payload
///
/// The event type is kept as the raw byte so that unknown values reach the
/// dispatcher intact instead of failing at decode time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventRecord {
    pub event_type: u8,
    pub flags: u8,
    pub reactor_id: u16,
    pub len: u32,
    pub session_id: i64,
    pub time: f64,
}

impl EventRecord {
    pub fn new(event_type: EventType, session_id: i64) -> Self {
        Self {
            event_type: event_type as u8,
            flags: 0,
            reactor_id: 0,
            len: 0,
            session_id,
            time: 0.0,
        }
    }

    /// Control record asking a worker to begin shutdown
    pub fn shutdown() -> Self {
        Self::new(EventType::Shutdown, 0)
    }

    /// Shutdown record for a whole-server stop
    pub fn server_shutdown() -> Self {
        Self::shutdown().with_flags(flags::SERVER_STOP)
    }

    #[inline]
    pub fn with_reactor(mut self, reactor_id: u16) -> Self {
        self.reactor_id = reactor_id;
        self
    }

    #[inline]
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Decoded event type, or the raw byte when unknown
    #[inline]
    pub fn kind(&self) -> Result<EventType, u8> {
        EventType::try_from(self.event_type)
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn to_bytes(&self) -> [u8; EVENT_HEAD_SIZE] {
        let mut buf = [0u8; EVENT_HEAD_SIZE];
        buf[0] = self.event_type;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.reactor_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.session_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.time.to_le_bytes());
        buf
    }

    /// Decode a header from the front of `buf`
    ///
    /// Returns `None` if fewer than [`EVENT_HEAD_SIZE`] bytes are available.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let head: &[u8; EVENT_HEAD_SIZE] = buf.get(..EVENT_HEAD_SIZE)?.try_into().ok()?;
        Some(Self {
            event_type: head[0],
            flags: head[1],
            reactor_id: u16::from_le_bytes([head[2], head[3]]),
            len: u32::from_le_bytes([head[4], head[5], head[6], head[7]]),
            session_id: i64::from_le_bytes(head[8..16].try_into().ok()?),
            time: f64::from_le_bytes(head[16..24].try_into().ok()?),
        })
    }
}
