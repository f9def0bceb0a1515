//! Worker status, worker kind and server topology types

use core::fmt;
use core::str::FromStr;

/// Status of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Waiting for the next event
    Idle = 0,

    /// Inside a dispatch
    Busy = 1,

    /// Shutdown has begun; no application event is dispatched any more
    ShuttingDown = 2,
}

impl WorkerStatus {
    /// Check if the worker may still receive application events
    #[inline]
    pub const fn accepts_events(&self) -> bool {
        !matches!(self, WorkerStatus::ShuttingDown)
    }

    #[inline]
    pub const fn is_shutting_down(&self) -> bool {
        matches!(self, WorkerStatus::ShuttingDown)
    }
}

impl From<u8> for WorkerStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Busy,
            _ => WorkerStatus::ShuttingDown,
        }
    }
}

impl From<WorkerStatus> for u8 {
    fn from(status: WorkerStatus) -> u8 {
        status as u8
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::ShuttingDown => write!(f, "shutting-down"),
        }
    }
}

/// Kind of work a slot performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerType {
    /// Handles connection and datagram events
    Event = 0,

    /// Handles offloaded tasks and reports `Finish`
    Task = 1,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Event => write!(f, "event"),
            WorkerType::Task => write!(f, "task"),
        }
    }
}

/// How workers are realised. Fixed for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Topology {
    /// One OS process per worker
    Process = 0,

    /// One OS thread per worker inside a single process
    Thread = 1,

    /// A single in-process event loop multiplexing logical workers
    Base = 2,
}

impl Topology {
    /// Topologies that own the listening sockets inside the worker loop
    #[inline]
    pub const fn worker_owns_listeners(&self) -> bool {
        matches!(self, Topology::Process | Topology::Base)
    }

    /// Process-wide signal handlers are only installed outside thread mode
    #[inline]
    pub const fn installs_signal_handlers(&self) -> bool {
        !matches!(self, Topology::Thread)
    }
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Topology::Process),
            "thread" => Ok(Topology::Thread),
            "base" => Ok(Topology::Base),
            other => Err(format!("unknown topology '{}'", other)),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Process => write!(f, "process"),
            Topology::Thread => write!(f, "thread"),
            Topology::Base => write!(f, "base"),
        }
    }
}

/// Connection-to-worker dispatch policy
///
/// Numbering follows the values operators already configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchMode {
    RoundRobin = 1,
    Fixed = 2,
    Preempt = 3,
    IpMod = 4,
    UidMod = 5,
    Stream = 7,
    /// Least-coroutines, sticky per connection
    CoConnLb = 8,
    /// Least-coroutines, per request
    CoReqLb = 9,
    Concurrent = 10,
}

impl DispatchMode {
    /// Modes that balance on the per-worker coroutine count
    #[inline]
    pub const fn samples_coroutines(&self) -> bool {
        matches!(self, DispatchMode::CoConnLb | DispatchMode::CoReqLb)
    }
}

impl TryFrom<u8> for DispatchMode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(DispatchMode::RoundRobin),
            2 => Ok(DispatchMode::Fixed),
            3 => Ok(DispatchMode::Preempt),
            4 => Ok(DispatchMode::IpMod),
            5 => Ok(DispatchMode::UidMod),
            7 => Ok(DispatchMode::Stream),
            8 => Ok(DispatchMode::CoConnLb),
            9 => Ok(DispatchMode::CoReqLb),
            10 => Ok(DispatchMode::Concurrent),
            other => Err(other),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u8>() {
            return DispatchMode::try_from(n).map_err(|v| format!("unknown dispatch mode {}", v));
        }
        match s.to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(DispatchMode::RoundRobin),
            "fixed" => Ok(DispatchMode::Fixed),
            "preempt" => Ok(DispatchMode::Preempt),
            "ip_mod" => Ok(DispatchMode::IpMod),
            "uid_mod" => Ok(DispatchMode::UidMod),
            "stream" => Ok(DispatchMode::Stream),
            "co_conn_lb" => Ok(DispatchMode::CoConnLb),
            "co_req_lb" => Ok(DispatchMode::CoReqLb),
            "concurrent" => Ok(DispatchMode::Concurrent),
            other => Err(format!("unknown dispatch mode '{}'", other)),
        }
    }
}
