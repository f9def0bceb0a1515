//! Explicit per-worker execution context
//!
//! Loop, dispatcher and coordinator all operate on one `WorkerContext`,
//! created by the entry loop and owned by the worker's thread.

use std::sync::Arc;

use crate::clock::Clock;
use crate::message_bus::MessageBus;
use crate::pipe::PipeEnd;
use crate::reactor::EventLoop;
use crate::server::Server;
use crate::shutdown::{Phase, ShutdownContext};
use crate::topology::{strategy_for, TopologyStrategy};
use crate::worker::Worker;

pub struct WorkerContext {
    pub server: Arc<Server>,
    pub worker_id: usize,
    pub event_loop: EventLoop,
    /// Taken out while a packet is being dispatched
    pub bus: Option<MessageBus>,
    pub shutdown: Option<ShutdownContext>,
    pub phase: Phase,
    pub strategy: &'static dyn TopologyStrategy,
    pub clock: Arc<dyn Clock>,
    /// Final status returned by the entry loop
    pub exit_code: i32,
}

impl WorkerContext {
    pub fn new(server: Arc<Server>, worker_id: usize, event_loop: EventLoop) -> Self {
        let strategy = strategy_for(server.config().topology);
        let clock = server.clock().clone();
        let bus = MessageBus::new(server.config().ipc_max_size);
        Self {
            server,
            worker_id,
            event_loop,
            bus: Some(bus),
            shutdown: None,
            phase: Phase::Running,
            strategy,
            clock,
            exit_code: 0,
        }
    }

    /// This worker's pool slot
    ///
    /// The id is validated when the context is created by the entry loop.
    pub fn worker(&self) -> &Worker {
        self.server.pool().slot(self.worker_id)
    }

    /// Endpoint this worker reads events from and replies on
    pub fn receive_end(&self) -> Option<&PipeEnd> {
        self.server.receive_end(self.worker_id)
    }

    /// Reactor slice of this worker
    #[inline]
    pub fn reactor_id(&self) -> usize {
        self.server.pool().reactor_of(self.worker_id)
    }

    #[inline]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn bus_is_empty(&self) -> bool {
        self.bus.as_ref().map_or(true, |b| b.empty())
    }
}
