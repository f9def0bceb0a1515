//! Server configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters (programmatic)
//! 2. Environment variables (`SHOAL_*`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use shoal_runtime::config::ServerConfig;
//! use shoal_core::Topology;
//!
//! let config = ServerConfig::from_env()
//!     .topology(Topology::Thread)
//!     .worker_num(4)
//!     .max_request(10_000);
//! config.validate()?;
//! ```

use shoal_core::constants::{DEFAULT_IPC_MAX_SIZE, DEFAULT_LOOP_TIMEOUT_MS, DEFAULT_MAX_WAIT_TIME, EVENT_HEAD_SIZE, MAX_WORKERS};
use shoal_core::env::{env_get, env_get_bool, env_get_opt};
use shoal_core::{DispatchMode, ShoalError, ShoalResult, Topology};

/// Library defaults
pub mod defaults {
    use super::*;

    pub const TOPOLOGY: Topology = Topology::Process;
    pub const WORKER_NUM: usize = 4;
    pub const TASK_WORKER_NUM: usize = 0;
    /// 0 = one reactor per event worker
    pub const REACTOR_NUM: usize = 0;
    pub const MAX_REQUEST: u64 = 0;
    pub const MAX_WAIT_TIME: u64 = DEFAULT_MAX_WAIT_TIME;
    pub const RELOAD_ASYNC: bool = true;
    pub const DISCARD_TIMEOUT_REQUEST: bool = true;
    pub const DISABLE_NOTIFY: bool = false;
    pub const DISPATCH_MODE: DispatchMode = DispatchMode::Fixed;
    pub const IPC_MAX_SIZE: usize = DEFAULT_IPC_MAX_SIZE;
    pub const LOOP_TIMEOUT_MS: i64 = DEFAULT_LOOP_TIMEOUT_MS;
}

/// Server configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How workers are realised
    pub topology: Topology,
    /// Number of event workers
    pub worker_num: usize,
    /// Number of task workers (ids follow the event workers)
    pub task_worker_num: usize,
    /// Number of reactor slices in thread mode, 0 = `worker_num`
    pub reactor_num: usize,
    /// Requests a worker serves before recycling itself, 0 = unlimited
    pub max_request: u64,
    /// Graceful exit budget in whole seconds
    pub max_wait_time: u64,
    /// Drain in-flight work on shutdown instead of stopping at once
    pub reload_async: bool,
    /// Drop data for sessions that no longer exist
    pub discard_timeout_request: bool,
    /// Connection notifications are not forwarded to workers
    pub disable_notify: bool,
    pub dispatch_mode: DispatchMode,
    /// Largest payload carried by one pipe datagram
    pub ipc_max_size: usize,
    /// Initial loop poll timeout, -1 = infinite
    pub loop_timeout_ms: i64,
}

impl ServerConfig {
    /// Library defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self {
            topology: env_get_opt("SHOAL_TOPOLOGY").unwrap_or(defaults::TOPOLOGY),
            worker_num: env_get("SHOAL_WORKER_NUM", defaults::WORKER_NUM),
            task_worker_num: env_get("SHOAL_TASK_WORKER_NUM", defaults::TASK_WORKER_NUM),
            reactor_num: env_get("SHOAL_REACTOR_NUM", defaults::REACTOR_NUM),
            max_request: env_get("SHOAL_MAX_REQUEST", defaults::MAX_REQUEST),
            max_wait_time: env_get("SHOAL_MAX_WAIT_TIME", defaults::MAX_WAIT_TIME),
            reload_async: env_get_bool("SHOAL_RELOAD_ASYNC", defaults::RELOAD_ASYNC),
            discard_timeout_request: env_get_bool(
                "SHOAL_DISCARD_TIMEOUT_REQUEST",
                defaults::DISCARD_TIMEOUT_REQUEST,
            ),
            disable_notify: env_get_bool("SHOAL_DISABLE_NOTIFY", defaults::DISABLE_NOTIFY),
            dispatch_mode: env_get_opt("SHOAL_DISPATCH_MODE").unwrap_or(defaults::DISPATCH_MODE),
            ipc_max_size: env_get("SHOAL_IPC_MAX_SIZE", defaults::IPC_MAX_SIZE),
            loop_timeout_ms: env_get("SHOAL_LOOP_TIMEOUT_MS", defaults::LOOP_TIMEOUT_MS),
        }
    }

    /// Library defaults only, ignoring the environment
    pub fn new() -> Self {
        Self {
            topology: defaults::TOPOLOGY,
            worker_num: defaults::WORKER_NUM,
            task_worker_num: defaults::TASK_WORKER_NUM,
            reactor_num: defaults::REACTOR_NUM,
            max_request: defaults::MAX_REQUEST,
            max_wait_time: defaults::MAX_WAIT_TIME,
            reload_async: defaults::RELOAD_ASYNC,
            discard_timeout_request: defaults::DISCARD_TIMEOUT_REQUEST,
            disable_notify: defaults::DISABLE_NOTIFY,
            dispatch_mode: defaults::DISPATCH_MODE,
            ipc_max_size: defaults::IPC_MAX_SIZE,
            loop_timeout_ms: defaults::LOOP_TIMEOUT_MS,
        }
    }

    pub fn topology(mut self, t: Topology) -> Self {
        self.topology = t;
        self
    }

    pub fn worker_num(mut self, n: usize) -> Self {
        self.worker_num = n;
        self
    }

    pub fn task_worker_num(mut self, n: usize) -> Self {
        self.task_worker_num = n;
        self
    }

    pub fn reactor_num(mut self, n: usize) -> Self {
        self.reactor_num = n;
        self
    }

    pub fn max_request(mut self, n: u64) -> Self {
        self.max_request = n;
        self
    }

    pub fn max_wait_time(mut self, secs: u64) -> Self {
        self.max_wait_time = secs;
        self
    }

    pub fn reload_async(mut self, enable: bool) -> Self {
        self.reload_async = enable;
        self
    }

    pub fn discard_timeout_request(mut self, enable: bool) -> Self {
        self.discard_timeout_request = enable;
        self
    }

    pub fn disable_notify(mut self, enable: bool) -> Self {
        self.disable_notify = enable;
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn ipc_max_size(mut self, size: usize) -> Self {
        self.ipc_max_size = size;
        self
    }

    pub fn loop_timeout_ms(mut self, ms: i64) -> Self {
        self.loop_timeout_ms = ms;
        self
    }

    /// Total worker slots (event + task)
    #[inline]
    pub fn total_workers(&self) -> usize {
        self.worker_num + self.task_worker_num
    }

    /// Reactor slice count with the 0 default resolved
    #[inline]
    pub fn effective_reactor_num(&self) -> usize {
        if self.reactor_num == 0 {
            self.worker_num.max(1)
        } else {
            self.reactor_num
        }
    }

    /// Whether data for an unknown session is dropped
    ///
    /// Only kept when notifications are disabled and timeout discarding was
    /// explicitly turned off.
    #[inline]
    pub fn discards_orphan_data(&self) -> bool {
        !(self.disable_notify && !self.discard_timeout_request)
    }

    /// Validate configuration
    pub fn validate(&self) -> ShoalResult<()> {
        let invalid = |msg: &str| Err(ShoalError::Config(msg.to_string()));
        if self.worker_num == 0 {
            return invalid("worker_num must be > 0");
        }
        if self.total_workers() > MAX_WORKERS {
            return Err(ShoalError::Config(format!(
                "worker_num + task_worker_num must be <= {}",
                MAX_WORKERS
            )));
        }
        if self.reactor_num > self.worker_num {
            return invalid("reactor_num must be <= worker_num");
        }
        if self.ipc_max_size <= EVENT_HEAD_SIZE {
            return Err(ShoalError::Config(format!(
                "ipc_max_size must be > {}",
                EVENT_HEAD_SIZE
            )));
        }
        if self.loop_timeout_ms < -1 {
            return invalid("loop_timeout_ms must be >= -1");
        }
        if self.topology == Topology::Base && self.worker_num != 1 {
            return invalid("base topology runs exactly one event worker");
        }
        Ok(())
    }

    /// Log the effective configuration
    pub fn log_summary(&self) {
        tracing::info!(
            topology = %self.topology,
            worker_num = self.worker_num,
            task_worker_num = self.task_worker_num,
            reactor_num = self.effective_reactor_num(),
            max_request = self.max_request,
            max_wait_time = self.max_wait_time,
            reload_async = self.reload_async,
            dispatch_mode = ?self.dispatch_mode,
            ipc_max_size = self.ipc_max_size,
            "server configuration"
        );
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_wait_time, 3);
        assert!(config.reload_async);
        assert_eq!(config.effective_reactor_num(), config.worker_num);
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .topology(Topology::Thread)
            .worker_num(8)
            .task_worker_num(2)
            .reactor_num(4)
            .max_request(100);

        assert_eq!(config.topology, Topology::Thread);
        assert_eq!(config.total_workers(), 10);
        assert_eq!(config.effective_reactor_num(), 4);
        assert_eq!(config.max_request, 100);
    }

    #[test]
    fn test_validate_rejects() {
        let err = ServerConfig::new().worker_num(0).validate().unwrap_err();
        assert_eq!(err.code(), shoal_core::error::ERR_CONFIG);

        assert!(ServerConfig::new().ipc_max_size(EVENT_HEAD_SIZE).validate().is_err());
        assert!(ServerConfig::new().worker_num(2).reactor_num(3).validate().is_err());
        assert!(ServerConfig::new().topology(Topology::Base).worker_num(2).validate().is_err());
        assert!(ServerConfig::new().loop_timeout_ms(-5).validate().is_err());
    }

    #[test]
    fn test_orphan_discard_policy() {
        let base = ServerConfig::new();
        assert!(base.clone().discards_orphan_data());
        assert!(base.clone().disable_notify(true).discards_orphan_data());
        assert!(!base
            .clone()
            .disable_notify(true)
            .discard_timeout_request(false)
            .discards_orphan_data());
        assert!(base.discard_timeout_request(false).discards_orphan_data());
    }
}
