//! Log sink and subscriber setup
//!
//! Workers log through `tracing` events. This module installs the global
//! subscriber once and owns the sink it writes to, so that a signal can ask
//! for the log file to be reopened after rotation.
//!
//! # Environment Variables
//!
//! - `SHOAL_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace, 0-5,
//!   or any `EnvFilter` directive
//! - `SHOAL_LOG_FILE=<path>` - append to this file instead of stderr
//! - `SHOAL_LOG_FLUSH=1` - flush after each write
//!
//! # Usage
//!
//! ```ignore
//! shoal_core::log::init();
//! tracing::info!(worker_id = 3, "worker started");
//! shoal_core::log::reopen()?; // after logrotate moved the file
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::env::{env_get_bool, env_get_opt, env_get_str};

static SINK: OnceLock<LogSink> = OnceLock::new();
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);

enum Target {
    Stderr,
    File(File),
}

/// Destination of formatted log lines
///
/// Cheap to clone; all clones share one target.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
    path: Option<PathBuf>,
}

impl LogSink {
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stderr)),
            path: None,
        }
    }

    /// Sink appending to `path`, created if missing
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self {
            target: Arc::new(Mutex::new(Target::File(file))),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reopen the backing file at its original path
    ///
    /// No-op for stderr sinks. On failure the previous handle stays in use.
    pub fn reopen(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = open_append(path)?;
        *self.lock() = Target::File(file);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let flush = FLUSH_ENABLED.load(Ordering::Relaxed);
        let mut target = self.lock();
        let n = match &mut *target {
            Target::Stderr => io::stderr().write(buf)?,
            Target::File(f) => f.write(buf)?,
        };
        if flush {
            match &mut *target {
                Target::Stderr => io::stderr().flush()?,
                Target::File(f) => f.flush()?,
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.lock() {
            Target::Stderr => io::stderr().flush(),
            Target::File(f) => f.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Translate a level word or digit into a filter directive
fn level_directive(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        "0" | "off" => "off".into(),
        "1" | "error" => "error".into(),
        "2" | "warn" => "warn".into(),
        "3" | "info" => "info".into(),
        "4" | "debug" => "debug".into(),
        "5" | "trace" => "trace".into(),
        other => other.to_string(),
    }
}

/// Initialize logging from environment variables
///
/// Idempotent. If another subscriber is already installed it is left alone
/// and only the sink is recorded.
pub fn init() -> &'static LogSink {
    let level = env_get_str("SHOAL_LOG_LEVEL", "info");
    let path: Option<PathBuf> = env_get_opt("SHOAL_LOG_FILE");
    FLUSH_ENABLED.store(env_get_bool("SHOAL_LOG_FLUSH", false), Ordering::Relaxed);
    init_with(&level, path.as_deref())
}

/// Initialize logging with an explicit level and optional file
pub fn init_with(level: &str, path: Option<&Path>) -> &'static LogSink {
    SINK.get_or_init(|| {
        let sink = match path.map(LogSink::file) {
            Some(Ok(sink)) => sink,
            Some(Err(e)) => {
                eprintln!("shoal: cannot open log file, using stderr: {}", e);
                LogSink::stderr()
            }
            None => LogSink::stderr(),
        };
        let filter = EnvFilter::try_new(level_directive(level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(sink.clone())
            .with_ansi(false)
            .with_thread_names(true)
            .try_init();
        sink
    })
}

/// The installed sink, if logging was initialized
pub fn sink() -> Option<&'static LogSink> {
    SINK.get()
}

/// Reopen the global log file (log rotation)
pub fn reopen() -> io::Result<()> {
    match SINK.get() {
        Some(sink) => sink.reopen(),
        None => Ok(()),
    }
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}
