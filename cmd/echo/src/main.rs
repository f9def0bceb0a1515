//! Pipe echo demo
//!
//! Starts thread-topology workers, sends each one an echo command over its
//! pipe, recycles one worker with `kill_worker`, then shuts the server down.
//!
//! # Environment Variables
//!
//! - `SHOAL_WORKER_NUM=4` - Number of worker threads
//! - `SHOAL_LOG_LEVEL=debug` - Log level (off, error, warn, info, debug, trace)
//! - `SHOAL_LOG_FILE=/tmp/shoal.log` - Log to a file instead of stderr

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal::{flags, EventRecord, EventType, Runtime, Server, ServerConfig, Topology};

const CMD_ECHO: u32 = 1;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

// SHOAL_LOG_LEVEL=debug cargo run -p shoal-echo
fn main() {
    shoal::init_logging();

    let config = ServerConfig::from_env().topology(Topology::Thread);
    let messages = Arc::new(AtomicUsize::new(0));
    let seen = messages.clone();

    let server = match Server::builder(config)
        .command(CMD_ECHO, |_, args| Ok(args.to_vec()))
        .on_pipe_message(move |_, worker, ev| {
            tracing::info!(worker_id = worker.id, len = ev.data.len(), "pipe message");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_worker_stop(|_, worker| {
            tracing::info!(worker_id = worker.id, requests = worker.request_count(), "worker stop");
        })
        .build()
    {
        Ok(server) => server,
        Err(e) => {
            eprintln!("shoal-echo: {}", e);
            std::process::exit(1);
        }
    };

    println!("=== shoal echo ({} workers) ===\n", server.config().worker_num);

    let mut runtime = Runtime::new(server);
    let result = runtime.block_on(|server| {
        for id in 0..server.config().worker_num {
            match echo(server, id, format!("hello worker {}", id).as_bytes()) {
                Ok(reply) => println!("worker {} replied: {}", id, String::from_utf8_lossy(&reply)),
                Err(e) => println!("worker {} did not reply: {}", id, e),
            }
        }

        if server.config().worker_num > 1 {
            if let Err(e) = server.kill_worker(Some(1)) {
                println!("kill_worker(1) failed: {}", e);
            }
        }

        let note = EventRecord::new(EventType::PipeMessage, 0);
        if let Some(master) = server.pool().slot(0).pipe_master() {
            let _ = master.send_message(&note, b"goodbye", server.config().ipc_max_size);
        }
    });

    if let Err(e) = result {
        eprintln!("shoal-echo: {}", e);
        std::process::exit(1);
    }
    println!("\npipe messages handled: {}", messages.load(Ordering::SeqCst));
    println!("=== done ===");
}

/// Send an echo command to worker `id` and wait for its reply
fn echo(server: &Server, id: usize, text: &[u8]) -> io::Result<Vec<u8>> {
    let master = server
        .pool()
        .slot(id)
        .pipe_master()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "worker has no pipe"))?;

    let mut payload = CMD_ECHO.to_le_bytes().to_vec();
    payload.extend_from_slice(text);
    let request = EventRecord::new(EventType::CommandRequest, id as i64);
    master.send_message(&request, &payload, server.config().ipc_max_size)?;

    let mut buf = vec![0u8; server.config().ipc_max_size];
    let start = Instant::now();
    loop {
        match master.recv(&mut buf) {
            Ok(n) => {
                let head = EventRecord::from_bytes(&buf[..n])
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short reply"))?;
                let body = buf[shoal::constants::EVENT_HEAD_SIZE..n].to_vec();
                if head.has_flag(flags::ERROR) {
                    return Err(io::Error::new(io::ErrorKind::Other, String::from_utf8_lossy(&body)));
                }
                return Ok(body);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() > REPLY_TIMEOUT {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
}
