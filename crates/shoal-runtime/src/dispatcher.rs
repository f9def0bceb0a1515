//! Event dispatcher
//!
//! Every record read from a worker pipe ends in exactly one of: an
//! application callback, internal bookkeeping, or a logged discard. The
//! worker is marked busy around the dispatch and idled afterwards; the
//! request ceiling is checked once the worker is idle again.

use shoal_core::error::{
    ERR_PROTOCOL, ERR_SESSION_DISCARD_DATA, ERR_UNKNOWN_COMMAND, ERR_WORKER_SHUTTING_DOWN,
};
use shoal_core::{flags, EventRecord, EventType};

use crate::callbacks::{DataHandler, EventHandler};
use crate::context::WorkerContext;
use crate::message_bus::EventData;
use crate::reactor::FdKind;
use crate::shutdown::{stop_async_worker, Phase, Trigger};

/// Where a record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Callback,
    Internal,
    Discarded,
}

/// Route one record to its handler
pub fn accept_event(ctx: &mut WorkerContext, info: &EventRecord, data: &[u8]) -> Outcome {
    let server = ctx.server.clone();
    let worker = server.pool().slot(ctx.worker_id);
    let kind = info.kind();

    if kind == Ok(EventType::Shutdown) {
        // A forked worker holds its own copy of the running flag
        if info.has_flag(flags::SERVER_STOP) {
            server.set_running(false);
        }
        stop_async_worker(ctx, Trigger::ControlMessage);
        return Outcome::Internal;
    }
    if worker.is_shutting_down() {
        tracing::warn!(
            code = %ERR_WORKER_SHUTTING_DOWN,
            worker_id = ctx.worker_id,
            event_type = info.event_type,
            session_id = info.session_id,
            "worker is shutting down, event discarded"
        );
        return Outcome::Discarded;
    }

    worker.set_busy();
    let callbacks = server.callbacks();
    let outcome = match kind {
        Ok(EventType::RecvData) => {
            let session = server.sessions().get(info.session_id);
            if let Some(s) = &session {
                if info.len > 0 {
                    s.sub_queued_bytes(info.len as i64);
                    s.set_last_dispatch_time(ctx.now_ms());
                }
            }
            let discard = match &session {
                Some(s) => s.is_closed(),
                None => server.config().discards_orphan_data(),
            };
            if discard {
                tracing::warn!(
                    code = %ERR_SESSION_DISCARD_DATA,
                    worker_id = ctx.worker_id,
                    session_id = info.session_id,
                    len = info.len,
                    "session closed, data discarded"
                );
                Outcome::Discarded
            } else {
                if do_task(ctx, callbacks.on_receive.as_ref(), info, data) {
                    worker.add_request_count();
                    server.add_request_count();
                }
                Outcome::Callback
            }
        }
        Ok(EventType::RecvDatagram) => {
            do_task(ctx, callbacks.on_packet.as_ref(), info, data);
            Outcome::Callback
        }
        Ok(EventType::Close) => {
            server.sessions().mark_closed(info.session_id);
            notify(ctx, callbacks.on_close.as_ref(), info)
        }
        Ok(EventType::Connect) => notify(ctx, callbacks.on_connect.as_ref(), info),
        Ok(EventType::BufferFull) => notify(ctx, callbacks.on_buffer_full.as_ref(), info),
        Ok(EventType::BufferEmpty) => notify(ctx, callbacks.on_buffer_empty.as_ref(), info),
        Ok(EventType::Finish) => {
            do_task(ctx, callbacks.on_finish.as_ref(), info, data);
            Outcome::Callback
        }
        Ok(EventType::PipeMessage) => {
            if callbacks.on_pipe_message.is_none() {
                tracing::warn!(
                    code = %ERR_PROTOCOL,
                    worker_id = ctx.worker_id,
                    "pipe message without an on_pipe_message callback"
                );
                Outcome::Discarded
            } else {
                do_task(ctx, callbacks.on_pipe_message.as_ref(), info, data);
                Outcome::Callback
            }
        }
        Ok(EventType::CommandRequest) => {
            handle_command(ctx, info, data);
            Outcome::Internal
        }
        Ok(EventType::CommandResponse) | Ok(EventType::Shutdown) | Err(_) => {
            tracing::warn!(
                code = %ERR_PROTOCOL,
                worker_id = ctx.worker_id,
                event_type = info.event_type,
                "unexpected event type"
            );
            Outcome::Discarded
        }
    };
    worker.set_idle();

    if worker.has_exceeded_limit() && ctx.phase == Phase::Running {
        tracing::info!(
            worker_id = ctx.worker_id,
            requests = worker.request_count(),
            max_request = worker.max_request(),
            "request ceiling reached"
        );
        stop_async_worker(ctx, Trigger::RequestLimit);
    }
    outcome
}

/// Run a payload callback. True if it ran and returned Ok.
fn do_task(ctx: &WorkerContext, handler: Option<&DataHandler>, info: &EventRecord, data: &[u8]) -> bool {
    let Some(handler) = handler else {
        tracing::debug!(worker_id = ctx.worker_id, event_type = info.event_type, "no callback registered");
        return false;
    };
    match handler(&ctx.server, ctx.worker(), &EventData { info, data }) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                worker_id = ctx.worker_id,
                session_id = info.session_id,
                error = %e,
                "callback failed"
            );
            false
        }
    }
}

fn notify(ctx: &WorkerContext, handler: Option<&EventHandler>, info: &EventRecord) -> Outcome {
    match handler {
        Some(cb) => {
            cb(&ctx.server, ctx.worker(), info);
            Outcome::Callback
        }
        None => Outcome::Internal,
    }
}

/// Answer a command request over the worker's own pipe
///
/// Request payload: `[command_id: u32 LE][args]`. The response carries the
/// request's session id and, on failure, the `ERROR` flag with the error
/// text as payload.
fn handle_command(ctx: &mut WorkerContext, info: &EventRecord, data: &[u8]) {
    let server = ctx.server.clone();
    let reply = match data.get(..4) {
        None => Err(format!("command request of {} bytes", data.len())),
        Some(id) => {
            let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
            match server.command(id) {
                Some(handler) => handler(&server, &data[4..]),
                None => Err(format!("unknown command {}", id)),
            }
        }
    };

    let mut response = EventRecord::new(EventType::CommandResponse, info.session_id)
        .with_reactor(info.reactor_id);
    let payload = match reply {
        Ok(bytes) => bytes,
        Err(msg) => {
            tracing::warn!(
                code = %ERR_UNKNOWN_COMMAND,
                worker_id = ctx.worker_id,
                session_id = info.session_id,
                error = %msg,
                "command failed"
            );
            response.flags |= flags::ERROR;
            msg.into_bytes()
        }
    };

    let Some(end) = server.receive_end(ctx.worker_id) else {
        tracing::warn!(worker_id = ctx.worker_id, "no pipe to answer a command on");
        return;
    };
    if let Err(e) = end.send_message(&response, &payload, server.config().ipc_max_size) {
        tracing::warn!(worker_id = ctx.worker_id, error = %e, "command response not sent");
        return;
    }
    if end.has_pending() {
        if let Err(e) = ctx.event_loop.set_write(end.fd(), FdKind::PipeWorker, true) {
            tracing::debug!(worker_id = ctx.worker_id, error = %e, "pipe write interest not set");
        }
    }
}

/// Read the worker pipe once and dispatch a completed packet
pub fn on_pipe_receive(ctx: &mut WorkerContext) {
    let Some(mut bus) = ctx.bus.take() else { return };
    let server = ctx.server.clone();
    if let Some(end) = server.receive_end(ctx.worker_id) {
        match bus.read(end) {
            Ok(None) => {}
            Ok(Some(_)) => {
                if let Some(packet) = bus.get_packet() {
                    let info = *packet.info;
                    accept_event(ctx, &info, packet.data);
                }
                bus.pop();
            }
            Err(e) => {
                tracing::warn!(code = %e.code(), worker_id = ctx.worker_id, error = %e, "pipe read failed");
            }
        }
    }
    ctx.bus = Some(bus);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use shoal_core::{Topology, WorkerStatus};

    use crate::config::ServerConfig;
    use crate::reactor::{EventLoop, PollPoller};
    use crate::server::{Server, ServerBuilder};
    use crate::session::Session;

    fn ctx_with(builder: ServerBuilder) -> WorkerContext {
        let server = builder.build().unwrap();
        let mut lp = EventLoop::new(Box::new(PollPoller::new()), -1);
        lp.start();
        WorkerContext::new(server, 0, lp)
    }

    fn counting(config: ServerConfig) -> (ServerBuilder, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let builder = Server::builder(config).on_receive(move |_, w, _| {
            assert_eq!(w.status(), WorkerStatus::Busy);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (builder, calls)
    }

    fn config() -> ServerConfig {
        ServerConfig::new().topology(Topology::Process).worker_num(1)
    }

    fn recv_data(session_id: i64, payload: &[u8]) -> EventRecord {
        let mut rec = EventRecord::new(EventType::RecvData, session_id);
        rec.len = payload.len() as u32;
        rec
    }

    #[test]
    fn test_unknown_type_completes_status_cycle() {
        let mut ctx = ctx_with(Server::builder(config()));
        let rec = EventRecord {
            event_type: 200,
            ..EventRecord::new(EventType::RecvData, 1)
        };
        assert_eq!(accept_event(&mut ctx, &rec, &[]), Outcome::Discarded);
        assert_eq!(ctx.worker().status(), WorkerStatus::Idle);
        assert!(ctx.event_loop.is_running());
    }

    #[test]
    fn test_recv_data_live_and_closed_sessions() {
        let (builder, calls) = counting(config());
        let mut ctx = ctx_with(builder);
        let live = ctx.server.sessions().insert(Session::new(1, 901, 0));
        live.add_queued_bytes(5);
        ctx.server.sessions().insert(Session::new(2, 902, 0)).close();

        let rec = recv_data(1, b"hello");
        assert_eq!(accept_event(&mut ctx, &rec, b"hello"), Outcome::Callback);
        assert_eq!(live.recv_queued_bytes(), 0);
        assert!(live.last_dispatch_time() > 0);

        let rec = recv_data(2, b"late");
        assert_eq!(accept_event(&mut ctx, &rec, b"late"), Outcome::Discarded);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.worker().request_count(), 1);
        assert_eq!(ctx.server.request_count(), 1);
    }

    #[test]
    fn test_orphan_data_follows_discard_policy() {
        let (builder, calls) = counting(config());
        let mut ctx = ctx_with(builder);
        assert_eq!(accept_event(&mut ctx, &recv_data(7, b"x"), b"x"), Outcome::Discarded);

        let lenient = config().disable_notify(true).discard_timeout_request(false);
        let (builder, lenient_calls) = counting(lenient);
        let mut ctx2 = ctx_with(builder);
        assert_eq!(accept_event(&mut ctx2, &recv_data(7, b"x"), b"x"), Outcome::Callback);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(lenient_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_error_skips_counters() {
        let mut ctx = ctx_with(Server::builder(config()).on_receive(|_, _, _| Err("bad request".into())));
        ctx.server.sessions().insert(Session::new(1, 903, 0));
        accept_event(&mut ctx, &recv_data(1, b"q"), b"q");
        assert_eq!(ctx.worker().request_count(), 0);
        assert_eq!(ctx.worker().status(), WorkerStatus::Idle);
    }

    #[test]
    fn test_request_ceiling() {
        let (builder, calls) = counting(config().max_request(100));
        let mut ctx = ctx_with(builder);
        ctx.server.sessions().insert(Session::new(1, 904, 0));

        for i in 0..100 {
            assert!(!ctx.worker().is_shutting_down(), "shut down early at {}", i);
            accept_event(&mut ctx, &recv_data(1, b"r"), b"r");
        }
        assert_eq!(ctx.worker().request_count(), 100);
        assert_eq!(ctx.worker().status(), WorkerStatus::ShuttingDown);

        assert_eq!(accept_event(&mut ctx, &recv_data(1, b"r"), b"r"), Outcome::Discarded);
        assert_eq!(calls.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_record_never_reaches_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut ctx = ctx_with(Server::builder(config()).on_pipe_message(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(accept_event(&mut ctx, &EventRecord::shutdown(), &[]), Outcome::Internal);
        assert!(ctx.worker().is_shutting_down());
        assert!(!ctx.event_loop.is_running());

        let msg = EventRecord::new(EventType::PipeMessage, 0);
        assert_eq!(accept_event(&mut ctx, &msg, b"hi"), Outcome::Discarded);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_marks_session() {
        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        let mut ctx = ctx_with(Server::builder(config()).on_close(move |_, _, info| {
            assert_eq!(info.session_id, 3);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let session = ctx.server.sessions().insert(Session::new(3, 905, 0));

        let rec = EventRecord::new(EventType::Close, 3);
        assert_eq!(accept_event(&mut ctx, &rec, &[]), Outcome::Callback);
        assert!(session.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_command_request_and_unknown_command() {
        let builder = Server::builder(config()).command(7, |_, args| {
            let mut out = args.to_vec();
            out.reverse();
            Ok(out)
        });
        let mut ctx = ctx_with(builder);
        let server = ctx.server.clone();
        let master = server.pool().slot(0).pipe_master().unwrap();
        let mut buf = [0u8; 256];

        let mut payload = 7u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"abc");
        let req = EventRecord::new(EventType::CommandRequest, 42);
        assert_eq!(accept_event(&mut ctx, &req, &payload), Outcome::Internal);

        let n = master.recv(&mut buf).unwrap();
        let resp = EventRecord::from_bytes(&buf[..n]).unwrap();
        assert_eq!(resp.kind(), Ok(EventType::CommandResponse));
        assert_eq!(resp.session_id, 42);
        assert!(!resp.has_flag(flags::ERROR));
        assert_eq!(&buf[24..n], b"cba");

        let req = EventRecord::new(EventType::CommandRequest, 43);
        accept_event(&mut ctx, &req, &9u32.to_le_bytes());
        let n = master.recv(&mut buf).unwrap();
        let resp = EventRecord::from_bytes(&buf[..n]).unwrap();
        assert_eq!(resp.session_id, 43);
        assert!(resp.has_flag(flags::ERROR));
        assert!(ctx.event_loop.is_running());
        assert_eq!(ctx.worker().status(), WorkerStatus::Idle);
    }

    #[test]
    fn test_pipe_receive_dispatches_empty_payload_records() {
        let closes = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(AtomicUsize::new(0));
        let (seen_close, seen_msg) = (closes.clone(), messages.clone());
        let mut ctx = ctx_with(
            Server::builder(config())
                .on_close(move |_, _, _| {
                    seen_close.fetch_add(1, Ordering::SeqCst);
                })
                .on_pipe_message(move |_, _, ev| {
                    assert_eq!(ev.data, b"hi");
                    seen_msg.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );
        let server = ctx.server.clone();
        let session = server.sessions().insert(Session::new(4, 906, 0));
        let master = server.pool().slot(0).pipe_master().unwrap();
        master
            .send_message(&EventRecord::new(EventType::Close, 4), &[], 8192)
            .unwrap();
        master
            .send_message(&EventRecord::new(EventType::PipeMessage, 0), b"hi", 8192)
            .unwrap();
        server.kill_worker(Some(0)).unwrap();

        for _ in 0..5 {
            on_pipe_receive(&mut ctx);
        }
        assert!(session.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(messages.load(Ordering::SeqCst), 1);
        assert!(ctx.worker().is_shutting_down());
        assert!(ctx.bus_is_empty());
        // kill_worker is not a whole-server stop
        assert!(server.is_running());
    }

    #[test]
    fn test_server_stop_record_clears_local_running_flag() {
        let mut ctx = ctx_with(Server::builder(config()));
        let rec = EventRecord::server_shutdown();
        assert_eq!(accept_event(&mut ctx, &rec, &[]), Outcome::Internal);
        assert!(!ctx.server.is_running());
        assert!(ctx.worker().is_shutting_down());
    }

    #[test]
    fn test_pipe_message_without_callback_is_discarded() {
        let mut ctx = ctx_with(Server::builder(config()));
        let msg = EventRecord::new(EventType::PipeMessage, 0);
        assert_eq!(accept_event(&mut ctx, &msg, b"x"), Outcome::Discarded);
        assert_eq!(ctx.worker().status(), WorkerStatus::Idle);
    }

    #[test]
    fn test_pipe_receive_dispatches_chunked_packet() {
        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        let config = config().ipc_max_size(64);
        let mut ctx = ctx_with(Server::builder(config).on_pipe_message(move |_, _, ev| {
            seen.store(ev.data.len(), Ordering::SeqCst);
            Ok(())
        }));
        let payload = vec![b'z'; 100];
        let server = ctx.server.clone();
        let master = server.pool().slot(0).pipe_master().unwrap();
        master
            .send_message(&EventRecord::new(EventType::PipeMessage, 0), &payload, 64)
            .unwrap();

        // 100 bytes in 40-byte chunks: three datagrams
        for _ in 0..3 {
            on_pipe_receive(&mut ctx);
        }
        assert_eq!(received.load(Ordering::SeqCst), 100);
        assert!(ctx.bus_is_empty());

        // Nothing left to read
        on_pipe_receive(&mut ctx);
        assert!(ctx.bus.is_some());
    }
}
