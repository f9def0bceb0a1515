//! Packet reassembly on top of a worker pipe
//!
//! The bus reads one datagram per call. Unchunked datagrams complete a packet
//! immediately; chunked ones accumulate until `CHUNK_END`. A complete packet
//! stays available through [`MessageBus::get_buffer`] and
//! [`MessageBus::get_packet`] until [`MessageBus::pop`] releases it.

use std::io;

use shoal_core::constants::EVENT_HEAD_SIZE;
use shoal_core::{flags, EventRecord, ShoalError, ShoalResult};

use crate::pipe::PipeEnd;

/// Payload view handed to callbacks
#[derive(Debug, Clone, Copy)]
pub struct EventData<'a> {
    pub info: &'a EventRecord,
    pub data: &'a [u8],
}

pub struct MessageBus {
    recv_buf: Vec<u8>,
    /// Header of the packet being assembled or ready
    head: Option<EventRecord>,
    payload: Vec<u8>,
    /// `head` and `payload` form a complete packet
    ready: bool,
}

impl MessageBus {
    pub fn new(ipc_max_size: usize) -> Self {
        Self {
            recv_buf: vec![0u8; ipc_max_size.max(EVENT_HEAD_SIZE + 1)],
            head: None,
            payload: Vec::new(),
            ready: false,
        }
    }

    /// Read one datagram from `pipe`
    ///
    /// Returns `Some(payload_len)` once a packet is complete, including
    /// packets with an empty payload, and `None` when the pipe had nothing
    /// to read or a chunked packet is still incomplete. A call while a
    /// packet is ready and not yet popped reports it again without reading.
    pub fn read(&mut self, pipe: &PipeEnd) -> ShoalResult<Option<usize>> {
        if self.ready {
            return Ok(Some(self.payload.len()));
        }

        let n = match pipe.recv(&mut self.recv_buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let head = EventRecord::from_bytes(&self.recv_buf[..n])
            .ok_or_else(|| ShoalError::Protocol(format!("short datagram of {} bytes", n)))?;
        let body = &self.recv_buf[EVENT_HEAD_SIZE..n];
        if body.len() != head.len as usize {
            return Err(ShoalError::Protocol(format!(
                "header says {} bytes, datagram carries {}",
                head.len,
                body.len()
            )));
        }

        let chunk = head.flags & flags::CHUNK_MASK;
        if chunk == 0 {
            self.payload.clear();
            self.payload.extend_from_slice(body);
            self.head = Some(head);
            return Ok(Some(self.complete()));
        }

        if chunk & flags::CHUNK_BEGIN != 0 {
            if self.head.is_some() {
                tracing::warn!(
                    code = %shoal_core::error::ERR_PROTOCOL,
                    session_id = head.session_id,
                    dropped = self.payload.len(),
                    "chunked message restarted before completion"
                );
            }
            self.payload.clear();
            self.head = Some(head);
        } else if self.head.is_none() {
            return Err(ShoalError::Protocol("chunk without a beginning".into()));
        }

        self.payload.extend_from_slice(body);
        if chunk & flags::CHUNK_END != 0 {
            return Ok(Some(self.complete()));
        }
        Ok(None)
    }

    fn complete(&mut self) -> usize {
        if let Some(head) = self.head.as_mut() {
            head.flags &= !flags::CHUNK_MASK;
            head.len = self.payload.len() as u32;
        }
        self.ready = true;
        self.payload.len()
    }

    /// Header of the ready packet
    pub fn get_buffer(&self) -> Option<&EventRecord> {
        if self.ready {
            self.head.as_ref()
        } else {
            None
        }
    }

    /// Header and payload of the ready packet
    pub fn get_packet(&self) -> Option<EventData<'_>> {
        match (&self.head, self.ready) {
            (Some(info), true) => Some(EventData {
                info,
                data: &self.payload,
            }),
            _ => None,
        }
    }

    /// Release the ready packet
    pub fn pop(&mut self) {
        if self.ready {
            self.ready = false;
            self.head = None;
            self.payload.clear();
        }
    }

    /// Drop everything, including a partially assembled packet
    pub fn clear(&mut self) {
        self.ready = false;
        self.head = None;
        self.payload.clear();
    }

    /// No ready packet and no partial packet
    pub fn empty(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::WorkerPipe;
    use shoal_core::EventType;

    #[test]
    fn test_single_datagram_packet() {
        let pipe = WorkerPipe::new().unwrap();
        let mut bus = MessageBus::new(8192);
        assert_eq!(bus.read(&pipe.worker).unwrap(), None);
        assert!(bus.empty());

        let rec = EventRecord::new(EventType::RecvData, 11);
        pipe.master.send_message(&rec, b"abc", 8192).unwrap();
        assert_eq!(bus.read(&pipe.worker).unwrap(), Some(3));

        let packet = bus.get_packet().unwrap();
        assert_eq!(packet.data, b"abc");
        assert_eq!(packet.info.session_id, 11);
        assert!(!bus.empty());

        bus.pop();
        assert!(bus.empty());
        assert!(bus.get_buffer().is_none());
    }

    #[test]
    fn test_empty_payload_completes_packet() {
        let pipe = WorkerPipe::new().unwrap();
        let mut bus = MessageBus::new(8192);
        pipe.master.send_message(&EventRecord::shutdown(), &[], 8192).unwrap();
        pipe.master
            .send_message(&EventRecord::new(EventType::RecvData, 2), b"next", 8192)
            .unwrap();

        assert_eq!(bus.read(&pipe.worker).unwrap(), Some(0));
        let packet = bus.get_packet().unwrap();
        assert_eq!(packet.info.kind(), Ok(EventType::Shutdown));
        assert!(packet.data.is_empty());
        // Still ready until popped
        assert_eq!(bus.read(&pipe.worker).unwrap(), Some(0));

        bus.pop();
        assert_eq!(bus.read(&pipe.worker).unwrap(), Some(4));
        assert_eq!(bus.get_packet().unwrap().data, b"next");
    }

    #[test]
    fn test_chunk_assembly() {
        let pipe = WorkerPipe::new().unwrap();
        let max = EVENT_HEAD_SIZE + 4;
        let mut bus = MessageBus::new(max);
        let payload: Vec<u8> = (0u8..10).collect();
        let rec = EventRecord::new(EventType::PipeMessage, 3);
        pipe.master.send_message(&rec, &payload, max).unwrap();

        assert_eq!(bus.read(&pipe.worker).unwrap(), None);
        assert_eq!(bus.read(&pipe.worker).unwrap(), None);
        assert!(!bus.empty());
        assert_eq!(bus.read(&pipe.worker).unwrap(), Some(10));

        let packet = bus.get_packet().unwrap();
        assert_eq!(packet.data, &payload[..]);
        assert_eq!(packet.info.flags & flags::CHUNK_MASK, 0);
        assert_eq!(packet.info.len, 10);
    }

    #[test]
    fn test_partial_packet_counts_as_unprocessed() {
        let pipe = WorkerPipe::new().unwrap();
        let mut bus = MessageBus::new(8192);
        let head = EventRecord::new(EventType::PipeMessage, 1).with_flags(flags::CHUNK_BEGIN);
        pipe.master.send_message(&head, b"part", 8192).unwrap();

        assert_eq!(bus.read(&pipe.worker).unwrap(), None);
        assert!(!bus.empty());
        bus.clear();
        assert!(bus.empty());
    }

    #[test]
    fn test_malformed_datagrams() {
        let pipe = WorkerPipe::new().unwrap();
        let mut bus = MessageBus::new(8192);

        pipe.master.send(&[1, 2, 3]).unwrap();
        let err = bus.read(&pipe.worker).unwrap_err();
        assert_eq!(err.code(), shoal_core::error::ERR_PROTOCOL);

        let orphan = EventRecord::new(EventType::PipeMessage, 1).with_flags(flags::CHUNK_END);
        pipe.master.send_message(&orphan, b"x", 8192).unwrap();
        assert!(bus.read(&pipe.worker).is_err());
        assert!(bus.empty());
    }
}
