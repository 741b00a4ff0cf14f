//! Engine events.
//!
//! Everything the engine has to tell the application — connection
//! life-cycle, inbound messages, cross-thread posts — travels through
//! one FIFO queue drained by [`Engine::read_event`] or
//! [`Engine::poll_event`].
//!
//! [`Engine::read_event`]: crate::core::engine::Engine::read_event
//! [`Engine::poll_event`]: crate::core::engine::Engine::poll_event

use crate::base::neterror::NetError;
use std::collections::VecDeque;

/// Event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    /// A node was created (connect, listen, assign, dgram, accept).
    /// Accepted sockets carry the peer address as payload and the
    /// listener handle in `lparam`.
    New = 0,
    /// A node was torn down. Payload is the 4-byte LE exit code.
    Close = 1,
    /// An outbound connect completed.
    Estab = 2,
    /// One complete inbound message. Payload is the de-framed (and
    /// deciphered, post-filter) message bytes.
    Data = 3,
    /// Send-buffer progress on a connection that opted in.
    Progress = 4,
    /// Readiness on a datagram node.
    Dgram = 5,
    /// Application message injected via `post`.
    Post = 6,
    /// User-defined event injected via `push`.
    Extend = 7,
}

impl EventKind {
    /// Numeric discriminator.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a numeric discriminator.
    pub fn from_u8(value: u8) -> Option<EventKind> {
        use EventKind::*;
        Some(match value {
            0 => New,
            1 => Close,
            2 => Estab,
            3 => Data,
            4 => Progress,
            5 => Dgram,
            6 => Post,
            7 => Extend,
            _ => return None,
        })
    }
}

/// Exit codes carried by [`EventKind::Close`] payloads.
///
/// Application codes passed to `close()` share this space; the engine
/// keeps its own below 0x100.
pub mod close_code {
    /// Closed locally by the application.
    pub const LOCAL: u32 = 0;
    /// Peer closed the stream cleanly.
    pub const EOF: u32 = 1;
    /// Socket error or peer reset.
    pub const RESET: u32 = 2;
    /// Framing violation (impossible header).
    pub const BADFRAME: u32 = 3;
    /// Buffer ceiling exceeded.
    pub const OVERFLOW: u32 = 4;
    /// Connect deadline expired.
    pub const TIMEOUT: u32 = 5;
    /// Pending-close linger deadline expired before the send buffer
    /// drained.
    pub const LINGER: u32 = 6;
}

/// One queued event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Handle raw value for connection events, user value otherwise.
    pub wparam: i64,
    /// Connection tag for connection events, user value otherwise.
    pub lparam: i64,
    pub data: Vec<u8>,
}

/// Header of an event as reported by the buffered read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub kind: EventKind,
    pub wparam: i64,
    pub lparam: i64,
    /// Payload length (bytes copied, or required, in `data`).
    pub len: usize,
}

/// FIFO event queue with the buffered read conventions.
#[derive(Default)]
pub(crate) struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Pop the next event whole.
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Buffered read: `None` queries the front event's size without
    /// consuming it; a too-small destination leaves the event queued.
    pub fn read(&mut self, out: Option<&mut [u8]>) -> Result<EventInfo, NetError> {
        let front = self.events.front().ok_or(NetError::NotEnoughData)?;
        let info = EventInfo {
            kind: front.kind,
            wparam: front.wparam,
            lparam: front.lparam,
            len: front.data.len(),
        };
        let Some(out) = out else { return Ok(info) };
        if out.len() < info.len {
            return Err(NetError::BufferTooSmall { need: info.len });
        }
        out[..info.len].copy_from_slice(&front.data);
        self.events.pop_front();
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event { kind: EventKind::Data, wparam: 9, lparam: -1, data: b"abc".to_vec() }
    }

    #[test]
    fn query_does_not_consume() {
        let mut q = EventQueue::default();
        q.push(sample());
        let info = q.read(None).unwrap();
        assert_eq!(info.len, 3);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn small_buffer_leaves_event_queued() {
        let mut q = EventQueue::default();
        q.push(sample());
        let mut buf = [0u8; 2];
        assert_eq!(
            q.read(Some(&mut buf)).unwrap_err(),
            NetError::BufferTooSmall { need: 3 }
        );
        assert_eq!(q.len(), 1);

        let mut buf = [0u8; 8];
        let info = q.read(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..info.len], b"abc");
        assert_eq!(q.len(), 0);
        assert_eq!(q.read(None).unwrap_err(), NetError::NotEnoughData);
    }
}
