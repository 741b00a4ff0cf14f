//! Per-connection state.
//!
//! [`Channel`] is the transport-free half of a connection: the framing
//! mode, the working send/receive byte buffers with their ceilings,
//! and the per-direction cipher state. It frames outbound messages
//! into `outgoing` bytes and de-frames `feed`-ed inbound bytes back
//! into messages, so the whole framing path is drivable without a
//! socket. The engine composes a `Channel` with a registered socket
//! and life-cycle bookkeeping into its connection records.

use crate::base::neterror::NetError;
use crate::codec::cipher::Rc4;
use crate::codec::header::HeaderMode;
use crate::core::filter::Filter;
use bytes::{Buf, BytesMut};
use mio::net::{TcpStream, UdpSocket};
use std::io::{Read, Write};
use std::net::SocketAddr;

/// Connection life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SockState {
    Closed = 0,
    Connecting = 1,
    Established = 2,
}

/// How a node came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// Accepted from a listener.
    In,
    /// Outbound connect.
    Out,
    /// Listening socket.
    Listen,
    /// Adopted descriptor.
    Assign,
    /// Raw datagram socket.
    Dgram,
}

/// Framing channel: buffers, header mode, ceilings, cipher state.
pub struct Channel {
    mode: HeaderMode,
    sendbuf: BytesMut,
    recvbuf: BytesMut,
    /// Total buffered-bytes ceiling per direction (0 = unlimited).
    limited: usize,
    /// Per-message payload ceiling (0 = unlimited).
    maxsize: usize,
    cipher_send: Option<Rc4>,
    cipher_recv: Option<Rc4>,
}

impl Channel {
    /// Create a channel framing with `mode`, no ceilings, no cipher.
    pub fn new(mode: HeaderMode) -> Channel {
        Channel {
            mode,
            sendbuf: BytesMut::new(),
            recvbuf: BytesMut::new(),
            limited: 0,
            maxsize: 0,
            cipher_send: None,
            cipher_recv: None,
        }
    }

    /// Framing mode in effect.
    pub fn header_mode(&self) -> HeaderMode {
        self.mode
    }

    /// Set the buffered-bytes and per-message ceilings (0 disables).
    pub fn set_limit(&mut self, limited: usize, maxsize: usize) {
        self.limited = limited;
        self.maxsize = maxsize;
    }

    /// Key the outbound cipher direction.
    pub fn set_send_key(&mut self, key: &[u8]) {
        self.cipher_send = Some(Rc4::new(key));
    }

    /// Key the inbound cipher direction.
    pub fn set_recv_key(&mut self, key: &[u8]) {
        self.cipher_recv = Some(Rc4::new(key));
    }

    /// Bytes framed but not yet taken by the transport.
    pub fn remain(&self) -> usize {
        self.sendbuf.len()
    }

    /// Bytes received but not yet de-framed.
    pub fn pending(&self) -> usize {
        self.recvbuf.len()
    }

    /// Frame one message into the outgoing buffer.
    ///
    /// The `mask` byte is carried in the header's top bits for
    /// [`HeaderMode::DwordMask`] and ignored elsewhere. Fails with
    /// `OverLimit` when the message exceeds `maxsize`, `BufferFull`
    /// when the framed bytes would exceed `limited`, and `BadHeader`
    /// when the length cannot be represented in the mode's width.
    pub fn send(&mut self, data: &[u8], mask: u8) -> Result<(), NetError> {
        self.send_vector(&[data], mask)
    }

    /// Frame the concatenation of `parts` as one message.
    pub fn send_vector(&mut self, parts: &[&[u8]], mask: u8) -> Result<(), NetError> {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        if self.maxsize > 0 && payload_len > self.maxsize {
            return Err(NetError::OverLimit);
        }
        let wire_len = self.mode.header_len()
            + payload_len
            + if self.mode == HeaderMode::LineSplit { 1 } else { 0 };
        if self.limited > 0 && self.sendbuf.len() + wire_len > self.limited {
            return Err(NetError::BufferFull);
        }
        self.mode.encode_into(payload_len, mask, &mut self.sendbuf)?;
        let start = self.sendbuf.len();
        for part in parts {
            self.sendbuf.extend_from_slice(part);
        }
        if let Some(cipher) = self.cipher_send.as_mut() {
            cipher.apply(&mut self.sendbuf[start..]);
        }
        self.mode.encode_trailer(&mut self.sendbuf);
        Ok(())
    }

    /// Inject inbound transport bytes.
    ///
    /// Fails with `BufferFull` once `limited` is exceeded; the bytes
    /// are still buffered so a caller tearing the connection down can
    /// account for them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        self.recvbuf.extend_from_slice(bytes);
        if self.limited > 0 && self.recvbuf.len() > self.limited {
            return Err(NetError::BufferFull);
        }
        Ok(())
    }

    /// De-frame one message from the receive buffer.
    ///
    /// `out = None` is the size query: reports the decoded payload
    /// length without consuming or deciphering anything. Distinct
    /// failures: `NotEnoughData` (-1) while the frame is incomplete,
    /// `BufferTooSmall` (-2) when `out` cannot hold the payload,
    /// `BadHeader` (-3) for an impossible length, `OverLimit` (-4)
    /// when the decoded length exceeds `maxsize`.
    pub fn recv(&mut self, out: Option<&mut [u8]>) -> Result<usize, NetError> {
        let info = self.mode.peek(&self.recvbuf, self.maxsize)?;
        let Some(out) = out else { return Ok(info.payload_len) };
        if out.len() < info.payload_len {
            return Err(NetError::BufferTooSmall { need: info.payload_len });
        }
        let payload = &mut self.recvbuf[info.header_len..info.header_len + info.payload_len];
        if let Some(cipher) = self.cipher_recv.as_mut() {
            cipher.apply(payload);
        }
        out[..info.payload_len].copy_from_slice(payload);
        self.recvbuf.advance(info.wire_len());
        Ok(info.payload_len)
    }

    /// De-frame one message into an owned buffer, with its mask byte.
    ///
    /// `Ok(None)` means no complete frame is buffered yet; framing
    /// violations surface as errors.
    pub fn next_message(&mut self) -> Result<Option<(Vec<u8>, u8)>, NetError> {
        let info = match self.mode.peek(&self.recvbuf, self.maxsize) {
            Ok(info) => info,
            Err(NetError::NotEnoughData) => return Ok(None),
            Err(err) => return Err(err),
        };
        let payload = &mut self.recvbuf[info.header_len..info.header_len + info.payload_len];
        if let Some(cipher) = self.cipher_recv.as_mut() {
            cipher.apply(payload);
        }
        let message = payload.to_vec();
        self.recvbuf.advance(info.wire_len());
        Ok(Some((message, info.mask)))
    }

    /// Take all framed outgoing bytes (the transport feed point).
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        let out = self.sendbuf.to_vec();
        self.sendbuf.clear();
        out
    }

    pub(crate) fn outgoing(&self) -> &[u8] {
        &self.sendbuf
    }

    pub(crate) fn consume_outgoing(&mut self, n: usize) {
        self.sendbuf.advance(n);
    }

    pub(crate) fn over_recv_limit(&self) -> bool {
        self.limited > 0 && self.recvbuf.len() > self.limited
    }

    /// Buffered-bytes ceiling (0 = unlimited).
    pub fn limited(&self) -> usize {
        self.limited
    }

    /// Per-message payload ceiling (0 = unlimited).
    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    /// Adjust only the buffered-bytes ceiling.
    pub fn set_limited(&mut self, limited: usize) {
        self.limited = limited;
    }

    /// Adjust only the per-message ceiling.
    pub fn set_maxsize(&mut self, maxsize: usize) {
        self.maxsize = maxsize;
    }
}

/// Engine-side connection record: a [`Channel`] plus its registered
/// stream and life-cycle bookkeeping.
pub(crate) struct Conn {
    pub channel: Channel,
    pub stream: TcpStream,
    pub kind: SockKind,
    pub state: SockState,
    pub tag: i64,
    pub ipv6: bool,
    /// Poll-interest mask bits ([`MASK_READ`] | [`MASK_WRITE`]).
    pub mask: u8,
    /// Read-side polling disabled.
    pub disabled: bool,
    /// Pending close: no new sends, flush then tear down.
    pub closing: bool,
    pub exitcode: u32,
    /// Emit `Progress` events as the send buffer drains.
    pub progress: bool,
    pub protocol: u32,
    pub filter: Option<Box<dyn Filter>>,
    pub peer: Option<SocketAddr>,
    /// Interest the stream is currently registered with.
    pub registered: Option<mio::Interest>,
    pub connect_timer: Option<crate::timer::wheel::TimerId>,
    pub linger_timer: Option<crate::timer::wheel::TimerId>,
}

pub(crate) const MASK_READ: u8 = 1;
pub(crate) const MASK_WRITE: u8 = 2;

impl Conn {
    pub fn new(stream: TcpStream, kind: SockKind, state: SockState, mode: HeaderMode) -> Conn {
        let ipv6 = matches!(stream.peer_addr(), Ok(SocketAddr::V6(_)))
            || matches!(stream.local_addr(), Ok(SocketAddr::V6(_)));
        Conn {
            channel: Channel::new(mode),
            stream,
            kind,
            state,
            tag: -1,
            ipv6,
            mask: MASK_READ | MASK_WRITE,
            disabled: false,
            closing: false,
            exitcode: 0,
            progress: false,
            protocol: 0,
            filter: None,
            peer: None,
            registered: None,
            connect_timer: None,
            linger_timer: None,
        }
    }

    /// Read everything currently available into the receive buffer.
    ///
    /// Returns `(bytes_read, eof)`; IO errors other than WouldBlock
    /// propagate.
    pub fn ingest(&mut self, scratch: &mut [u8]) -> Result<(usize, bool), NetError> {
        let mut total = 0;
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    total += n;
                    // Ceiling violations are detected by the caller via
                    // over_recv_limit so the close carries a code.
                    let _ = self.channel.feed(&scratch[..n]);
                    if self.channel.over_recv_limit() {
                        return Ok((total, false));
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok((total, false));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Flush framed bytes to the stream. Returns bytes written; stops
    /// at WouldBlock, resumes from the saved position next time.
    pub fn flush(&mut self) -> Result<usize, NetError> {
        let mut written = 0;
        while !self.channel.outgoing().is_empty() {
            match self.stream.write(self.channel.outgoing()) {
                Ok(0) => break,
                Ok(n) => {
                    self.channel.consume_outgoing(n);
                    written += n;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    /// Whether the connection still wants write readiness.
    pub fn wants_write(&self) -> bool {
        self.state == SockState::Connecting
            || (!self.channel.outgoing().is_empty() && self.mask & MASK_WRITE != 0)
    }

    /// Whether the connection wants read readiness.
    pub fn wants_read(&self) -> bool {
        self.state != SockState::Connecting && !self.disabled && self.mask & MASK_READ != 0
    }
}

/// Engine-side datagram record. The engine reports readiness; the
/// application does its own `recv_from`/`send_to` on the socket.
pub(crate) struct DgramNode {
    pub sock: UdpSocket,
    pub tag: i64,
    pub ipv6: bool,
    /// Direction subscription: bit 1 read, bit 2 write.
    pub mask: u8,
}

/// Engine-side listener record.
pub(crate) struct ListenerNode {
    pub sock: mio::net::TcpListener,
    pub mode: HeaderMode,
    pub tag: i64,
    pub ipv6: bool,
}
