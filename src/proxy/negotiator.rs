//! Client-side proxy tunnel negotiation.
//!
//! [`ProxyClient`] is a state machine over the wire bytes of the
//! HTTP CONNECT, SOCKS4 and SOCKS5 handshakes. The caller owns the
//! (nonblocking) socket connected to the proxy and calls
//! [`ProxyClient::process`] once per readiness notification; partial
//! reads and writes resume from saved offsets, never restart. On
//! success the socket is a plain tunnel to the target and can be
//! handed to the engine via `new_assign`; on failure the caller closes
//! it.
//!
//! Request and reply layouts follow the public specifications
//! (SOCKS4, RFC 1928/1929, HTTP CONNECT).

use crate::base::neterror::NetError;
use crate::proxy::settings::{ProxyKind, ProxySettings};
use std::io::{Read, Write};
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Scratch buffer size; a handshake exchange never legitimately
/// exceeds this.
const SCRATCH: usize = 1024;

/// Negotiation verdict for one `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Call again on the next readiness notification.
    Pending,
    /// The tunnel is established.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    HttpSendConnect,
    HttpReadStatus,
    Socks4SendRequest,
    Socks4ReadReply,
    Socks5SendGreeting,
    Socks5ReadMethod,
    Socks5SendAuth,
    Socks5ReadAuthReply,
    Socks5SendConnect,
    Socks5ReadReply,
    Done,
}

/// Proxy handshake state machine.
pub struct ProxyClient {
    kind: ProxyKind,
    step: Step,
    /// Request being sent or reply being accumulated.
    buf: [u8; SCRATCH],
    /// Bytes sent/received so far within the current exchange.
    offset: usize,
    /// Bytes to send for the current request frame.
    total: usize,
    /// Whether a credential exchange is configured.
    auth: bool,
    username: Vec<u8>,
    password: Vec<u8>,
    target: SocketAddr,
    proxy_addr: SocketAddr,
}

impl ProxyClient {
    /// Prepare a negotiation toward `target` through the proxy the
    /// socket is connected to. Writes the first request frame into
    /// the scratch buffer; nothing touches the socket until
    /// [`process`](Self::process).
    pub fn new(
        kind: ProxyKind,
        target: SocketAddr,
        proxy_addr: SocketAddr,
        credentials: Option<(&str, &str)>,
    ) -> Result<ProxyClient, NetError> {
        let (username, password) = match credentials {
            Some((u, p)) => (u.as_bytes().to_vec(), p.as_bytes().to_vec()),
            None => (Vec::new(), Vec::new()),
        };
        let mut client = ProxyClient {
            kind,
            step: Step::Done,
            buf: [0u8; SCRATCH],
            offset: 0,
            total: 0,
            auth: credentials.is_some(),
            username,
            password,
            target,
            proxy_addr,
        };
        match kind {
            ProxyKind::None => return Err(NetError::UnsupportedOption),
            ProxyKind::Http => {
                client.stage_http_connect()?;
                client.step = Step::HttpSendConnect;
            }
            ProxyKind::Socks4 => {
                client.stage_socks4_request()?;
                client.step = Step::Socks4SendRequest;
            }
            ProxyKind::Socks5 => {
                client.stage_socks5_greeting();
                client.step = Step::Socks5SendGreeting;
            }
        }
        Ok(client)
    }

    /// Prepare a negotiation from [`ProxySettings`].
    pub fn from_settings(
        settings: &ProxySettings,
        target: SocketAddr,
        proxy_addr: SocketAddr,
    ) -> Result<ProxyClient, NetError> {
        ProxyClient::new(settings.kind(), target, proxy_addr, settings.credentials())
    }

    /// Advance the handshake. Returns [`ProxyStatus::Done`] once the
    /// tunnel is up, [`ProxyStatus::Pending`] when the socket ran dry,
    /// and an error identifying the failure otherwise.
    pub fn process<S: Read + Write>(&mut self, sock: &mut S) -> Result<ProxyStatus, NetError> {
        loop {
            match self.step {
                Step::Done => return Ok(ProxyStatus::Done),

                Step::HttpSendConnect => {
                    if !self.write_pending(sock)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    self.begin_read();
                    self.step = Step::HttpReadStatus;
                }
                Step::HttpReadStatus => {
                    if !self.read_http_header(sock)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    self.finish_http_status()?;
                    debug!(target = %self.target, proxy = %self.proxy_addr, "http tunnel up");
                    self.step = Step::Done;
                }

                Step::Socks4SendRequest => {
                    if !self.write_pending(sock)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    self.begin_read();
                    self.step = Step::Socks4ReadReply;
                }
                Step::Socks4ReadReply => {
                    if !self.read_exact(sock, 8)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    match self.buf[1] {
                        90 => {
                            debug!(target = %self.target, "socks4 tunnel up");
                            self.step = Step::Done;
                        }
                        92 | 93 => return Err(NetError::ProxyAuthFailed),
                        _ => return Err(NetError::ProxyRejected),
                    }
                }

                Step::Socks5SendGreeting => {
                    if !self.write_pending(sock)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    self.begin_read();
                    self.step = Step::Socks5ReadMethod;
                }
                Step::Socks5ReadMethod => {
                    if !self.read_exact(sock, 2)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    if self.buf[0] != 5 {
                        return Err(NetError::ProxyMalformedReply);
                    }
                    match self.buf[1] {
                        0x00 => {
                            // No authentication required: skip the
                            // credential sub-state entirely.
                            trace!("socks5 method: no-auth");
                            self.stage_socks5_connect()?;
                            self.step = Step::Socks5SendConnect;
                        }
                        0x02 => {
                            if !self.auth {
                                return Err(NetError::ProxyAuthFailed);
                            }
                            trace!("socks5 method: username/password");
                            self.stage_socks5_auth()?;
                            self.step = Step::Socks5SendAuth;
                        }
                        _ => return Err(NetError::ProxyAuthFailed),
                    }
                }
                Step::Socks5SendAuth => {
                    if !self.write_pending(sock)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    self.begin_read();
                    self.step = Step::Socks5ReadAuthReply;
                }
                Step::Socks5ReadAuthReply => {
                    if !self.read_exact(sock, 2)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    if self.buf[1] != 0 {
                        return Err(NetError::ProxyAuthFailed);
                    }
                    self.stage_socks5_connect()?;
                    self.step = Step::Socks5SendConnect;
                }
                Step::Socks5SendConnect => {
                    if !self.write_pending(sock)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    self.begin_read();
                    self.step = Step::Socks5ReadReply;
                }
                Step::Socks5ReadReply => {
                    // Fixed 4-byte prefix, then an ATYP-dependent tail.
                    if !self.read_exact(sock, 5)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    let needed = match self.buf[3] {
                        0x01 => 4 + 4 + 2,
                        0x04 => 4 + 16 + 2,
                        0x03 => 4 + 1 + self.buf[4] as usize + 2,
                        _ => return Err(NetError::ProxyMalformedReply),
                    };
                    if !self.read_exact(sock, needed)? {
                        return Ok(ProxyStatus::Pending);
                    }
                    if self.buf[0] != 5 {
                        return Err(NetError::ProxyMalformedReply);
                    }
                    if self.buf[1] != 0 {
                        return Err(NetError::ProxyRejected);
                    }
                    debug!(target = %self.target, proxy = %self.proxy_addr, "socks5 tunnel up");
                    self.step = Step::Done;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Request staging
    // ------------------------------------------------------------------

    fn stage(&mut self, frame: &[u8]) -> Result<(), NetError> {
        if frame.len() > SCRATCH {
            return Err(NetError::BufferFull);
        }
        self.buf[..frame.len()].copy_from_slice(frame);
        self.offset = 0;
        self.total = frame.len();
        Ok(())
    }

    fn stage_http_connect(&mut self) -> Result<(), NetError> {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
            target = self.target
        );
        if self.auth {
            use base64::{engine::general_purpose, Engine as _};
            let creds = [self.username.as_slice(), b":", self.password.as_slice()].concat();
            request.push_str("Proxy-Authorization: Basic ");
            request.push_str(&general_purpose::STANDARD.encode(creds));
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        self.stage(request.as_bytes())
    }

    fn stage_socks4_request(&mut self) -> Result<(), NetError> {
        let SocketAddr::V4(target) = self.target else {
            // SOCKS4 has no IPv6 address form.
            return Err(NetError::AddressInvalid);
        };
        let mut frame = Vec::with_capacity(9 + self.username.len());
        frame.push(4);
        frame.push(1);
        frame.extend_from_slice(&target.port().to_be_bytes());
        frame.extend_from_slice(&target.ip().octets());
        frame.extend_from_slice(&self.username);
        frame.push(0);
        self.stage(&frame)
    }

    fn stage_socks5_greeting(&mut self) {
        let frame: &[u8] =
            if self.auth { &[5, 2, 0x00, 0x02] } else { &[5, 1, 0x00] };
        // Infallible: far below scratch size.
        let _ = self.stage(frame);
    }

    fn stage_socks5_auth(&mut self) -> Result<(), NetError> {
        if self.username.len() > 255 || self.password.len() > 255 {
            return Err(NetError::ProxyAuthFailed);
        }
        let mut frame = Vec::with_capacity(3 + self.username.len() + self.password.len());
        frame.push(1);
        frame.push(self.username.len() as u8);
        frame.extend_from_slice(&self.username);
        frame.push(self.password.len() as u8);
        frame.extend_from_slice(&self.password);
        self.stage(&frame)
    }

    fn stage_socks5_connect(&mut self) -> Result<(), NetError> {
        let mut frame = Vec::with_capacity(22);
        frame.extend_from_slice(&[5, 1, 0]);
        match self.target {
            SocketAddr::V4(v4) => {
                frame.push(0x01);
                frame.extend_from_slice(&v4.ip().octets());
                frame.extend_from_slice(&v4.port().to_be_bytes());
            }
            SocketAddr::V6(v6) => {
                frame.push(0x04);
                frame.extend_from_slice(&v6.ip().octets());
                frame.extend_from_slice(&v6.port().to_be_bytes());
            }
        }
        self.stage(&frame)
    }

    // ------------------------------------------------------------------
    // Socket plumbing
    // ------------------------------------------------------------------

    /// Push `buf[offset..total]` out; true once the frame is fully
    /// written.
    fn write_pending<S: Write>(&mut self, sock: &mut S) -> Result<bool, NetError> {
        while self.offset < self.total {
            match sock.write(&self.buf[self.offset..self.total]) {
                Ok(0) => return Err(NetError::ProxyClosed),
                Ok(n) => self.offset += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn begin_read(&mut self) {
        self.offset = 0;
        self.total = 0;
    }

    /// Accumulate reply bytes until `needed` are buffered.
    fn read_exact<S: Read>(&mut self, sock: &mut S, needed: usize) -> Result<bool, NetError> {
        while self.offset < needed {
            match sock.read(&mut self.buf[self.offset..needed]) {
                Ok(0) => return Err(NetError::ProxyClosed),
                Ok(n) => self.offset += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Accumulate until the HTTP response header terminator arrives.
    fn read_http_header<S: Read>(&mut self, sock: &mut S) -> Result<bool, NetError> {
        loop {
            if self.buf[..self.offset].windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok(true);
            }
            if self.offset >= SCRATCH {
                return Err(NetError::ProxyMalformedReply);
            }
            match sock.read(&mut self.buf[self.offset..]) {
                Ok(0) => return Err(NetError::ProxyClosed),
                Ok(n) => self.offset += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish_http_status(&mut self) -> Result<(), NetError> {
        let header = &self.buf[..self.offset];
        let line_end = header
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(NetError::ProxyMalformedReply)?;
        let line = std::str::from_utf8(&header[..line_end])
            .map_err(|_| NetError::ProxyMalformedReply)?;
        let mut parts = line.split_whitespace();
        let version = parts.next().ok_or(NetError::ProxyMalformedReply)?;
        if !version.starts_with("HTTP/") {
            return Err(NetError::ProxyMalformedReply);
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(NetError::ProxyMalformedReply)?;
        match status {
            200..=299 => Ok(()),
            407 => Err(NetError::ProxyAuthFailed),
            _ => Err(NetError::ProxyRejected),
        }
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("kind", &self.kind)
            .field("step", &self.step)
            .field("target", &self.target)
            .field("proxy", &self.proxy_addr)
            .finish_non_exhaustive()
    }
}
