use std::io;
use thiserror::Error;

/// Engine error codes.
///
/// Every recoverable failure in the crate surfaces as one of these
/// values. The numeric mapping in [`NetError::code`] preserves the
/// engine's return-code conventions so embedders keying on integers
/// (or peers built against the same conventions) see stable values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    // Framing / event queue
    #[error("Not enough data buffered")]
    NotEnoughData,
    #[error("Destination buffer too small ({need} bytes needed)")]
    BufferTooSmall { need: usize },
    #[error("Header decodes to an impossible length")]
    BadHeader,
    #[error("Message size exceeds the configured ceiling")]
    OverLimit,

    // Handle table
    #[error("Handle not found")]
    NotFound,
    #[error("Handle table full")]
    TableFull,
    #[error("Operation invalid in the connection's current state")]
    BadState,
    #[error("Send buffer limit reached")]
    BufferFull,

    // Sockets
    #[error("Connection to {addr} failed: {kind:?}")]
    ConnectFailedTo { addr: std::net::SocketAddr, kind: io::ErrorKind },
    #[error("Socket error: {0:?}")]
    Socket(io::ErrorKind),
    #[error("Address invalid")]
    AddressInvalid,

    // Proxy negotiation
    #[error("Proxy rejected the tunnel request")]
    ProxyRejected,
    #[error("Proxy authentication failed")]
    ProxyAuthFailed,
    #[error("Malformed proxy reply")]
    ProxyMalformedReply,
    #[error("Proxy closed the connection during negotiation")]
    ProxyClosed,

    // Options surface
    #[error("Option not supported for this connection kind")]
    UnsupportedOption,
}

impl NetError {
    /// Numeric return code.
    ///
    /// `-1`..`-4` match the framing/recv and event-queue read
    /// conventions; the remaining codes are stable but carry no wire
    /// significance.
    pub fn code(&self) -> i32 {
        match self {
            NetError::NotEnoughData => -1,
            NetError::BufferTooSmall { .. } => -2,
            NetError::BadHeader => -3,
            NetError::OverLimit => -4,
            NetError::NotFound => -10,
            NetError::TableFull => -11,
            NetError::BadState => -12,
            NetError::BufferFull => -13,
            NetError::ConnectFailedTo { .. } => -20,
            NetError::Socket(_) => -21,
            NetError::AddressInvalid => -22,
            NetError::UnsupportedOption => -30,
            NetError::ProxyRejected => -71,
            NetError::ProxyAuthFailed => -72,
            NetError::ProxyMalformedReply => -73,
            NetError::ProxyClosed => -74,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::Socket(err.kind())
    }
}
