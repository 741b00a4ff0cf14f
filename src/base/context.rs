//! Ergonomic error context helpers.
//!
//! Extension trait for converting IO errors into context-rich
//! [`NetError`] variants on the connect path.

use crate::base::neterror::NetError;
use std::io;
use std::net::SocketAddr;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Attach the peer address to a failed connect.
    ///
    /// # Example
    /// ```ignore
    /// use muxnet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).connect_context(addr)?;
    /// // Error: "Connection to 10.0.0.1:443 failed: ConnectionRefused"
    /// ```
    fn connect_context(self, addr: SocketAddr) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connect_context(self, addr: SocketAddr) -> Result<T, NetError> {
        self.map_err(|e| NetError::ConnectFailedTo { addr, kind: e.kind() })
    }
}
