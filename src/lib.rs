//! # muxnet
//!
//! An embeddable event-driven networking engine: a socket
//! multiplexing core that manages many concurrent connections through
//! opaque stable handles, frames raw byte streams into discrete
//! messages, optionally obfuscates them, and delivers life-cycle and
//! data events through a single drainable queue — paired with a
//! hierarchical timer wheel the engine uses for connect timeouts,
//! pending-close linger deadlines, and application-level timers.
//!
//! ## Features
//!
//! - **Stable handles**: generation-tagged ids that never alias a
//!   recycled connection slot
//! - **15 framing modes**: 1/2/4-byte length prefixes in either byte
//!   order, exclude-self variants, a masked header, raw and
//!   newline-delimited streams
//! - **Timer wheel**: 5-level cascaded scheduling, O(1) insert and
//!   cancel, batched expiry per tick
//! - **Proxy tunneling**: client-side HTTP CONNECT, SOCKS4 and SOCKS5
//!   handshakes with partial-write resume
//! - **Stream obfuscation**: per-direction RC4 keystreams (not a
//!   security boundary)
//! - **Single-writer concurrency**: the engine runs on one thread;
//!   a cloneable postbox serializes cross-thread posts and wakes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use muxnet::codec::header::HeaderMode;
//! use muxnet::core::engine::Engine;
//! use muxnet::core::event::EventKind;
//!
//! fn main() -> Result<(), muxnet::base::neterror::NetError> {
//!     let mut engine = Engine::new()?;
//!     let listener = engine.new_listen("127.0.0.1:7000".parse().unwrap(), HeaderMode::WordLsb)?;
//!     loop {
//!         engine.wait(100)?;
//!         while let Some(event) = engine.poll_event() {
//!             match event.kind {
//!                 EventKind::Data => { /* one complete message in event.data */ }
//!                 EventKind::Close => { /* handle went away */ }
//!                 _ => {}
//!             }
//!         }
//!         let _ = listener;
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy and context helpers
//! - [`timer`] - Cascaded timer wheel and millisecond-driven manager
//! - [`codec`] - Framing modes and the obfuscation cipher
//! - [`core`] - The multiplexing engine, connections, events, filters
//! - [`proxy`] - Proxy settings and tunnel negotiation
//! - [`mailbox`] - Thread-safe bounded queue

pub mod base;
pub mod codec;
pub mod core;
pub mod mailbox;
pub mod proxy;
pub mod timer;

pub use crate::base::neterror::NetError;
pub use crate::codec::header::HeaderMode;
pub use crate::core::engine::{Engine, Postbox, SockOpt, SockStatus};
pub use crate::core::event::{close_code, Event, EventInfo, EventKind};
pub use crate::core::Hid;
