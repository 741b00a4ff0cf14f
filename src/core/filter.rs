//! Per-connection protocol filters.
//!
//! A filter sits between the application and the framing layer of one
//! connection: outbound data passes through [`Filter::on_write`]
//! before the cipher/header stage, inbound messages pass through
//! [`Filter::on_input`] after de-framing and deciphering, before the
//! `Data` event is queued. Filters are installed and removed
//! independently of cipher and framing configuration — directly via
//! [`Engine::set_filter`], or by protocol id through a registered
//! [`FilterFactory`].
//!
//! [`Engine::set_filter`]: crate::core::engine::Engine::set_filter

use crate::core::Hid;

/// Outcome of a filter pass over one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Deliver the (possibly transformed) bytes.
    Pass,
    /// Swallow the message: a vetoed write sends nothing, a vetoed
    /// input queues no `Data` event.
    Veto,
}

/// A pluggable per-connection transform.
///
/// All hooks default to pass-through, so a filter implements only the
/// directions it cares about.
pub trait Filter {
    /// Called once right after installation.
    fn on_install(&mut self, hid: Hid) {
        let _ = hid;
    }

    /// Called right before the filter (or its connection) goes away.
    fn on_remove(&mut self, hid: Hid) {
        let _ = hid;
    }

    /// Outbound: may transform `data` in place or veto the send.
    fn on_write(&mut self, hid: Hid, data: &mut Vec<u8>) -> FilterVerdict {
        let _ = (hid, data);
        FilterVerdict::Pass
    }

    /// Inbound: may transform `data` in place or suppress the event.
    fn on_input(&mut self, hid: Hid, data: &mut Vec<u8>) -> FilterVerdict {
        let _ = (hid, data);
        FilterVerdict::Pass
    }
}

/// Builds a filter for `(handle, protocol id)` requests.
///
/// Registered on the engine so higher-level protocol stacks can be
/// plugged in without the engine depending on their concrete types.
/// Returning `None` declines the protocol id.
pub type FilterFactory = Box<dyn Fn(Hid, u32) -> Option<Box<dyn Filter>>>;
