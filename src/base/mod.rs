//! Base types and error handling.
//!
//! Foundational pieces shared by every layer:
//! - [`neterror::NetError`]: engine error codes with a stable numeric map
//! - [`context::IoResultExt`]: context helpers for IO errors

pub mod context;
pub mod neterror;
