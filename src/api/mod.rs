//! API boundary
//!
//! Normalized message and user records consumed from the
//! origin-specific API clients.

mod dto;

pub use dto::*;
