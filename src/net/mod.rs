//! Networking layer.
//!
//! - `listener` - TCP accept loop and per-connection frame pump
//! - `router` - delivery of engine output to connection writers

pub mod listener;
pub mod router;

pub use listener::Listener;
pub use router::ConnectionRouter;
