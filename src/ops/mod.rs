//! Operations and observability.
//!
//! - `telemetry` - JSON tracing subscriber
//! - `audit` - Audit events for session and authorization decisions

pub mod audit;
pub mod telemetry;

pub use audit::{AuditEvent, AuditSink};
pub use telemetry::init_tracing;
