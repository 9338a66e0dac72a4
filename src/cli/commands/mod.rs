//! CLI command implementations.

mod check;
mod permit;
mod start;

pub use check::run_check_config;
pub use permit::run_permit;
pub use start::run_start;
