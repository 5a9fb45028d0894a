//! Operational endpoints for the maintenance process.

pub mod health;
pub mod metrics;

pub use health::health_check;
pub use metrics::metrics;
