//! HTTP middleware shared by the services.

pub mod metrics;
pub mod tracing;
