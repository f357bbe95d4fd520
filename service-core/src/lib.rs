//! service-core: Shared infrastructure for the commerce services.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
