//! Cart, checkout and payment orchestration service.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod store;

pub use startup::{AppState, Application};
