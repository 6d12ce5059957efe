//! Shared plumbing for the reconciliation services: error type, process
//! configuration, tracing setup, and HTTP middleware.

pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;

pub use axum;
