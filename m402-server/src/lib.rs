//! HTTP server for m402 payment-gated resources.
//!
//! Adapts the [`m402::AccessGateway`] to HTTP: a request without a payment
//! proof receives `402 Payment Required` with the challenge, a request with
//! a valid proof receives the resource.
//!
//! # Modules
//!
//! - [`handlers`] - Axum route handlers and router builder
//! - [`error`] - HTTP error responses
//! - [`config`] - Server configuration with environment variable expansion

pub mod config;
pub mod error;
pub mod handlers;

pub use handlers::{AppState, router};
