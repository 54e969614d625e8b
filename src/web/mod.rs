//! HTTP API: router, authentication, request/response types and handlers.

pub mod auth;
pub mod handlers;
pub mod server;
pub mod types;

pub use server::{AppState, KeyedRateLimiter, RateLimiter, start_server};
