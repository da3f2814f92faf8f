//! Riftgate - Shared Rate Limiting for Game API Clients
//!
//! This crate coordinates many independent endpoint handlers behind one
//! application-wide rate limit budget. Every handler asks a shared
//! [`RateLimitCoordinator`](ratelimit::RateLimitCoordinator) before sending
//! a request and reports the server's rate limit headers back to it
//! afterwards. The coordinator never blocks or performs I/O; callers decide
//! how to wait.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ratelimit;
