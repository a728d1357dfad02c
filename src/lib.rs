//! Usergate - an identity-aware reverse proxy with per-user workers
//!
//! This library provides a gateway that:
//! - Authenticates callers via bearer token, cookie, or (for WebSocket
//!   upgrades) query string
//! - Lazily spawns one dedicated workspace worker process per identity,
//!   with port allocation from a reserved range and TCP readiness checks
//! - Persists the identity → instance mapping so workers survive a gateway
//!   restart
//! - Forwards HTTP traffic behind a routing prefix, rewriting paths,
//!   headers, and relative URLs in HTML responses
//! - Splices WebSocket connections to the worker as raw byte streams
//! - Evicts dead instances with a periodic health sweep

pub mod auth;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod tunnel;
