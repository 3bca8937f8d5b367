//! The credential proxy server - the hot path.
//!
//! Clients talk ordinary HTTP with a service-prefixed path
//! (`/<service>/<upstream-path>`); the broker authenticates the caller,
//! injects the real credential, streams the upstream response back, and
//! records one audit entry per served request.

mod forward;
mod server;

pub use server::{ConnectionInfo, ProxyServer};
