//! TCP dial/accept mechanics for the relay client/worker runtime.
//!
//! This crate owns exactly the parts of the transport that are concrete to
//! TCP: walking a candidate endpoint list until one connects, and a minimal
//! listener used by the test harness to stand in for a locator or service
//! peer. Everything above "bytes on a socket" — framing, multiplexing,
//! protocol state — lives in `relay-core`, which depends on this crate the
//! same way the runtime's higher layers depend on its own TCP transport.

mod connect;
mod error;
mod listener;

pub use connect::{TcpSocketConfig, connect_first_reachable};
pub use error::TcpTransportError;
pub use listener::TcpListener;
