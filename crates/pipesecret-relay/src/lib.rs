//! Relay plumbing that multiplexes many local secret queries over one
//! ordered duplex byte channel (typically a remote session's stdin/stdout).
//!
//! - [`client::RelayClient`] owns the remote end of the channel: it drains
//!   the [`queue`] one call at a time and sends heartbeats while idle.
//! - [`server::RelayServer`] owns the controller end and answers requests
//!   through a [`server::Handler`].
//! - [`bridge::Bridge`] accepts local callers on a Unix socket and feeds the
//!   queue.
//! - [`remote`] and [`controller`] wire the pieces together for each side.

pub mod bridge;
pub mod client;
pub mod controller;
pub mod error;
pub mod queue;
pub mod remote;
pub mod server;

pub use error::RelayError;
