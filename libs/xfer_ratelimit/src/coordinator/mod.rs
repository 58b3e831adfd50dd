//! Cross-process coordinator (C3): a single authoritative daemon per host
//! owning the real token buckets, with other processes talking to it over
//! a local IPC endpoint (spec §4.2, §6).

pub mod client;
pub mod lease;
pub mod lifecycle;
pub mod protocol;
pub mod server;
mod transport;

pub use client::CoordinatorClient;
pub use lease::LeaseGrant;
pub use lifecycle::{serve_request, SERVE_ENV_VAR};
pub use protocol::{Request, Response};
pub use server::CoordinatorServer;
