//! Shared constants, scope registry and error taxonomy for the transfer engine.
//!
//! No other crate in this workspace is supposed to duplicate these
//! definitions: [`Scope`], [`TransferError`] and the thresholds below are
//! the single source of truth consumed by the crypto, rate-limit,
//! credential, resource and storage crates.

pub mod constants;
pub mod dirs;
pub mod error;
pub mod scope;

pub use constants::*;
pub use error::TransferError;
pub use scope::{BucketKey, Scope, ScopeLimits};
