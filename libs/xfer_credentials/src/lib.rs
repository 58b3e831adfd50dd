//! Credential manager (C4, spec §4.3): a process-wide, double-checked
//! cache in front of the control plane's short-lived storage credentials,
//! user profile and folder listing.

mod cache;
mod manager;
mod provider;
mod types;

pub use cache::DoubleCheckedCache;
pub use manager::CredentialManager;
pub use provider::{CredentialsSource, FileRef};
pub use types::{AzureCredentials, Folder, S3Credentials, StorageCredentials, StorageKind, UserProfile};
