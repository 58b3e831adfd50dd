//! Credential and profile payloads (spec §3 `Credentials`). The core
//! treats these as opaque, short-lived bearer material issued by the
//! control plane — it never interprets or validates their contents
//! beyond the expiry it tracks for cache freshness.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Short-lived S3 credentials: access key + secret + session token, as
/// issued by an STS-style `AssumeRole` call on the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: SystemTime,
}

/// Azure credentials are a single pre-signed SAS URL, optionally scoped to
/// one file (per-file SAS, spec §4.3) rather than the whole container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureCredentials {
    pub sas_url: String,
    pub expires_at: SystemTime,
}

/// Both backends' credentials as returned together by
/// `APIClient.GetStorageCredentials` — the caller picks whichever one
/// matches the target [`crate::StorageKind`].
#[derive(Debug, Clone)]
pub struct StorageCredentials {
    pub s3: Option<S3Credentials>,
    pub azure: Option<AzureCredentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    S3Storage,
    AzureStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
}
