//! Data model (spec §3): the value types the orchestrator (C8) and resume
//! store (C9) pass around. Credential and rate-limit types live in
//! `xfer_credentials`/`xfer_ratelimit`; this module covers what's specific
//! to a single file transfer.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use xfer_credentials::StorageKind;
use xfer_crypto::FormatVersion;

/// Backend type, region/endpoint, container/bucket and path prefix for one
/// storage scope. Immutable for the lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage_type: StorageKind,
    pub region_or_endpoint: String,
    pub container_or_bucket: String,
    pub path_prefix: Option<String>,
    pub storage_id: String,
}

/// Remote file descriptor as handed back by the external API (spec §3
/// `CloudFile`). `storage` is `None` when the file lives on the caller's
/// default storage; set only for cross-storage fetches (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFile {
    pub storage: Option<StorageInfo>,
    pub remote_path: String,
    pub decrypted_size: u64,
    pub key_b64: String,
    pub iv_b64: Option<String>,
    pub checksums: Vec<String>,
}

impl CloudFile {
    /// The `storageID` this file should be fetched with, if it pins one
    /// different from the caller's default (spec §4.7 "Cross-storage
    /// downloads").
    pub fn storage_id(&self) -> Option<&str> {
        self.storage.as_ref().map(|s| s.storage_id.as_str())
    }
}

/// One completed part/block as produced by the upload pipeline (spec §3
/// `PartResult`). `part_index` is the 0-based internal index used for CBC
/// chaining order and progress accounting; `part_number` is the 1-based
/// value the backend wire format expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_index: u64,
    pub part_number: u32,
    pub e_tag: String,
    pub size: u64,
}

/// Outcome of a completed upload, returned to the caller so it can invoke
/// `APIClient.RegisterFile` (spec §4.9) with the material the core
/// generated.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub remote_path: String,
    pub key_b64: String,
    pub iv_b64: String,
    pub format_version: FormatVersion,
    pub total_bytes: u64,
}

/// Request shape the caller passes to `APIClient.RegisterFile` once an
/// upload has completed (spec §4.9).
#[derive(Debug, Clone)]
pub struct CloudFileRequest {
    pub storage_path: String,
    pub key_b64: String,
    pub iv_b64: String,
    pub format_version: FormatVersion,
    pub size: u64,
    pub checksum_sha512: String,
}

/// Options threaded through a single upload invocation.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub aggressive_resource_scaling: bool,
}

/// Options threaded through a single download invocation.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Demote a checksum mismatch from a fatal error to a logged warning
    /// (spec §7 "Checksum mismatch ... fatal unless the caller set
    /// SkipChecksum").
    pub skip_checksum: bool,
}

pub(crate) fn random_suffix() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..22).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

/// The deterministic part of spec §6's "On-storage object layout"
/// (`<pathBase>/<basename>-<22-char-random>`) — everything but the random
/// suffix, which is generated fresh per upload attempt and only known once
/// persisted. This is the one part of the object key a resume check can
/// compare against the *current* invocation rather than reading back out
/// of the resume state it's trying to validate.
pub(crate) fn object_layout_prefix(local_path: &Utf8PathBuf) -> String {
    let basename = local_path.file_name().unwrap_or("file");
    format!("{basename}-")
}

/// `<pathBase>/<basename>-<22-char-random>` (spec §6 "On-storage object
/// layout").
pub(crate) fn object_layout_path(local_path: &Utf8PathBuf, suffix: &str) -> String {
    format!("{}{suffix}", object_layout_prefix(local_path))
}
