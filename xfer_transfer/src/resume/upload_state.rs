use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use xfer_credentials::StorageKind;

/// One uploaded part/block as recorded in [`UploadResumeState`]. The two
/// backend shapes named in spec §4.8 ("S3 uses `{PartNumber, ETag}[]`;
/// Azure uses `BlockID[]`") are both covered by a single variant carrying
/// `e_tag` — Azure's backend simply leaves it empty, matching
/// `xfer_storage::UploadedPart`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedPart {
    pub part_number: u32,
    pub e_tag: String,
    pub size: u64,
}

/// Persisted upload progress (spec §3 `UploadResumeState`, §4.8). One JSON
/// document per local path, written atomically (write-temp + rename).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResumeState {
    pub local_path: Utf8PathBuf,
    pub object_key: String,
    pub upload_id: String,
    pub total_bytes: u64,
    pub original_bytes: u64,
    pub uploaded_bytes: u64,
    pub parts: Vec<RecordedPart>,
    pub key_b64: String,
    pub initial_iv_b64: String,
    /// CBC chaining state as of the last persisted part (glossary "Current
    /// IV"): required to resume [`xfer_crypto::CbcChainEncryptor`] without
    /// re-reading already-uploaded ciphertext.
    pub current_iv_b64: String,
    pub part_size: u64,
    pub random_suffix: String,
    pub created_at: SystemTime,
    pub last_update: SystemTime,
    pub storage_type: StorageKind,
    pub owning_pid: u32,
    pub lock_acquired_at: SystemTime,
}

impl UploadResumeState {
    /// Invariant from spec §3: "the byte counts agree with the sum of
    /// recorded parts".
    pub fn byte_counts_consistent(&self) -> bool {
        self.parts.iter().map(|p| p.size).sum::<u64>() == self.uploaded_bytes
    }

    /// Invariant from spec §3: "`EncryptedPath` and `ObjectKey` match
    /// current invocation" (this client has no encrypted temp file for
    /// streaming upload, so only `object_key` and `local_path` apply).
    ///
    /// The random suffix half of the object key is only known once a
    /// resume file exists to read it from, so it can't be compared
    /// against an independent "current invocation" value — but the
    /// `<basename>-` prefix is deterministic from `local_path` alone, and
    /// is what `object_key_prefix` must be. A resume file whose recorded
    /// object key doesn't start with the current local path's prefix
    /// belongs to a different invocation entirely (e.g. a stale state file
    /// surviving a rename) and must be rejected rather than resumed.
    pub fn matches_invocation(&self, local_path: &Utf8PathBuf, object_key_prefix: &str, storage_type: StorageKind) -> bool {
        self.local_path == *local_path && self.object_key.starts_with(object_key_prefix) && self.storage_type == storage_type
    }

    pub fn next_part_index(&self) -> u64 {
        self.parts.len() as u64
    }
}
