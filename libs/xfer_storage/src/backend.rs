//! The backend-client surface (C7, spec §4.6): a thin, thread-safe
//! wrapper over each native SDK. S3 wording is used throughout ("part",
//! "multipart upload"); the Azure implementation is isomorphic
//! (block/block-list), per spec §4.6.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::AsyncRead;
use xfer_utils::TransferError;

/// Result of a `HeadObject` call: size plus lower-cased metadata (spec
/// §6: "metadata keys are stored lower-cased by the backend and must be
/// read lower-cased").
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

/// One uploaded part/block, as returned by the backend. `e_tag` is
/// S3-only in practice (Azure block blobs don't return one per block);
/// Azure backends leave it empty rather than fabricating a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based, matching the backend wire format (spec §3 `PartResult`).
    pub part_number: u32,
    pub e_tag: String,
    pub size: u64,
}

/// Opaque handle to an in-progress multipart upload / uncommitted block
/// list. Callers persist the `upload_id` (and, for Azure, the ordered
/// block IDs carried by the orchestrator's resume state) across process
/// restarts; this handle itself is not `Serialize` because it also holds
/// the backend-specific live session data.
#[derive(Debug, Clone)]
pub struct MultipartHandle {
    pub remote_path: String,
    pub upload_id: String,
}

pub type BoxedAsyncRead = std::pin::Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Capability set a backend exposes to the orchestrator (spec §9:
/// "capability set `{Upload, Download, RefreshCredentials, StorageType,
/// optional SetFileInfo, optional DetectFormat}`"). `StorageType` is
/// provided by each implementor's own type identity rather than a method
/// here, matching the teacher's `GenericRemoteStorage` enum dispatch.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Re-pulls credentials from the credential manager if stale and
    /// reconfigures the SDK client in place. The underlying HTTP
    /// connection pool must be preserved across this call (spec §4.6);
    /// only the credentials provider is swapped.
    async fn ensure_fresh_credentials(&self) -> Result<(), TransferError>;

    /// `SetFileInfo` (spec §4.7 "Cross-storage downloads", §9 capability
    /// set): pins this backend's credential scope to `storage_id` (or
    /// back to the caller's default storage when `None`) and rebuilds the
    /// client against that scope's credentials, same as
    /// `ensure_fresh_credentials` but against the newly pinned scope
    /// rather than whichever one was already in effect. Optional in the
    /// capability sense — the default implementation is a no-op for any
    /// backend (such as a test fake) that has no notion of per-storage
    /// credentials.
    async fn set_file_info(&self, _storage_id: Option<&str>) -> Result<(), TransferError> {
        Ok(())
    }

    async fn head_object(&self, remote_path: &str) -> Result<ObjectHead, TransferError>;

    /// Inclusive byte range `[start, end]`.
    async fn get_object_range(
        &self,
        remote_path: &str,
        start: u64,
        end: u64,
    ) -> Result<BoxedAsyncRead, TransferError>;

    async fn create_multipart_upload(
        &self,
        remote_path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<MultipartHandle, TransferError>;

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        bytes: Bytes,
    ) -> Result<UploadedPart, TransferError>;

    async fn complete_multipart_upload(
        &self,
        handle: &MultipartHandle,
        parts: Vec<UploadedPart>,
    ) -> Result<(), TransferError>;

    async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> Result<(), TransferError>;

    /// Used by the orchestrator's resume check (spec §4.7 step 2) to
    /// confirm a dangling multipart upload still exists on the backend
    /// before trusting the locally persisted part list.
    async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<UploadedPart>, TransferError>;
}
