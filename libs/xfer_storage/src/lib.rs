//! Backend client (C7, spec §4.6): a [`StorageBackend`] trait plus its
//! two concrete implementations, dispatched at runtime the way the
//! teacher's `GenericRemoteStorage` enum dispatches between `S3Bucket`
//! and `AzureBlobStorage` (`remote_storage::lib`) — this client only ever
//! targets one backend kind per transfer, decided by the caller's
//! [`config::StorageConfig`], so a thin enum is enough; no trait object
//! is needed at the top level.

pub mod azure;
pub mod backend;
pub mod config;
pub mod progress;
pub mod retry;
pub mod s3;

pub use backend::{BoxedAsyncRead, MultipartHandle, ObjectHead, StorageBackend, UploadedPart};
pub use config::{AzureConfig, EngineConfig, S3Config, StorageConfig};
pub use progress::{ProgressReader, ProgressSink};
pub use retry::{retry_with_backoff, RetryHooks};

use std::sync::Arc;
use xfer_credentials::CredentialManager;
use xfer_credentials::CredentialsSource;

/// Runtime dispatch between the two backend kinds a single transfer can
/// target (spec §9: "capability set ... variant tags drive dispatch").
pub enum GenericStorageBackend<S: CredentialsSource + 'static> {
    S3(s3::S3Backend<S>),
    Azure(azure::AzureBackend<S>),
}

impl<S: CredentialsSource + 'static> GenericStorageBackend<S> {
    /// Builds a backend for the user's default storage from `config`.
    pub fn from_config(config: &StorageConfig, credential_manager: Arc<CredentialManager<S>>) -> Self {
        match config {
            StorageConfig::S3(s3_config) => GenericStorageBackend::S3(s3::S3Backend::new(s3_config, credential_manager)),
            StorageConfig::Azure(azure_config) => {
                GenericStorageBackend::Azure(azure::AzureBackend::new(azure_config, credential_manager))
            }
        }
    }

    /// Builds a backend pinned to a specific `storageID` (spec §4.7
    /// "Cross-storage downloads").
    pub fn for_storage(config: &StorageConfig, credential_manager: Arc<CredentialManager<S>>, storage_id: impl Into<String>) -> Self {
        match config {
            StorageConfig::S3(s3_config) => {
                GenericStorageBackend::S3(s3::S3Backend::for_storage(s3_config, credential_manager, storage_id))
            }
            StorageConfig::Azure(azure_config) => {
                GenericStorageBackend::Azure(azure::AzureBackend::for_storage(azure_config, credential_manager, storage_id))
            }
        }
    }

    pub fn storage_type(&self) -> xfer_credentials::StorageKind {
        match self {
            GenericStorageBackend::S3(_) => xfer_credentials::StorageKind::S3Storage,
            GenericStorageBackend::Azure(_) => xfer_credentials::StorageKind::AzureStorage,
        }
    }
}

#[async_trait::async_trait]
impl<S: CredentialsSource + 'static> StorageBackend for GenericStorageBackend<S> {
    async fn ensure_fresh_credentials(&self) -> Result<(), xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.ensure_fresh_credentials().await,
            GenericStorageBackend::Azure(b) => b.ensure_fresh_credentials().await,
        }
    }

    async fn set_file_info(&self, storage_id: Option<&str>) -> Result<(), xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.set_file_info(storage_id).await,
            GenericStorageBackend::Azure(b) => b.set_file_info(storage_id).await,
        }
    }

    async fn head_object(&self, remote_path: &str) -> Result<ObjectHead, xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.head_object(remote_path).await,
            GenericStorageBackend::Azure(b) => b.head_object(remote_path).await,
        }
    }

    async fn get_object_range(&self, remote_path: &str, start: u64, end: u64) -> Result<BoxedAsyncRead, xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.get_object_range(remote_path, start, end).await,
            GenericStorageBackend::Azure(b) => b.get_object_range(remote_path, start, end).await,
        }
    }

    async fn create_multipart_upload(
        &self,
        remote_path: &str,
        metadata: std::collections::HashMap<String, String>,
    ) -> Result<MultipartHandle, xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.create_multipart_upload(remote_path, metadata).await,
            GenericStorageBackend::Azure(b) => b.create_multipart_upload(remote_path, metadata).await,
        }
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        bytes: bytes::Bytes,
    ) -> Result<UploadedPart, xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.upload_part(handle, part_number, bytes).await,
            GenericStorageBackend::Azure(b) => b.upload_part(handle, part_number, bytes).await,
        }
    }

    async fn complete_multipart_upload(&self, handle: &MultipartHandle, parts: Vec<UploadedPart>) -> Result<(), xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.complete_multipart_upload(handle, parts).await,
            GenericStorageBackend::Azure(b) => b.complete_multipart_upload(handle, parts).await,
        }
    }

    async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> Result<(), xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.abort_multipart_upload(handle).await,
            GenericStorageBackend::Azure(b) => b.abort_multipart_upload(handle).await,
        }
    }

    async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<UploadedPart>, xfer_utils::TransferError> {
        match self {
            GenericStorageBackend::S3(b) => b.list_parts(handle).await,
            GenericStorageBackend::Azure(b) => b.list_parts(handle).await,
        }
    }
}
