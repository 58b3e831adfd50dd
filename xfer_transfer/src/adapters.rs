//! External interfaces consumed (C10, spec §4.9): traits the orchestrator
//! is generic over rather than concrete dependencies, so the JSON-over-HTTPS
//! API client and the GUI progress bar stay external per the spec's
//! Non-goals while the trait boundary itself ships with the core — the
//! same shape the teacher uses for `RemoteStorage` (a trait implemented
//! outside the crate's concrete types where the embedder wants to).

use crate::types::CloudFile;
use crate::types::CloudFileRequest;
use async_trait::async_trait;
use std::sync::Arc;
use xfer_credentials::{AzureCredentials, Folder, S3Credentials, UserProfile};

/// `APIClient` (spec §4.9). `storage_id` stands in for the spec's
/// `fileInfo?` parameter on `GetStorageCredentials` — the only part of a
/// `CloudFile` that call actually discriminates on; `None` requests the
/// caller's default storage.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_storage_credentials(
        &self,
        storage_id: Option<&str>,
    ) -> anyhow::Result<(Option<S3Credentials>, Option<AzureCredentials>)>;

    async fn get_sas_for_file(&self, storage_id: &str, remote_path: &str) -> anyhow::Result<AzureCredentials>;

    async fn get_user_profile(&self) -> anyhow::Result<UserProfile>;

    async fn get_root_folders(&self) -> anyhow::Result<Vec<Folder>>;

    /// Called by the upload entry point after the core has completed
    /// (spec §4.9: "called ... *after* the core has completed").
    async fn register_file(&self, request: CloudFileRequest) -> anyhow::Result<CloudFile>;
}

/// Bridges the richer [`ApiClient`] (C10) down to the narrower
/// [`xfer_credentials::CredentialsSource`] (C4's actual dependency) —
/// mirrors the crate boundary `xfer_credentials::provider` already
/// documents: "the full `APIClient` surface ... is assembled one layer up,
/// in the orchestrator crate".
pub struct ApiClientCredentialsSource {
    client: Arc<dyn ApiClient>,
}

impl ApiClientCredentialsSource {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl xfer_credentials::CredentialsSource for ApiClientCredentialsSource {
    async fn fetch_default(&self) -> anyhow::Result<(Option<S3Credentials>, Option<AzureCredentials>)> {
        self.client.get_storage_credentials(None).await
    }

    async fn fetch_for_storage(&self, storage_id: &str) -> anyhow::Result<(Option<S3Credentials>, Option<AzureCredentials>)> {
        self.client.get_storage_credentials(Some(storage_id)).await
    }

    async fn fetch_sas_for_file(&self, file: xfer_credentials::FileRef<'_>) -> anyhow::Result<AzureCredentials> {
        self.client.get_sas_for_file(file.storage_id, file.remote_path).await
    }

    async fn fetch_user_profile(&self) -> anyhow::Result<UserProfile> {
        self.client.get_user_profile().await
    }

    async fn fetch_root_folders(&self) -> anyhow::Result<Vec<Folder>> {
        self.client.get_root_folders().await
    }
}

/// Arbitrary writable byte stream for status messages (spec §4.9). Kept
/// separate from `tracing` output: this is user-facing progress text, not
/// a diagnostic log.
pub trait StatusSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// `Progress(fraction 0.0-1.0)` callback (spec §4.9). Both this and
/// [`StatusSink`] are optional on every orchestrator call.
pub type ProgressFractionCallback = Arc<dyn Fn(f64) + Send + Sync>;
