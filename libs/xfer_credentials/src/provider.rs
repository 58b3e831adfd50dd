//! The subset of the external API client (C10) that the credential
//! manager depends on. The full `APIClient` surface (including
//! `RegisterFile`) is assembled one layer up, in the orchestrator crate;
//! this trait only names what C4 itself needs to fetch.

use crate::types::{AzureCredentials, Folder, S3Credentials, UserProfile};
use async_trait::async_trait;

/// A remote file reference sufficient to request per-file Azure SAS
/// credentials (spec §4.3: "additionally by `storageID + \":\" +
/// remotePath` for Azure"). Kept minimal and backend-agnostic here; the
/// orchestrator's richer `CloudFile` satisfies this via a thin adapter.
pub struct FileRef<'a> {
    pub storage_id: &'a str,
    pub remote_path: &'a str,
}

#[async_trait]
pub trait CredentialsSource: Send + Sync {
    /// Fetches credentials for the user's default storage.
    async fn fetch_default(&self) -> anyhow::Result<(Option<S3Credentials>, Option<AzureCredentials>)>;

    /// Fetches credentials scoped to a specific storage (cross-storage
    /// downloads, spec §4.7 "Cross-storage downloads").
    async fn fetch_for_storage(
        &self,
        storage_id: &str,
    ) -> anyhow::Result<(Option<S3Credentials>, Option<AzureCredentials>)>;

    /// Fetches a per-file SAS token. Azure-only; S3 has no per-object
    /// credential concept in this client.
    async fn fetch_sas_for_file(&self, file: FileRef<'_>) -> anyhow::Result<AzureCredentials>;

    async fn fetch_user_profile(&self) -> anyhow::Result<UserProfile>;

    async fn fetch_root_folders(&self) -> anyhow::Result<Vec<Folder>>;
}
