//! Process-wide credential manager (C4, spec §4.3): caches default and
//! per-storage credentials, per-file Azure SAS tokens, and the user
//! profile/folder listing, each behind its own [`DoubleCheckedCache`] on
//! its own refresh interval.

use crate::cache::DoubleCheckedCache;
use crate::provider::{CredentialsSource, FileRef};
use crate::types::{AzureCredentials, Folder, S3Credentials, UserProfile};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use xfer_utils::{DEFAULT_CREDENTIAL_REFRESH_INTERVAL, PROFILE_CACHE_REFRESH_INTERVAL};

type BackendCreds = (Option<S3Credentials>, Option<AzureCredentials>);

/// One instance per API-client identity (spec §4.3, §9: "keep a
/// process-wide registry keyed by `{apiClient identity, bucketKey}`");
/// callers typically hold this behind an `Arc` shared across every
/// concurrent transfer for the same control-plane session.
pub struct CredentialManager<S: CredentialsSource> {
    source: Arc<S>,
    default: DoubleCheckedCache<BackendCreds>,
    /// Keyed by `storageID`. A `RwLock<HashMap<..>>` of caches rather than
    /// one cache of a map: each storage's credentials refresh
    /// independently instead of invalidating the whole map on any miss.
    per_storage: RwLock<HashMap<String, Arc<DoubleCheckedCache<BackendCreds>>>>,
    /// Keyed by `storageID + ":" + remotePath` (spec §4.3) — Azure
    /// per-file SAS tokens.
    per_file: RwLock<HashMap<String, Arc<DoubleCheckedCache<AzureCredentials>>>>,
    user_profile: DoubleCheckedCache<UserProfile>,
    root_folders: DoubleCheckedCache<Vec<Folder>>,
}

impl<S: CredentialsSource> CredentialManager<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            default: DoubleCheckedCache::new(DEFAULT_CREDENTIAL_REFRESH_INTERVAL),
            per_storage: RwLock::new(HashMap::new()),
            per_file: RwLock::new(HashMap::new()),
            user_profile: DoubleCheckedCache::new(PROFILE_CACHE_REFRESH_INTERVAL),
            root_folders: DoubleCheckedCache::new(PROFILE_CACHE_REFRESH_INTERVAL),
        }
    }

    pub async fn default_credentials(&self) -> anyhow::Result<BackendCreds> {
        let source = Arc::clone(&self.source);
        self.default.get_or_refresh(|| async move { source.fetch_default().await }).await
    }

    pub async fn force_refresh_default(&self) -> anyhow::Result<BackendCreds> {
        let source = Arc::clone(&self.source);
        self.default.force_refresh(|| async move { source.fetch_default().await }).await
    }

    async fn storage_cache(&self, storage_id: &str) -> Arc<DoubleCheckedCache<BackendCreds>> {
        if let Some(cache) = self.per_storage.read().await.get(storage_id) {
            return Arc::clone(cache);
        }
        let mut map = self.per_storage.write().await;
        Arc::clone(
            map.entry(storage_id.to_string())
                .or_insert_with(|| Arc::new(DoubleCheckedCache::new(DEFAULT_CREDENTIAL_REFRESH_INTERVAL))),
        )
    }

    pub async fn credentials_for_storage(&self, storage_id: &str) -> anyhow::Result<BackendCreds> {
        let cache = self.storage_cache(storage_id).await;
        let source = Arc::clone(&self.source);
        let storage_id = storage_id.to_string();
        cache
            .get_or_refresh(|| async move { source.fetch_for_storage(&storage_id).await })
            .await
    }

    pub async fn force_refresh_storage(&self, storage_id: &str) -> anyhow::Result<BackendCreds> {
        let cache = self.storage_cache(storage_id).await;
        let source = Arc::clone(&self.source);
        let storage_id_owned = storage_id.to_string();
        cache
            .force_refresh(|| async move { source.fetch_for_storage(&storage_id_owned).await })
            .await
    }

    fn file_key(storage_id: &str, remote_path: &str) -> String {
        format!("{storage_id}:{remote_path}")
    }

    async fn file_cache(&self, key: &str) -> Arc<DoubleCheckedCache<AzureCredentials>> {
        if let Some(cache) = self.per_file.read().await.get(key) {
            return Arc::clone(cache);
        }
        let mut map = self.per_file.write().await;
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(DoubleCheckedCache::new(DEFAULT_CREDENTIAL_REFRESH_INTERVAL))),
        )
    }

    pub async fn sas_for_file(&self, storage_id: &str, remote_path: &str) -> anyhow::Result<AzureCredentials> {
        let key = Self::file_key(storage_id, remote_path);
        let cache = self.file_cache(&key).await;
        let source = Arc::clone(&self.source);
        let storage_id = storage_id.to_string();
        let remote_path = remote_path.to_string();
        cache
            .get_or_refresh(|| async move {
                source
                    .fetch_sas_for_file(FileRef {
                        storage_id: &storage_id,
                        remote_path: &remote_path,
                    })
                    .await
            })
            .await
    }

    pub async fn user_profile(&self) -> anyhow::Result<UserProfile> {
        let source = Arc::clone(&self.source);
        self.user_profile.get_or_refresh(|| async move { source.fetch_user_profile().await }).await
    }

    pub async fn root_folders(&self) -> anyhow::Result<Vec<Folder>> {
        let source = Arc::clone(&self.source);
        self.root_folders.get_or_refresh(|| async move { source.fetch_root_folders().await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    struct CountingSource {
        default_calls: AtomicUsize,
        storage_calls: AtomicUsize,
        fail_default: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl CredentialsSource for CountingSource {
        async fn fetch_default(&self) -> anyhow::Result<BackendCreds> {
            self.default_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_default.load(Ordering::SeqCst) {
                anyhow::bail!("control plane unreachable");
            }
            Ok((
                Some(S3Credentials {
                    access_key_id: "ak".into(),
                    secret_access_key: "sk".into(),
                    session_token: "tok".into(),
                    expires_at: SystemTime::now(),
                }),
                None,
            ))
        }

        async fn fetch_for_storage(&self, _storage_id: &str) -> anyhow::Result<BackendCreds> {
            self.storage_calls.fetch_add(1, Ordering::SeqCst);
            Ok((None, Some(AzureCredentials { sas_url: "https://x".into(), expires_at: SystemTime::now() })))
        }

        async fn fetch_sas_for_file(&self, file: FileRef<'_>) -> anyhow::Result<AzureCredentials> {
            Ok(AzureCredentials {
                sas_url: format!("https://x/{}/{}", file.storage_id, file.remote_path),
                expires_at: SystemTime::now(),
            })
        }

        async fn fetch_user_profile(&self) -> anyhow::Result<UserProfile> {
            Ok(UserProfile { user_id: "u1".into(), display_name: "Test User".into() })
        }

        async fn fetch_root_folders(&self) -> anyhow::Result<Vec<Folder>> {
            Ok(vec![])
        }
    }

    fn source() -> Arc<CountingSource> {
        Arc::new(CountingSource {
            default_calls: AtomicUsize::new(0),
            storage_calls: AtomicUsize::new(0),
            fail_default: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn default_credentials_are_cached() {
        let src = source();
        let manager = CredentialManager::new(Arc::clone(&src));
        manager.default_credentials().await.unwrap();
        manager.default_credentials().await.unwrap();
        assert_eq!(src.default_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_storage_ids_cache_independently() {
        let src = source();
        let manager = CredentialManager::new(Arc::clone(&src));
        manager.credentials_for_storage("s1").await.unwrap();
        manager.credentials_for_storage("s2").await.unwrap();
        manager.credentials_for_storage("s1").await.unwrap();
        assert_eq!(src.storage_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn per_file_sas_is_keyed_by_storage_and_path() {
        let src = source();
        let manager = CredentialManager::new(src);
        let a = manager.sas_for_file("s1", "a.bin").await.unwrap();
        let b = manager.sas_for_file("s1", "b.bin").await.unwrap();
        assert_ne!(a.sas_url, b.sas_url);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache_even_when_fresh() {
        let src = source();
        let manager = CredentialManager::new(Arc::clone(&src));
        manager.default_credentials().await.unwrap();
        manager.force_refresh_default().await.unwrap();
        assert_eq!(src.default_calls.load(Ordering::SeqCst), 2);
    }
}
