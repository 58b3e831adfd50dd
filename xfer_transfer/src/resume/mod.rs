//! Resume store (C9, spec §4.8): one JSON document per local path for
//! upload and download progress, written atomically (write-to-temp +
//! rename), plus a companion lock file guarding against two process
//! instances working the same local path concurrently.

mod download_state;
mod upload_state;

pub use download_state::DownloadResumeState;
pub use upload_state::{RecordedPart, UploadResumeState};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use xfer_utils::TransferError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    process_id: u32,
    acquired_at: SystemTime,
}

/// Held while a transfer owns a local path's resume state; releases the
/// lock file on drop. Intentionally synchronous (`Drop` can't await) —
/// matches the teacher's advisory-lock cleanup style of best-effort
/// `std::fs::remove_file`, ignoring errors.
pub struct LockGuard {
    path: Utf8PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap portable liveness check; fall back to the lock's age below.
    true
}

/// Lock files older than this are treated as abandoned even if the owning
/// PID can't be confirmed dead (covers the Windows `pid_alive` stub and
/// PID reuse on any platform).
const STALE_LOCK_AGE: std::time::Duration = std::time::Duration::from_secs(6 * 60 * 60);

pub struct ResumeStore {
    /// Overrides where state/lock files live; `None` keeps them alongside
    /// the source file, matching spec §6 ("`<localPath>.upload.state.json`").
    state_dir: Option<Utf8PathBuf>,
}

impl ResumeStore {
    pub fn new(state_dir: Option<Utf8PathBuf>) -> Self {
        Self { state_dir }
    }

    fn sibling_path(&self, local_path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
        match &self.state_dir {
            None => {
                let mut p = local_path.to_path_buf();
                let name = format!("{}{suffix}", local_path.file_name().unwrap_or("file"));
                p.set_file_name(name);
                p
            }
            Some(dir) => {
                // Key by a hash of the full path so two files with the same
                // basename in different directories don't collide once
                // state files are relocated out of their source directory.
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(local_path.as_str().as_bytes());
                let digest = hex::encode(&hasher.finalize()[..8]);
                dir.join(format!("{digest}{suffix}"))
            }
        }
    }

    fn upload_state_path(&self, local_path: &Utf8Path) -> Utf8PathBuf {
        self.sibling_path(local_path, ".upload.state.json")
    }

    fn download_state_path(&self, local_path: &Utf8Path) -> Utf8PathBuf {
        self.sibling_path(local_path, ".download.state.json")
    }

    fn lock_path(&self, local_path: &Utf8Path) -> Utf8PathBuf {
        self.sibling_path(local_path, ".lock")
    }

    async fn write_atomic(path: &Utf8Path, contents: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn load_upload_state(&self, local_path: &Utf8Path) -> Option<UploadResumeState> {
        let path = self.upload_state_path(local_path);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn save_upload_state(&self, state: &UploadResumeState) -> anyhow::Result<()> {
        let path = self.upload_state_path(&state.local_path);
        let bytes = serde_json::to_vec_pretty(state)?;
        Self::write_atomic(&path, &bytes).await
    }

    pub async fn delete_upload_state(&self, local_path: &Utf8Path) -> anyhow::Result<()> {
        let path = self.upload_state_path(local_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load_download_state(&self, local_path: &Utf8Path) -> Option<DownloadResumeState> {
        let path = self.download_state_path(local_path);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn save_download_state(&self, state: &DownloadResumeState) -> anyhow::Result<()> {
        let path = self.download_state_path(&state.local_path);
        let bytes = serde_json::to_vec_pretty(state)?;
        Self::write_atomic(&path, &bytes).await
    }

    pub async fn delete_download_state(&self, local_path: &Utf8Path) -> anyhow::Result<()> {
        let path = self.download_state_path(local_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rejects a concurrent transfer of the same local path by another
    /// process instance (spec §4.8). Steals a lock whose owning PID is
    /// confirmed dead, or old enough to be presumed abandoned.
    pub async fn acquire_lock(&self, local_path: &Utf8Path) -> Result<LockGuard, TransferError> {
        let path = self.lock_path(local_path);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(existing) = serde_json::from_slice::<LockInfo>(&bytes) {
                let age = existing.acquired_at.elapsed().unwrap_or_default();
                if pid_alive(existing.process_id) && age < STALE_LOCK_AGE {
                    return Err(TransferError::ResumeStateInvalid(format!(
                        "{local_path} is locked by pid {}",
                        existing.process_id
                    )));
                }
                tracing::warn!(pid = existing.process_id, ?age, %local_path, "stealing abandoned resume lock");
            }
        }
        let info = LockInfo { process_id: std::process::id(), acquired_at: SystemTime::now() };
        let bytes = serde_json::to_vec(&info).map_err(|e| TransferError::Other(e.into()))?;
        Self::write_atomic(&path, &bytes).await.map_err(TransferError::Other)?;
        Ok(LockGuard { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use xfer_credentials::StorageKind;

    fn sample_upload_state(local_path: Utf8PathBuf) -> UploadResumeState {
        UploadResumeState {
            local_path,
            object_key: "key".into(),
            upload_id: "upload-1".into(),
            total_bytes: 100,
            original_bytes: 100,
            uploaded_bytes: 0,
            parts: vec![],
            key_b64: "a2V5".into(),
            initial_iv_b64: "aXY=".into(),
            current_iv_b64: "aXY=".into(),
            part_size: 32 * 1024 * 1024,
            random_suffix: "abc".into(),
            created_at: SystemTime::now(),
            last_update: SystemTime::now(),
            storage_type: StorageKind::S3Storage,
            owning_pid: std::process::id(),
            lock_acquired_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("file.bin");
        let store = ResumeStore::new(None);
        let state = sample_upload_state(local_path.to_path_buf());
        store.save_upload_state(&state).await.unwrap();

        let loaded = store.load_upload_state(&local_path).await.unwrap();
        assert_eq!(loaded.upload_id, state.upload_id);
        assert_eq!(loaded.object_key, state.object_key);
    }

    #[tokio::test]
    async fn delete_removes_state_file() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("file.bin");
        let store = ResumeStore::new(None);
        let state = sample_upload_state(local_path.to_path_buf());
        store.save_upload_state(&state).await.unwrap();
        store.delete_upload_state(&local_path).await.unwrap();
        assert!(store.load_upload_state(&local_path).await.is_none());
    }

    #[tokio::test]
    async fn lock_rejects_concurrent_acquire_by_live_pid() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("file.bin");
        let store = ResumeStore::new(None);
        let _guard = store.acquire_lock(&local_path).await.unwrap();
        let second = store.acquire_lock(&local_path).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("file.bin");
        let store = ResumeStore::new(None);
        {
            let _guard = store.acquire_lock(&local_path).await.unwrap();
        }
        let second = store.acquire_lock(&local_path).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn state_dir_override_keys_by_path_hash() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let local_path = Utf8PathBuf::from("/some/where/file.bin");
        let store = ResumeStore::new(Some(state_dir));
        let state = sample_upload_state(local_path.clone());
        store.save_upload_state(&state).await.unwrap();
        let loaded = store.load_upload_state(&local_path).await.unwrap();
        assert_eq!(loaded.object_key, "key");
    }
}
