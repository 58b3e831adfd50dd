use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use xfer_credentials::StorageKind;

/// Persisted download progress (spec §3 `DownloadResumeState`, §4.8,
/// §4.7 step 3): only meaningful for the v0 concurrent-chunk path —
/// v1/v2 downloads stream straight to the final file and have nothing to
/// resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResumeState {
    pub local_path: Utf8PathBuf,
    pub remote_path: String,
    pub total_size: u64,
    pub downloaded_bytes: u64,
    pub created_at: SystemTime,
    pub last_update: SystemTime,
    pub storage_type: StorageKind,
    /// Fixed for the resume lifetime (spec §3 invariant: "chunk size never
    /// changes across a resume").
    pub chunk_size: u64,
    /// Sorted (spec §3).
    pub completed_chunks: Vec<u64>,
}

impl DownloadResumeState {
    pub fn matches_invocation(&self, local_path: &Utf8PathBuf, remote_path: &str, storage_type: StorageKind, chunk_size: u64) -> bool {
        self.local_path == *local_path
            && self.remote_path == remote_path
            && self.storage_type == storage_type
            && self.chunk_size == chunk_size
    }

    /// Missing chunks are the set difference of `[0, total_chunks)` and
    /// `completed_chunks` (spec §3).
    pub fn missing_chunks(&self, total_chunks: u64) -> Vec<u64> {
        let mut missing = Vec::new();
        let mut completed = self.completed_chunks.iter().copied().peekable();
        for index in 0..total_chunks {
            while completed.peek().is_some_and(|&c| c < index) {
                completed.next();
            }
            if completed.peek() != Some(&index) {
                missing.push(index);
            }
        }
        missing
    }

    pub fn mark_completed(&mut self, chunk_index: u64) {
        if let Err(pos) = self.completed_chunks.binary_search(&chunk_index) {
            self.completed_chunks.insert(pos, chunk_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(completed: Vec<u64>) -> DownloadResumeState {
        DownloadResumeState {
            local_path: "/tmp/x".into(),
            remote_path: "x".into(),
            total_size: 100,
            downloaded_bytes: 0,
            created_at: SystemTime::now(),
            last_update: SystemTime::now(),
            storage_type: StorageKind::S3Storage,
            chunk_size: 10,
            completed_chunks: completed,
        }
    }

    #[test]
    fn missing_chunks_is_set_difference() {
        let s = state(vec![0, 2, 4]);
        assert_eq!(s.missing_chunks(5), vec![1, 3]);
    }

    #[test]
    fn mark_completed_keeps_sorted_order() {
        let mut s = state(vec![0, 2]);
        s.mark_completed(1);
        assert_eq!(s.completed_chunks, vec![0, 1, 2]);
    }
}
