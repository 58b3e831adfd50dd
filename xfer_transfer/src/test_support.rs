//! In-memory [`StorageBackend`] used by this crate's own tests. Mirrors the
//! teacher's `MaybeEnabledStorage` split (real-backend tests skip when
//! credentials aren't configured; the local-fake-backed ones always run) —
//! see `libs/remote_storage/tests/` in the teacher tree. Not built outside
//! `#[cfg(test)]`.

#![cfg(test)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use xfer_storage::{BoxedAsyncRead, MultipartHandle, ObjectHead, StorageBackend, UploadedPart};
use xfer_utils::TransferError;

struct MultipartState {
    remote_path: String,
    metadata: HashMap<String, String>,
    parts: Vec<(u32, Bytes)>,
}

#[derive(Default)]
pub struct FakeBackend {
    objects: Mutex<HashMap<String, (Vec<u8>, HashMap<String, String>)>>,
    multiparts: Mutex<HashMap<String, MultipartState>>,
    next_upload_id: Mutex<u64>,
    /// Every `storage_id` this backend was asked to scope itself to, in
    /// call order, so cross-storage-download tests can assert on it.
    file_info_calls: Mutex<Vec<Option<String>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, remote_path: &str, bytes: Vec<u8>, metadata: HashMap<String, String>) {
        self.objects.lock().insert(remote_path.to_string(), (bytes, metadata));
    }

    pub fn file_info_calls(&self) -> Vec<Option<String>> {
        self.file_info_calls.lock().clone()
    }
}

#[async_trait]
impl StorageBackend for FakeBackend {
    async fn ensure_fresh_credentials(&self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn set_file_info(&self, storage_id: Option<&str>) -> Result<(), TransferError> {
        self.file_info_calls.lock().push(storage_id.map(str::to_string));
        Ok(())
    }

    async fn head_object(&self, remote_path: &str) -> Result<ObjectHead, TransferError> {
        let objects = self.objects.lock();
        let (bytes, metadata) = objects
            .get(remote_path)
            .ok_or_else(|| TransferError::Other(anyhow::anyhow!("no such object: {remote_path}")))?;
        Ok(ObjectHead { size: bytes.len() as u64, metadata: metadata.clone() })
    }

    async fn get_object_range(&self, remote_path: &str, start: u64, end: u64) -> Result<BoxedAsyncRead, TransferError> {
        let objects = self.objects.lock();
        let (bytes, _) = objects
            .get(remote_path)
            .ok_or_else(|| TransferError::Other(anyhow::anyhow!("no such object: {remote_path}")))?;
        let start = start as usize;
        let end = (end as usize + 1).min(bytes.len());
        let slice = bytes[start..end].to_vec();
        Ok(Box::pin(std::io::Cursor::new(slice)))
    }

    async fn create_multipart_upload(&self, remote_path: &str, metadata: HashMap<String, String>) -> Result<MultipartHandle, TransferError> {
        let mut next_id = self.next_upload_id.lock();
        *next_id += 1;
        let upload_id = format!("fake-upload-{next_id}");
        self.multiparts
            .lock()
            .insert(upload_id.clone(), MultipartState { remote_path: remote_path.to_string(), metadata, parts: Vec::new() });
        Ok(MultipartHandle { remote_path: remote_path.to_string(), upload_id })
    }

    async fn upload_part(&self, handle: &MultipartHandle, part_number: u32, bytes: Bytes) -> Result<UploadedPart, TransferError> {
        let mut multiparts = self.multiparts.lock();
        let state = multiparts
            .get_mut(&handle.upload_id)
            .ok_or_else(|| TransferError::Other(anyhow::anyhow!("no such multipart upload: {}", handle.upload_id)))?;
        let size = bytes.len() as u64;
        state.parts.retain(|(n, _)| *n != part_number);
        state.parts.push((part_number, bytes));
        Ok(UploadedPart { part_number, e_tag: format!("etag-{part_number}"), size })
    }

    async fn complete_multipart_upload(&self, handle: &MultipartHandle, parts: Vec<UploadedPart>) -> Result<(), TransferError> {
        let mut multiparts = self.multiparts.lock();
        let state = multiparts
            .remove(&handle.upload_id)
            .ok_or_else(|| TransferError::Other(anyhow::anyhow!("no such multipart upload: {}", handle.upload_id)))?;
        let mut by_part: HashMap<u32, Bytes> = state.parts.into_iter().collect();
        let mut assembled = Vec::new();
        for part in &parts {
            let bytes = by_part
                .remove(&part.part_number)
                .ok_or_else(|| TransferError::Other(anyhow::anyhow!("missing part {}", part.part_number)))?;
            assembled.extend_from_slice(&bytes);
        }
        self.objects.lock().insert(state.remote_path, (assembled, state.metadata));
        Ok(())
    }

    async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> Result<(), TransferError> {
        self.multiparts.lock().remove(&handle.upload_id);
        Ok(())
    }

    async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<UploadedPart>, TransferError> {
        let multiparts = self.multiparts.lock();
        let state = multiparts
            .get(&handle.upload_id)
            .ok_or_else(|| TransferError::Other(anyhow::anyhow!("no such multipart upload: {}", handle.upload_id)))?;
        Ok(state
            .parts
            .iter()
            .map(|(part_number, bytes)| UploadedPart { part_number: *part_number, e_tag: format!("etag-{part_number}"), size: bytes.len() as u64 })
            .collect())
    }
}
