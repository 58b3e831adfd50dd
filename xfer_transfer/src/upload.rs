//! Upload state machine (C8, spec §4.7).
//!
//! Pipeline shape follows the teacher's consumer pattern for
//! `RemoteStorage::upload` (`libs/remote_storage/src/lib.rs`) generalised
//! into a full producer/encryptor/uploader pipeline: one producer reads
//! plaintext parts, a single sequential stage CBC-chain-encrypts them
//! (parallel encryption is intrinsically wrong for this format, spec §9),
//! and a worker pool picks up ciphertext parts from a bounded channel and
//! PUTs them, mirroring the teacher's semaphore-gated concurrency idiom.

use crate::adapters::ProgressFractionCallback;
use crate::buffer_pool::BufferPool;
use crate::error_slot::ErrorSlot;
use crate::resume::{RecordedPart, ResumeStore, UploadResumeState};
use crate::types::{object_layout_path, object_layout_prefix, random_suffix, UploadOptions, UploadOutcome};
use base64::Engine as _;
use bytes::Bytes;
use camino::Utf8Path;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use xfer_credentials::StorageKind;
use xfer_crypto::{CbcChainEncryptor, FormatVersion};
use xfer_resources::{ResourceManager, ThroughputMonitor};
use xfer_storage::{retry_with_backoff, MultipartHandle, ProgressReader, ProgressSink, RetryHooks, StorageBackend, UploadedPart};
use xfer_utils::{resume_persist_every, TransferError};

/// Feeds [`ProgressReader`] deltas straight into the upload ticker's
/// running total, so a part's progress advances as its ciphertext is
/// read rather than jumping by the whole part size on completion (spec
/// §4.7 step 4: "the progress reader provides finer-grained updates
/// during a single part").
struct AtomicProgressSink(Arc<AtomicU64>);

impl ProgressSink for AtomicProgressSink {
    fn report(&self, delta: i64) {
        if delta >= 0 {
            self.0.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.0.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }
}

struct RawPart {
    index: u64,
    bytes: Vec<u8>,
    is_final: bool,
}

struct EncryptedPart {
    part_index: u64,
    part_number: u32,
    ciphertext: Bytes,
    plain_len: u64,
    current_iv: [u8; 16],
}

struct CompletedPart {
    part_index: u64,
    part: UploadedPart,
    current_iv: [u8; 16],
}

/// Bridges the backend's retry loop to credential refresh and rate-limit
/// cooldown without `xfer_storage` depending on either directly.
struct UploadRetryHooks {
    backend: Arc<dyn StorageBackend>,
    rate_limiter: Option<Arc<xfer_ratelimit::RateLimiter>>,
}

#[async_trait::async_trait]
impl RetryHooks for UploadRetryHooks {
    async fn refresh_credentials(&self) -> anyhow::Result<()> {
        self.backend.ensure_fresh_credentials().await.map_err(Into::into)
    }

    async fn on_rate_limited(&self, retry_after: Option<std::time::Duration>) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.drain().await;
            limiter.set_cooldown(retry_after.unwrap_or(std::time::Duration::from_secs(1))).await;
        }
    }
}

/// Resumed or freshly-initialised state the pipeline starts from.
struct StartState {
    handle: MultipartHandle,
    master_key: [u8; 32],
    initial_iv: [u8; 16],
    encryptor: CbcChainEncryptor,
    random_suffix: String,
    start_index: u64,
    recorded_parts: Vec<RecordedPart>,
}

pub struct UploadOrchestrator {
    backend: Arc<dyn StorageBackend>,
    storage_type: StorageKind,
    resources: Arc<ResourceManager>,
    resume_store: Arc<ResumeStore>,
    rate_limiter: Option<Arc<xfer_ratelimit::RateLimiter>>,
}

impl UploadOrchestrator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        storage_type: StorageKind,
        resources: Arc<ResourceManager>,
        resume_store: Arc<ResumeStore>,
        rate_limiter: Option<Arc<xfer_ratelimit::RateLimiter>>,
    ) -> Self {
        Self { backend, storage_type, resources, resume_store, rate_limiter }
    }

    pub async fn upload(
        &self,
        local_path: &Utf8Path,
        options: UploadOptions,
        progress: Option<ProgressFractionCallback>,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        xfer_metrics::TRANSFERS_ACTIVE.inc();
        let result = self.upload_inner(local_path, options, progress, cancel).await;
        xfer_metrics::TRANSFERS_ACTIVE.dec();
        result
    }

    async fn upload_inner(
        &self,
        local_path: &Utf8Path,
        options: UploadOptions,
        progress: Option<ProgressFractionCallback>,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        let _lock = self.resume_store.acquire_lock(local_path).await?;

        let metadata = tokio::fs::metadata(local_path).await.map_err(|e| TransferError::Other(e.into()))?;
        let total_size = metadata.len();

        self.backend.ensure_fresh_credentials().await?;

        let alloc = self.resources.allocate(total_size, options.aggressive_resource_scaling);
        let part_size = xfer_resources::dynamic_part_size(total_size, alloc.threads);
        let total_parts = total_size.div_ceil(part_size.max(1)).max(1);

        tracing::info!(%local_path, total_size, part_size, total_parts, threads = alloc.threads, "upload: init");

        let existing = self.resume_store.load_upload_state(local_path).await;
        let start = match self.try_resume(local_path, existing).await {
            Some(resumed) => resumed,
            None => self.init_fresh(local_path, part_size).await?,
        };
        let StartState { handle, master_key, initial_iv, encryptor, random_suffix: random_suffix_val, start_index, recorded_parts } = start;

        let uploaded_bytes_initial: u64 = recorded_parts.iter().map(|p| p.size).sum();
        let pool = Arc::new(BufferPool::new(part_size as usize, alloc.threads * 2));
        let error_slot = Arc::new(ErrorSlot::new());

        let (raw_tx, raw_rx) = mpsc::channel::<RawPart>(alloc.threads * 2);
        let (enc_tx, enc_rx) = mpsc::channel::<EncryptedPart>(alloc.threads * 2);
        let (result_tx, mut result_rx) = mpsc::channel::<Result<CompletedPart, TransferError>>(total_parts as usize + 1);

        let producer = tokio::spawn(Self::producer_task(
            local_path.to_path_buf(),
            part_size,
            total_size,
            total_parts,
            start_index,
            Arc::clone(&pool),
            raw_tx,
            cancel.clone(),
        ));

        let encrypt_handle = tokio::spawn(Self::encrypt_stage(encryptor, raw_rx, enc_tx, Arc::clone(&pool), Arc::clone(&error_slot), cancel.clone()));

        let enc_rx = Arc::new(tokio::sync::Mutex::new(enc_rx));
        let retry_hooks = Arc::new(UploadRetryHooks { backend: Arc::clone(&self.backend), rate_limiter: self.rate_limiter.clone() });
        let uploaded_total = Arc::new(AtomicU64::new(uploaded_bytes_initial));
        let mut worker_handles = Vec::with_capacity(alloc.threads);
        let never_stop = CancellationToken::new();
        for _ in 0..alloc.threads {
            worker_handles.push(tokio::spawn(Self::upload_worker(
                Arc::clone(&self.backend),
                handle.clone(),
                Arc::clone(&enc_rx),
                result_tx.clone(),
                Arc::clone(&retry_hooks),
                Arc::clone(&uploaded_total),
                cancel.clone(),
                never_stop.clone(),
            )));
        }
        let result_tx_for_scaler = result_tx.clone();
        drop(result_tx);

        let ticker_cancel = cancel.clone();
        let ticker_progress = progress.clone();
        let ticker_total = Arc::clone(&uploaded_total);
        let extra_workers: Arc<tokio::sync::Mutex<Vec<(CancellationToken, tokio::task::JoinHandle<()>)>>> =
            Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let scaler_backend = Arc::clone(&self.backend);
        let scaler_handle = handle.clone();
        let scaler_enc_rx = Arc::clone(&enc_rx);
        let scaler_result_tx_slot = result_tx_for_scaler.clone();
        let scaler_retry_hooks = Arc::clone(&retry_hooks);
        let scaler_uploaded_total = Arc::clone(&uploaded_total);
        let scaler_resources = Arc::clone(&self.resources);
        let scaler_extra = Arc::clone(&extra_workers);
        let scaler_cancel = cancel.clone();
        let max_extra = alloc.threads.max(1);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(xfer_utils::PROGRESS_TICK_INTERVAL);
            let mut monitor = ThroughputMonitor::new();
            let mut last_sample = (Instant::now(), ticker_total.load(Ordering::Relaxed));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let uploaded_now = ticker_total.load(Ordering::Relaxed);
                        if let Some(cb) = &ticker_progress {
                            let frac = if total_size == 0 { 1.0 } else {
                                uploaded_now as f64 / total_size as f64
                            };
                            cb(frac.min(1.0));
                        }

                        let (last_at, last_bytes) = last_sample;
                        let elapsed = last_at.elapsed().as_secs_f64();
                        if elapsed > 0.0 {
                            let bytes_per_sec = uploaded_now.saturating_sub(last_bytes) as f64 / elapsed;
                            monitor.record(bytes_per_sec);
                        }
                        last_sample = (Instant::now(), uploaded_now);

                        let mut extra = scaler_extra.lock().await;
                        if monitor.should_scale_up() && extra.len() < max_extra && scaler_resources.try_acquire_one() {
                            let stop = CancellationToken::new();
                            let task_handle = tokio::spawn(Self::upload_worker(
                                Arc::clone(&scaler_backend),
                                scaler_handle.clone(),
                                Arc::clone(&scaler_enc_rx),
                                scaler_result_tx_slot.clone(),
                                Arc::clone(&scaler_retry_hooks),
                                Arc::clone(&scaler_uploaded_total),
                                scaler_cancel.clone(),
                                stop.clone(),
                            ));
                            tracing::debug!(extra_workers = extra.len() + 1, "throughput monitor scaling up upload workers");
                            extra.push((stop, task_handle));
                        } else if monitor.should_scale_down() {
                            if let Some((stop, task_handle)) = extra.pop() {
                                tracing::debug!(extra_workers = extra.len(), "throughput monitor scaling down upload workers");
                                stop.cancel();
                                let _ = task_handle.await;
                                scaler_resources.release_one();
                            }
                        }
                    }
                    _ = ticker_cancel.cancelled() => return,
                }
            }
        });

        let mut by_index: BTreeMap<u64, CompletedPart> = recorded_parts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                (
                    i as u64,
                    CompletedPart {
                        part_index: i as u64,
                        part: UploadedPart { part_number: p.part_number, e_tag: p.e_tag.clone(), size: p.size },
                        current_iv: initial_iv,
                    },
                )
            })
            .collect();
        let mut persisted_contiguous = recorded_parts.len() as u64;
        let mut since_persist = 0usize;

        self.drain_results(
            &mut result_rx,
            &mut by_index,
            &mut persisted_contiguous,
            &mut since_persist,
            total_parts,
            &error_slot,
            &cancel,
            local_path,
            &handle,
            total_size,
            master_key,
            initial_iv,
            part_size,
            &random_suffix_val,
        )
        .await;

        ticker.abort();
        let _ = producer.await;
        let _ = encrypt_handle.await;
        for w in worker_handles {
            let _ = w.await;
        }
        for (_, w) in extra_workers.lock().await.drain(..) {
            let _ = w.await;
            self.resources.release_one();
        }

        if let Some(err) = error_slot.take() {
            tracing::warn!(%local_path, %err, "upload failed, aborting multipart upload but retaining resume state");
            let _ = self.backend.abort_multipart_upload(&handle).await;
            self.resources.release(alloc);
            return Err(err);
        }

        let mut all_parts: Vec<UploadedPart> = by_index.into_values().map(|c| c.part).collect();
        all_parts.sort_by_key(|p| p.part_number);

        retry_with_backoff("complete_multipart_upload", retry_hooks.as_ref(), || {
            let backend = Arc::clone(&self.backend);
            let handle = handle.clone();
            let parts = all_parts.clone();
            async move { backend.complete_multipart_upload(&handle, parts).await }
        })
        .await?;

        self.resume_store.delete_upload_state(local_path).await.map_err(TransferError::Other)?;
        self.resources.release(alloc);

        Ok(UploadOutcome {
            remote_path: handle.remote_path,
            key_b64: base64::engine::general_purpose::STANDARD.encode(master_key),
            iv_b64: base64::engine::general_purpose::STANDARD.encode(initial_iv),
            format_version: FormatVersion::V2Cbc,
            total_bytes: total_size,
        })
    }

    /// Consumes completed/failed parts as they arrive (out of order across
    /// workers, since `alloc.threads` workers race independent PUTs), keyed
    /// by each part's real 0-based index, and periodically persists the
    /// longest *contiguous-from-zero* prefix — only that prefix has a
    /// well-defined `current_iv` to resume from.
    #[allow(clippy::too_many_arguments)]
    async fn drain_results(
        &self,
        result_rx: &mut mpsc::Receiver<Result<CompletedPart, TransferError>>,
        by_index: &mut BTreeMap<u64, CompletedPart>,
        persisted_contiguous: &mut u64,
        since_persist: &mut usize,
        total_parts: u64,
        error_slot: &Arc<ErrorSlot>,
        cancel: &CancellationToken,
        local_path: &Utf8Path,
        handle: &MultipartHandle,
        total_size: u64,
        master_key: [u8; 32],
        initial_iv: [u8; 16],
        part_size: u64,
        random_suffix_val: &str,
    ) {
        while let Some(item) = result_rx.recv().await {
            match item {
                Ok(completed) => {
                    // `uploaded_total` is driven live by each worker's
                    // `ProgressReader` as ciphertext is read, not here, so a
                    // part's progress advances throughout the PUT instead of
                    // jumping by its whole size on completion.
                    by_index.insert(completed.part_index, completed);
                    *since_persist += 1;

                    let mut contiguous_len = *persisted_contiguous;
                    while by_index.contains_key(&contiguous_len) {
                        contiguous_len += 1;
                    }
                    if contiguous_len > *persisted_contiguous && *since_persist >= resume_persist_every(total_parts as usize) {
                        let last_iv = by_index.get(&(contiguous_len - 1)).map(|p| p.current_iv).unwrap_or(initial_iv);
                        let parts: Vec<RecordedPart> = (0..contiguous_len)
                            .map(|i| {
                                let p = &by_index[&i].part;
                                RecordedPart { part_number: p.part_number, e_tag: p.e_tag.clone(), size: p.size }
                            })
                            .collect();
                        let uploaded_bytes = parts.iter().map(|p| p.size).sum();
                        let state = UploadResumeState {
                            local_path: local_path.to_path_buf(),
                            object_key: handle.remote_path.clone(),
                            upload_id: handle.upload_id.clone(),
                            total_bytes: total_size,
                            original_bytes: total_size,
                            uploaded_bytes,
                            parts,
                            key_b64: base64::engine::general_purpose::STANDARD.encode(master_key),
                            initial_iv_b64: base64::engine::general_purpose::STANDARD.encode(initial_iv),
                            current_iv_b64: base64::engine::general_purpose::STANDARD.encode(last_iv),
                            part_size,
                            random_suffix: random_suffix_val.to_string(),
                            created_at: SystemTime::now(),
                            last_update: SystemTime::now(),
                            storage_type: self.storage_type,
                            owning_pid: std::process::id(),
                            lock_acquired_at: SystemTime::now(),
                        };
                        if let Err(err) = self.resume_store.save_upload_state(&state).await {
                            tracing::warn!(%err, "failed to persist upload resume state");
                        }
                        *persisted_contiguous = contiguous_len;
                        *since_persist = 0;
                    }
                }
                Err(err) => {
                    error_slot.set(cancel, err);
                }
            }
        }
    }

    async fn try_resume(&self, local_path: &Utf8Path, existing: Option<UploadResumeState>) -> Option<StartState> {
        let state = existing?;
        let expected_prefix = object_layout_prefix(&local_path.to_path_buf());
        if !state.matches_invocation(&local_path.to_path_buf(), &expected_prefix, self.storage_type) {
            xfer_metrics::RESUME_STATE_INVALID.inc();
            return None;
        }
        if !state.byte_counts_consistent() {
            xfer_metrics::RESUME_STATE_INVALID.inc();
            return None;
        }
        let handle = MultipartHandle { remote_path: state.object_key.clone(), upload_id: state.upload_id.clone() };
        if self.backend.list_parts(&handle).await.is_err() {
            xfer_metrics::RESUME_STATE_INVALID.inc();
            let _ = self.backend.abort_multipart_upload(&handle).await;
            return None;
        }

        let key: [u8; 32] = base64::engine::general_purpose::STANDARD.decode(&state.key_b64).ok()?.try_into().ok()?;
        let initial_iv: [u8; 16] = base64::engine::general_purpose::STANDARD.decode(&state.initial_iv_b64).ok()?.try_into().ok()?;
        let current_iv: [u8; 16] = base64::engine::general_purpose::STANDARD.decode(&state.current_iv_b64).ok()?.try_into().ok()?;
        let encryptor = CbcChainEncryptor::resume(key, current_iv);

        tracing::info!(%local_path, resumed_parts = state.parts.len(), "upload: resuming from persisted state");
        Some(StartState {
            handle,
            master_key: key,
            initial_iv,
            encryptor,
            random_suffix: state.random_suffix.clone(),
            start_index: state.next_part_index(),
            recorded_parts: state.parts.clone(),
        })
    }

    async fn init_fresh(&self, local_path: &Utf8Path, part_size: u64) -> Result<StartState, TransferError> {
        let master_key = xfer_crypto::random_master_key();
        let initial_iv = xfer_crypto::random_initial_iv();
        let suffix = random_suffix();
        let remote_path = object_layout_path(&local_path.to_path_buf(), &suffix);

        let mut metadata = HashMap::new();
        metadata.insert("iv".to_string(), base64::engine::general_purpose::STANDARD.encode(initial_iv));
        metadata.insert("streamingformat".to_string(), "cbc".to_string());
        metadata.insert("partsize".to_string(), part_size.to_string());

        let handle = self.backend.create_multipart_upload(&remote_path, metadata).await?;
        let encryptor = CbcChainEncryptor::new(master_key, initial_iv);
        Ok(StartState {
            handle,
            master_key,
            initial_iv,
            encryptor,
            random_suffix: suffix,
            start_index: 0,
            recorded_parts: Vec::new(),
        })
    }

    async fn producer_task(
        local_path: camino::Utf8PathBuf,
        part_size: u64,
        total_size: u64,
        total_parts: u64,
        start_index: u64,
        pool: Arc<BufferPool>,
        tx: mpsc::Sender<RawPart>,
        cancel: CancellationToken,
    ) {
        let mut file = match tokio::fs::File::open(&local_path).await {
            Ok(f) => f,
            Err(_) => return,
        };
        if start_index > 0 && file.seek(std::io::SeekFrom::Start(start_index * part_size)).await.is_err() {
            return;
        }
        for index in start_index..total_parts {
            let is_final = index + 1 == total_parts;
            let remaining = total_size.saturating_sub(index * part_size);
            let this_len = if is_final { remaining } else { part_size };
            let mut buf = pool.get();
            buf.resize(this_len as usize, 0);
            if file.read_exact(&mut buf).await.is_err() {
                return;
            }
            tokio::select! {
                res = tx.send(RawPart { index, bytes: buf, is_final }) => {
                    if res.is_err() { return; }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn encrypt_stage(
        mut encryptor: CbcChainEncryptor,
        mut rx: mpsc::Receiver<RawPart>,
        tx: mpsc::Sender<EncryptedPart>,
        pool: Arc<BufferPool>,
        error_slot: Arc<ErrorSlot>,
        cancel: CancellationToken,
    ) {
        while let Some(raw) = rx.recv().await {
            if cancel.is_cancelled() {
                return;
            }
            match encryptor.encrypt_part(&raw.bytes, raw.is_final) {
                Ok(ciphertext) => {
                    let plain_len = raw.bytes.len() as u64;
                    pool.put(raw.bytes);
                    let part_index = raw.index;
                    let part_number = (raw.index + 1) as u32;
                    let current_iv = encryptor.current_iv();
                    let sent = tx
                        .send(EncryptedPart { part_index, part_number, ciphertext: Bytes::from(ciphertext), plain_len, current_iv })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    error_slot.set(&cancel, TransferError::Protocol(err.to_string()));
                    return;
                }
            }
        }
    }

    /// Spawned both for the fixed base pool (`stop` never fires) and for
    /// extra workers the throughput-driven scaler adds mid-transfer
    /// (`stop` lets the scaler retire just that one worker without
    /// touching `cancel`, which aborts the whole upload).
    async fn upload_worker(
        backend: Arc<dyn StorageBackend>,
        handle: MultipartHandle,
        enc_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EncryptedPart>>>,
        result_tx: mpsc::Sender<Result<CompletedPart, TransferError>>,
        retry_hooks: Arc<UploadRetryHooks>,
        uploaded_total: Arc<AtomicU64>,
        cancel: CancellationToken,
        stop: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() || stop.is_cancelled() {
                return;
            }
            let job = {
                let mut rx = enc_rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { return };

            let part_index = job.part_index;
            let part_number = job.part_number;
            let plain_len = job.plain_len;
            let current_iv = job.current_iv;
            let ciphertext = job.ciphertext;
            // One `ProgressReader` per part, reused across every retry of
            // that part: each attempt rewinds it to the start first, which
            // reports the negative delta undoing whatever the previous
            // failed attempt had already flushed (spec §4.7 step 4, §9
            // testable property 5), then re-reads it to report progress as
            // the ciphertext is handed to the backend.
            let mut progress_reader = ProgressReader::new(ciphertext.clone(), AtomicProgressSink(Arc::clone(&uploaded_total)));
            let result = retry_with_backoff("upload_part", retry_hooks.as_ref(), || {
                use std::io::{Read, Seek, SeekFrom};
                let _ = progress_reader.seek(SeekFrom::Start(0));
                let mut buf = Vec::with_capacity(ciphertext.len());
                let read_result = progress_reader.read_to_end(&mut buf);
                let backend = Arc::clone(&backend);
                let handle = handle.clone();
                async move {
                    read_result.map_err(|e| TransferError::Other(e.into()))?;
                    backend.upload_part(&handle, part_number, bytes::Bytes::from(buf)).await
                }
            })
            .await;

            let outcome = match result {
                Ok(part) => {
                    xfer_metrics::PARTS_UPLOADED.inc();
                    xfer_metrics::BYTES_UPLOADED.inc_by(plain_len);
                    Ok(CompletedPart { part_index, part, current_iv })
                }
                Err(err) => Err(err),
            };
            if result_tx.send(outcome).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn uploads_small_file_and_cleans_up_resume_state() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("plain.bin");
        let content: Vec<u8> = (0..(10 * 1024 * 1024usize)).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&local_path, &content).await.unwrap();

        let backend: Arc<dyn StorageBackend> = Arc::new(FakeBackend::new());
        let resources = Arc::new(ResourceManager::new(4, 4 * 1024 * 1024 * 1024));
        let resume_store = Arc::new(ResumeStore::new(None));
        let orchestrator = UploadOrchestrator::new(backend, StorageKind::S3Storage, resources, Arc::clone(&resume_store), None);

        let outcome = orchestrator
            .upload(&local_path, UploadOptions::default(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.total_bytes, content.len() as u64);
        assert!(resume_store.load_upload_state(&local_path).await.is_none());
    }

    #[tokio::test]
    async fn rejects_resume_state_whose_object_key_belongs_to_a_different_local_path() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("foo.bin");
        let content: Vec<u8> = (0..(10 * 1024 * 1024usize)).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&local_path, &content).await.unwrap();

        let fake = Arc::new(FakeBackend::new());
        // A dangling multipart upload left over for an unrelated object key
        // (different basename) at the same local path's resume-state slot.
        let stale_handle = fake.create_multipart_upload("bar.bin-ZZZZZZZZZZZZZZZZZZZZZZ", HashMap::new()).await.unwrap();

        let resources = Arc::new(ResourceManager::new(4, 4 * 1024 * 1024 * 1024));
        let resume_store = Arc::new(ResumeStore::new(None));
        let poisoned = UploadResumeState {
            local_path: local_path.clone(),
            object_key: stale_handle.remote_path.clone(),
            upload_id: stale_handle.upload_id.clone(),
            total_bytes: content.len() as u64,
            original_bytes: content.len() as u64,
            uploaded_bytes: 0,
            parts: vec![],
            key_b64: base64::engine::general_purpose::STANDARD.encode(xfer_crypto::random_master_key()),
            initial_iv_b64: base64::engine::general_purpose::STANDARD.encode(xfer_crypto::random_initial_iv()),
            current_iv_b64: base64::engine::general_purpose::STANDARD.encode(xfer_crypto::random_initial_iv()),
            part_size: 32 * 1024 * 1024,
            random_suffix: "ZZZZZZZZZZZZZZZZZZZZZZ".into(),
            created_at: SystemTime::now(),
            last_update: SystemTime::now(),
            storage_type: StorageKind::S3Storage,
            owning_pid: std::process::id(),
            lock_acquired_at: SystemTime::now(),
        };
        resume_store.save_upload_state(&poisoned).await.unwrap();

        let backend: Arc<dyn StorageBackend> = fake;
        let orchestrator = UploadOrchestrator::new(backend, StorageKind::S3Storage, resources, Arc::clone(&resume_store), None);

        let outcome = orchestrator
            .upload(&local_path, UploadOptions::default(), None, CancellationToken::new())
            .await
            .unwrap();

        // A fresh upload was started under foo.bin's own prefix instead of
        // blindly resuming the unrelated bar.bin multipart upload.
        assert!(outcome.remote_path.starts_with("foo.bin-"), "{}", outcome.remote_path);
        assert_ne!(outcome.remote_path, poisoned.object_key);
    }

    /// Wraps `FakeBackend`, failing `upload_part` with a transient error the
    /// first `fail_times` calls for a given part before delegating — lets a
    /// test exercise the real retry-triggered rewind path instead of
    /// unit-testing `ProgressReader` in isolation.
    struct FlakyBackend {
        inner: Arc<FakeBackend>,
        fail_times: usize,
        attempts: std::sync::atomic::AtomicUsize,
        observed_part_lens: std::sync::Mutex<Vec<usize>>,
    }

    impl FlakyBackend {
        fn new(inner: Arc<FakeBackend>, fail_times: usize) -> Self {
            Self { inner, fail_times, attempts: std::sync::atomic::AtomicUsize::new(0), observed_part_lens: std::sync::Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl StorageBackend for FlakyBackend {
        async fn ensure_fresh_credentials(&self) -> Result<(), TransferError> {
            self.inner.ensure_fresh_credentials().await
        }

        async fn set_file_info(&self, storage_id: Option<&str>) -> Result<(), TransferError> {
            self.inner.set_file_info(storage_id).await
        }

        async fn head_object(&self, remote_path: &str) -> Result<xfer_storage::ObjectHead, TransferError> {
            self.inner.head_object(remote_path).await
        }

        async fn get_object_range(&self, remote_path: &str, start: u64, end: u64) -> Result<xfer_storage::BoxedAsyncRead, TransferError> {
            self.inner.get_object_range(remote_path, start, end).await
        }

        async fn create_multipart_upload(&self, remote_path: &str, metadata: HashMap<String, String>) -> Result<MultipartHandle, TransferError> {
            self.inner.create_multipart_upload(remote_path, metadata).await
        }

        async fn upload_part(&self, handle: &MultipartHandle, part_number: u32, bytes: Bytes) -> Result<UploadedPart, TransferError> {
            self.observed_part_lens.lock().unwrap().push(bytes.len());
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                return Err(TransferError::transient(anyhow::anyhow!("simulated transient upload_part failure")));
            }
            self.inner.upload_part(handle, part_number, bytes).await
        }

        async fn complete_multipart_upload(&self, handle: &MultipartHandle, parts: Vec<UploadedPart>) -> Result<(), TransferError> {
            self.inner.complete_multipart_upload(handle, parts).await
        }

        async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> Result<(), TransferError> {
            self.inner.abort_multipart_upload(handle).await
        }

        async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<UploadedPart>, TransferError> {
            self.inner.list_parts(handle).await
        }
    }

    #[tokio::test]
    async fn retried_part_upload_resends_the_same_ciphertext_after_rewind() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("plain.bin");
        let content: Vec<u8> = (0..(10 * 1024 * 1024usize)).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&local_path, &content).await.unwrap();

        let fake = Arc::new(FakeBackend::new());
        let flaky = Arc::new(FlakyBackend::new(Arc::clone(&fake), 1));
        let backend: Arc<dyn StorageBackend> = flaky.clone();
        let resources = Arc::new(ResourceManager::new(4, 4 * 1024 * 1024 * 1024));
        let resume_store = Arc::new(ResumeStore::new(None));
        let orchestrator = UploadOrchestrator::new(backend, StorageKind::S3Storage, resources, Arc::clone(&resume_store), None);

        let outcome = orchestrator
            .upload(&local_path, UploadOptions::default(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.total_bytes, content.len() as u64);

        // upload_part was retried (failed once, succeeded once) and the
        // ciphertext read back out of the rewound `ProgressReader` on the
        // successful attempt was the same length as the one that failed —
        // the rewind didn't leave the reader's position mid-buffer.
        let lens = flaky.observed_part_lens.lock().unwrap().clone();
        assert_eq!(lens.len(), 2, "expected exactly one failed attempt and one retry");
        assert_eq!(lens[0], lens[1], "retried attempt must resend the full part, not a partial read from mid-buffer");
    }

    #[test]
    fn atomic_progress_sink_nets_to_zero_across_a_rewind() {
        use std::io::{Read, Seek, SeekFrom};

        let total = Arc::new(AtomicU64::new(0));
        let data = bytes::Bytes::from(vec![5u8; 2 * 1024 * 1024]);
        let mut reader = ProgressReader::new(data.clone(), AtomicProgressSink(Arc::clone(&total)));

        let mut buf = Vec::with_capacity(data.len());
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(total.load(Ordering::Relaxed), data.len() as u64);

        // A retry rewinds before resending — progress must fall back to
        // zero rather than staying inflated by the failed attempt.
        reader.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 0);

        let mut buf2 = Vec::with_capacity(data.len());
        reader.read_to_end(&mut buf2).unwrap();
        assert_eq!(total.load(Ordering::Relaxed), data.len() as u64);
        assert_eq!(buf, buf2);
    }
}
