//! Transfer orchestrator (C8, spec §4.7): the top-level crate that wires
//! the backend client (C7), streaming crypto (C6), resource manager (C5)
//! and rate limiter (C2/C3) into the upload and download state machines,
//! plus the resume store (C9) and the external adapter traits consumed
//! from outside the core (C10).

pub mod adapters;
mod buffer_pool;
pub mod download;
mod error_slot;
pub mod resume;
#[cfg(test)]
mod test_support;
pub mod types;
pub mod upload;

pub use adapters::{ApiClient, ApiClientCredentialsSource, ProgressFractionCallback, StatusSink};
pub use download::DownloadOrchestrator;
pub use resume::{DownloadResumeState, RecordedPart, ResumeStore, UploadResumeState};
pub use types::{CloudFile, CloudFileRequest, DownloadOptions, PartResult, StorageInfo, UploadOptions, UploadOutcome};
pub use upload::UploadOrchestrator;
