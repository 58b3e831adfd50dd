//! Per-backend configuration (expansion: spec §1 ambient config stack),
//! shaped after the teacher's `RemoteStorageConfig`/`S3Config`/
//! `AzureConfig` (`remote_storage::lib`): a `serde`/`toml_edit`-parseable
//! struct per backend plus a small aggregating `EngineConfig`.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 100;

fn default_concurrency_limit() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_CONCURRENCY_LIMIT).unwrap()
}

fn default_timeout() -> Duration {
    xfer_utils::DEFAULT_PART_UPLOAD_TIMEOUT
}

/// S3-compatible bucket coordinates. Credentials are never stored here —
/// they come from [`xfer_credentials::CredentialManager`] at request
/// time and are rotated independently of this static config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,
    pub bucket_region: String,
    pub prefix_in_bucket: Option<String>,
    /// Overrides the region-derived endpoint; needed for S3-compatible
    /// (non-AWS) backends.
    pub endpoint: Option<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub request_timeout: Duration,
}

/// Azure container coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureConfig {
    pub container_name: String,
    pub storage_account: Option<String>,
    pub container_region: String,
    pub prefix_in_container: Option<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    S3(S3Config),
    Azure(AzureConfig),
}

/// Aggregates the backend config plus the knobs that are genuinely
/// runtime-configurable by the embedder: the product name (used to
/// namespace the coordinator's socket/PID-file paths, spec §6) and a
/// local-fs override root, used by tests and by any caller that wants
/// resume-state files rooted somewhere other than alongside the source
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub app_name: String,
    pub storage: StorageConfig,
    pub resume_state_dir: Option<Utf8PathBuf>,
    pub aggressive_resource_scaling: bool,
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let document = text.parse::<toml_edit::Document>()?;
        Ok(toml_edit::de::from_document(document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3_engine_config() {
        let toml = r#"
            app_name = "acme-client"
            aggressive_resource_scaling = true

            [storage]
            kind = "s3"
            bucket_name = "my-bucket"
            bucket_region = "us-east-1"
        "#;
        let config = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(config.app_name, "acme-client");
        match config.storage {
            StorageConfig::S3(s3) => assert_eq!(s3.bucket_name, "my-bucket"),
            StorageConfig::Azure(_) => panic!("expected s3"),
        }
    }
}
