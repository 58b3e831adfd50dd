//! Streaming encryption layer (C6).
//!
//! Three on-the-wire formats coexist (see spec §4.5):
//!
//! * [`format::FormatVersion::V0Legacy`] — whole-file AES-256-CBC, PKCS#7 padded.
//! * [`format::FormatVersion::V1Hkdf`] — legacy streaming, independently
//!   HKDF-keyed parts (parallel decrypt only, no longer produced).
//! * [`format::FormatVersion::V2Cbc`] — current streaming format, CBC
//!   chained across parts (sequential encrypt and decrypt).
//!
//! Key and IV generation is centralised in [`keys`] so every format uses
//! the same CSPRNG path.

mod cbc_stream;
mod format;
mod hkdf_stream;
mod keys;
mod legacy;

pub use cbc_stream::{CbcChainDecryptor, CbcChainEncryptor};
pub use format::{FormatVersion, ObjectMetadata};
pub use hkdf_stream::{derive_part_key_iv, HkdfPartDecryptor};
pub use keys::{random_file_id, random_initial_iv, random_master_key};
pub use legacy::{decrypt_whole_file, encrypt_whole_file};

pub const KEY_SIZE: usize = xfer_utils::AES_256_KEY_SIZE;
pub const IV_SIZE: usize = xfer_utils::AES_BLOCK_SIZE;
pub const FILE_ID_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext part is not a multiple of the AES block size (got {0} bytes)")]
    NotBlockAligned(usize),
    #[error("padding error: {0}")]
    Padding(String),
    #[error("missing required metadata key {0:?}")]
    MissingMetadata(&'static str),
    #[error("unrecognized streaming format metadata")]
    UnknownFormat,
    #[error("invalid key or IV length")]
    InvalidKeyMaterial,
}
