use crate::CryptoError;
use std::collections::HashMap;

/// Which of the three wire formats an object was written with.
///
/// Detection order (§4.5): `formatversion == "1"` -> v1; else
/// `streamingformat == "cbc"` -> v2; else v0. Metadata keys are stored
/// lower-cased by every backend and must be read lower-cased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V0Legacy,
    V1Hkdf,
    V2Cbc,
}

impl FormatVersion {
    pub fn detect(metadata: &HashMap<String, String>) -> Self {
        if metadata.get("formatversion").map(String::as_str) == Some("1") {
            FormatVersion::V1Hkdf
        } else if metadata.get("streamingformat").map(String::as_str) == Some("cbc") {
            FormatVersion::V2Cbc
        } else {
            FormatVersion::V0Legacy
        }
    }
}

/// Parsed, format-specific fields pulled out of the raw object metadata map.
#[derive(Debug, Clone)]
pub enum ObjectMetadata {
    V0Legacy {
        iv: [u8; crate::IV_SIZE],
    },
    V1Hkdf {
        file_id: [u8; crate::FILE_ID_SIZE],
        part_size: u64,
    },
    V2Cbc {
        initial_iv: [u8; crate::IV_SIZE],
        /// Absent on objects written before the `partsize` key existed
        /// (Open Question #1 in DESIGN.md): the engine falls back to its
        /// own default part size in that case.
        part_size: Option<u64>,
    },
}

impl ObjectMetadata {
    pub fn parse(metadata: &HashMap<String, String>) -> Result<Self, CryptoError> {
        match FormatVersion::detect(metadata) {
            FormatVersion::V0Legacy => {
                let iv = decode_iv(metadata)?;
                Ok(ObjectMetadata::V0Legacy { iv })
            }
            FormatVersion::V1Hkdf => {
                let file_id_b64 = metadata
                    .get("fileid")
                    .ok_or(CryptoError::MissingMetadata("fileid"))?;
                let file_id_bytes = base64::Engine::decode(
                    &base64::engine::general_purpose::STANDARD,
                    file_id_b64,
                )
                .map_err(|_| CryptoError::InvalidKeyMaterial)?;
                let file_id: [u8; crate::FILE_ID_SIZE] = file_id_bytes
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyMaterial)?;
                let part_size = metadata
                    .get("partsize")
                    .ok_or(CryptoError::MissingMetadata("partsize"))?
                    .parse()
                    .map_err(|_| CryptoError::Padding("bad partsize".into()))?;
                Ok(ObjectMetadata::V1Hkdf { file_id, part_size })
            }
            FormatVersion::V2Cbc => {
                let initial_iv = decode_iv(metadata)?;
                let part_size = metadata.get("partsize").and_then(|s| s.parse().ok());
                Ok(ObjectMetadata::V2Cbc {
                    initial_iv,
                    part_size,
                })
            }
        }
    }
}

fn decode_iv(metadata: &HashMap<String, String>) -> Result<[u8; crate::IV_SIZE], CryptoError> {
    let iv_b64 = metadata.get("iv").ok_or(CryptoError::MissingMetadata("iv"))?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, iv_b64)
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyMaterial)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn detects_v1_over_v2_when_both_present() {
        let m = meta(&[("formatversion", "1"), ("streamingformat", "cbc")]);
        assert_eq!(FormatVersion::detect(&m), FormatVersion::V1Hkdf);
    }

    #[test]
    fn detects_v2() {
        let m = meta(&[("streamingformat", "cbc")]);
        assert_eq!(FormatVersion::detect(&m), FormatVersion::V2Cbc);
    }

    #[test]
    fn falls_back_to_v0_legacy() {
        let m = meta(&[("iv", "AAAAAAAAAAAAAAAAAAAAAA==")]);
        assert_eq!(FormatVersion::detect(&m), FormatVersion::V0Legacy);
    }

    #[test]
    fn v2_without_partsize_parses_with_none() {
        use base64::Engine;
        let iv = base64::engine::general_purpose::STANDARD.encode([7u8; 16]);
        let m = meta(&[("streamingformat", "cbc"), ("iv", &iv)]);
        match ObjectMetadata::parse(&m).unwrap() {
            ObjectMetadata::V2Cbc { part_size, .. } => assert_eq!(part_size, None),
            _ => panic!("expected v2"),
        }
    }
}
