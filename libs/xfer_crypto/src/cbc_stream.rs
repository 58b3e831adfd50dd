//! Format v2: a single random key and initial IV, CBC-chained across
//! parts. Part *i* is encrypted with IV = the last ciphertext block of
//! part *i*-1 (the initial IV for part 0). Only the final part carries
//! PKCS#7 padding; every earlier part's plaintext must already be a
//! multiple of the AES block size — callers (the transfer orchestrator)
//! enforce this by choosing part sizes in multiples of 16.
//!
//! Encryption and decryption are both strictly sequential: this is
//! intrinsic to CBC chaining, not incidental (spec §9).

use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};

use crate::{CryptoError, IV_SIZE, KEY_SIZE};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// Sequential CBC-chained encryptor. Retains `current_iv` between calls
/// so it can resume an interrupted upload given `(key, initial_iv,
/// current_iv)` recovered from the orchestrator's persisted resume state.
pub struct CbcChainEncryptor {
    key: [u8; KEY_SIZE],
    current_iv: [u8; IV_SIZE],
}

impl CbcChainEncryptor {
    pub fn new(key: [u8; KEY_SIZE], initial_iv: [u8; IV_SIZE]) -> Self {
        Self {
            key,
            current_iv: initial_iv,
        }
    }

    /// Resume encryption mid-stream: `current_iv` is the chaining state
    /// left over from the last successfully encrypted part.
    pub fn resume(key: [u8; KEY_SIZE], current_iv: [u8; IV_SIZE]) -> Self {
        Self { key, current_iv }
    }

    pub fn current_iv(&self) -> [u8; IV_SIZE] {
        self.current_iv
    }

    /// Encrypt one part. `is_final` controls PKCS#7 padding; non-final
    /// plaintext lengths that aren't a multiple of 16 are a caller bug
    /// (the orchestrator is responsible for choosing aligned part sizes)
    /// and are rejected rather than silently padded.
    pub fn encrypt_part(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.current_iv.into());
        let ciphertext = if is_final {
            cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        } else {
            if plaintext.len() % 16 != 0 {
                return Err(CryptoError::NotBlockAligned(plaintext.len()));
            }
            cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext)
        };

        if let Some(last_block) = last_block(&ciphertext) {
            self.current_iv = last_block;
        }
        Ok(ciphertext)
    }
}

/// Sequential CBC-chained decryptor, matching [`CbcChainEncryptor`].
pub struct CbcChainDecryptor {
    key: [u8; KEY_SIZE],
    current_iv: [u8; IV_SIZE],
}

impl CbcChainDecryptor {
    pub fn new(key: [u8; KEY_SIZE], initial_iv: [u8; IV_SIZE]) -> Self {
        Self {
            key,
            current_iv: initial_iv,
        }
    }

    pub fn decrypt_part(&mut self, ciphertext: &[u8], is_final: bool) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() % 16 != 0 {
            return Err(CryptoError::NotBlockAligned(ciphertext.len()));
        }
        let next_iv = last_block(ciphertext);

        let cipher = Aes256CbcDec::new(&self.key.into(), &self.current_iv.into());
        let plaintext = if is_final {
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| CryptoError::Padding(e.to_string()))?
        } else {
            cipher
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|e| CryptoError::Padding(e.to_string()))?
        };

        if let Some(iv) = next_iv {
            self.current_iv = iv;
        }
        Ok(plaintext)
    }
}

fn last_block(data: &[u8]) -> Option<[u8; IV_SIZE]> {
    if data.len() < IV_SIZE {
        return None;
    }
    let mut block = [0u8; IV_SIZE];
    block.copy_from_slice(&data[data.len() - IV_SIZE..]);
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{random_initial_iv, random_master_key};

    #[test]
    fn round_trips_multi_part_stream() {
        let key = random_master_key();
        let iv = random_initial_iv();

        // Part 0 and 1 are block-aligned, part 2 is the final (padded) part.
        let part0 = vec![1u8; 32];
        let part1 = vec![2u8; 48];
        let part2 = vec![3u8; 17]; // not block-aligned: only allowed as final

        let mut enc = CbcChainEncryptor::new(key, iv);
        let c0 = enc.encrypt_part(&part0, false).unwrap();
        let c1 = enc.encrypt_part(&part1, false).unwrap();
        let c2 = enc.encrypt_part(&part2, true).unwrap();

        assert_eq!(c0.len() % 16, 0);
        assert_eq!(c1.len() % 16, 0);

        let mut dec = CbcChainDecryptor::new(key, iv);
        let p0 = dec.decrypt_part(&c0, false).unwrap();
        let p1 = dec.decrypt_part(&c1, false).unwrap();
        let p2 = dec.decrypt_part(&c2, true).unwrap();

        assert_eq!(p0, part0);
        assert_eq!(p1, part1);
        assert_eq!(p2, part2);
    }

    #[test]
    fn non_final_non_aligned_part_is_rejected() {
        let mut enc = CbcChainEncryptor::new(random_master_key(), random_initial_iv());
        let err = enc.encrypt_part(&[0u8; 15], false).unwrap_err();
        assert!(matches!(err, CryptoError::NotBlockAligned(15)));
    }

    #[test]
    fn resume_from_current_iv_matches_uninterrupted_run() {
        let key = random_master_key();
        let iv = random_initial_iv();
        let part0 = vec![9u8; 16];
        let part1 = vec![8u8; 16];

        let mut full = CbcChainEncryptor::new(key, iv);
        let full_c0 = full.encrypt_part(&part0, false).unwrap();
        let full_c1 = full.encrypt_part(&part1, true).unwrap();

        let mut first_half = CbcChainEncryptor::new(key, iv);
        let resumed_c0 = first_half.encrypt_part(&part0, false).unwrap();
        assert_eq!(resumed_c0, full_c0);

        let mut resumed = CbcChainEncryptor::resume(key, first_half.current_iv());
        let resumed_c1 = resumed.encrypt_part(&part1, true).unwrap();
        assert_eq!(resumed_c1, full_c1);
    }
}
