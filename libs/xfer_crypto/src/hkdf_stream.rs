//! Format v1: a 32-byte master key and per-file random ID stored
//! out-of-band; for part index *i* a part key and IV are HKDF-derived
//! from `(master_key, file_id, i)`. Every part is independently padded
//! and encrypted, so decryption is independently parallelizable — unlike
//! v2. This client no longer produces v1 uploads (Open Question #2 in
//! DESIGN.md); downloads of existing v1 objects remain supported.

use aes::Aes256;
use cbc::Decryptor;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{CryptoError, FILE_ID_SIZE, IV_SIZE, KEY_SIZE};

/// Derive the per-part key and IV for HKDF part `index` from `master_key`
/// and `file_id`. The info string binds the derivation to this file and
/// part so two files (or two parts of the same file) never collide.
pub fn derive_part_key_iv(
    master_key: &[u8; KEY_SIZE],
    file_id: &[u8; FILE_ID_SIZE],
    index: u64,
) -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
    let hk = Hkdf::<Sha256>::new(Some(file_id), master_key);
    let mut okm = [0u8; KEY_SIZE + IV_SIZE];
    let info = index.to_be_bytes();
    hk.expand(&info, &mut okm)
        .expect("okm length is within HKDF-SHA256's 255*32 byte limit");

    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);
    iv.copy_from_slice(&okm[KEY_SIZE..]);
    (key, iv)
}

/// Stateless, per-part decryptor: every part is independently keyed, so
/// this can be invoked concurrently from multiple download workers.
pub struct HkdfPartDecryptor {
    master_key: [u8; KEY_SIZE],
    file_id: [u8; FILE_ID_SIZE],
}

impl HkdfPartDecryptor {
    pub fn new(master_key: [u8; KEY_SIZE], file_id: [u8; FILE_ID_SIZE]) -> Self {
        Self {
            master_key,
            file_id,
        }
    }

    pub fn decrypt_part(&self, index: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (key, iv) = derive_part_key_iv(&self.master_key, &self.file_id, index);
        Decryptor::<Aes256>::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| CryptoError::Padding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{random_file_id, random_master_key};
    use aes::Aes256;
    use cbc::Encryptor;
    use cipher::BlockEncryptMut;

    #[test]
    fn parts_are_independently_decryptable_in_any_order() {
        let master_key = random_master_key();
        let file_id = random_file_id();

        let parts_plain: Vec<Vec<u8>> = vec![vec![1u8; 100], vec![2u8; 250], vec![3u8; 9]];
        let mut ciphertexts = Vec::new();
        for (i, plain) in parts_plain.iter().enumerate() {
            let (key, iv) = derive_part_key_iv(&master_key, &file_id, i as u64);
            let ct = Encryptor::<Aes256>::new(&key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plain);
            ciphertexts.push(ct);
        }

        let decryptor = HkdfPartDecryptor::new(master_key, file_id);
        // Decrypt out of order to prove independence.
        let p2 = decryptor.decrypt_part(2, &ciphertexts[2]).unwrap();
        let p0 = decryptor.decrypt_part(0, &ciphertexts[0]).unwrap();
        let p1 = decryptor.decrypt_part(1, &ciphertexts[1]).unwrap();

        assert_eq!(p0, parts_plain[0]);
        assert_eq!(p1, parts_plain[1]);
        assert_eq!(p2, parts_plain[2]);
    }

    #[test]
    fn different_part_indices_derive_different_keys() {
        let master_key = random_master_key();
        let file_id = random_file_id();
        let (k0, iv0) = derive_part_key_iv(&master_key, &file_id, 0);
        let (k1, iv1) = derive_part_key_iv(&master_key, &file_id, 1);
        assert_ne!(k0, k1);
        assert_ne!(iv0, iv1);
    }
}
