//! Format v0: the entire plaintext is PKCS#7-padded and encrypted with a
//! single random key and IV. Decryption requires the whole ciphertext to
//! be on disk (no streaming), which is why the download orchestrator
//! stages it through a `.encrypted` temp file before decrypting in place.

use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::{CryptoError, IV_SIZE, KEY_SIZE};

pub fn encrypt_whole_file(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Encryptor::<Aes256>::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt_whole_file(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Decryptor::<Aes256>::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Padding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{random_initial_iv, random_master_key};

    #[test]
    fn round_trips_arbitrary_length_plaintext() {
        let key = random_master_key();
        let iv = random_initial_iv();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plaintext = vec![0xAB; len];
            let ciphertext = encrypt_whole_file(&key, &iv, &plaintext);
            let decrypted = decrypt_whole_file(&key, &iv, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext, "roundtrip failed for len {len}");
        }
    }

    #[test]
    fn wrong_key_fails_to_unpad() {
        let key = random_master_key();
        let other_key = random_master_key();
        let iv = random_initial_iv();
        let ciphertext = encrypt_whole_file(&key, &iv, b"some plaintext data");
        assert!(decrypt_whole_file(&other_key, &iv, &ciphertext).is_err());
    }
}
