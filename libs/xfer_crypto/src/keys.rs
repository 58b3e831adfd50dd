use super::{FILE_ID_SIZE, IV_SIZE, KEY_SIZE};
use rand::RngCore;

pub fn random_master_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn random_initial_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

pub fn random_file_id() -> [u8; FILE_ID_SIZE] {
    let mut id = [0u8; FILE_ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    id
}
