//! Nonce generation for superblocks and index saves.
//!
//! A nonce is a 64-bit value cut from a seeded Murmur3-128 hash. The primary
//! nonce binds a superblock to its seed bytes; secondary nonces chain off an
//! existing nonce to bind saves to the volume that wrote them.

use murmur3::murmur3_x64_128;
use rand::Rng;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the seed material stored in the superblock.
pub const NONCE_INFO_SIZE: usize = 32;

const PRIMARY_NONCE_SEED: u64 = 0xa1b1e0fc;

/// Hash `data` with a seed derived from `start` and take bytes 4..12 of the
/// 128-bit result, little-endian.
fn hash_to_nonce(start: u64, data: &[u8]) -> u64 {
    let seed = (start ^ (start >> 27)) as u32;
    let hash = murmur3_x64_128(&mut Cursor::new(data), seed).unwrap();
    let bytes = hash.to_le_bytes();
    u64::from_le_bytes(bytes[4..12].try_into().unwrap())
}

/// Generate the primary nonce for a new superblock from its seed bytes.
pub fn primary_nonce(data: &[u8]) -> u64 {
    hash_to_nonce(PRIMARY_NONCE_SEED, data)
}

/// Deterministically derive a nonce from an existing nonce and some data.
pub fn secondary_nonce(base: u64, data: &[u8]) -> u64 {
    hash_to_nonce(base.wrapping_add(1), data)
}

/// Fill 32 bytes of unique seed material: the current realtime in
/// nanoseconds, a 30-bit pseudorandom number, then the filled prefix copied
/// forward until the buffer is full.
pub fn create_unique_nonce_data() -> [u8; NONCE_INFO_SIZE] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let random: u32 = rand::thread_rng().gen_range(1..(1 << 30));

    let mut buffer = [0u8; NONCE_INFO_SIZE];
    buffer[0..8].copy_from_slice(&now.to_le_bytes());
    buffer[8..12].copy_from_slice(&random.to_le_bytes());

    let mut offset = 12;
    while offset < NONCE_INFO_SIZE {
        let length = (NONCE_INFO_SIZE - offset).min(offset);
        buffer.copy_within(0..length, offset);
        offset += length;
    }
    buffer
}
