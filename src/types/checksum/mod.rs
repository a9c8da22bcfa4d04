#![forbid(unsafe_code)]

use crc32fast::Hasher;

/// Checksum over a batch of freed ids, seeded with the batch length so that
/// a truncated batch never validates.
pub fn id_batch_crc32(ids: &[i64]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&(ids.len() as u32).to_be_bytes());
    for id in ids {
        hasher.update(&id.to_be_bytes());
    }
    hasher.finalize()
}

/// Verifies a stored batch checksum.
pub fn verify_id_batch(ids: &[i64], stored: u32) -> bool {
    id_batch_crc32(ids) == stored
}
