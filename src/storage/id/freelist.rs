//! On-disk layout of an id file.
//!
//! ```text
//! prelude : [state u8][high id i64 BE]              (9 bytes)
//! batch   : [count u32 BE][crc32 u32 BE][id i64 BE; count]
//! ```
//!
//! Batches are appended as freed ids accumulate and consumed front to back.

use crate::primitives::io::FileIo;
use crate::types::checksum::{id_batch_crc32, verify_id_batch};
use crate::types::{Result, StoreError};

pub(crate) const PRELUDE_LEN: u64 = 9;
const BATCH_HEADER_LEN: u64 = 8;

const CLEAN: u8 = 0;
const STICKY: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Prelude {
    pub sticky: bool,
    pub high_id: i64,
}

pub(crate) fn read_prelude(io: &impl FileIo) -> Result<Prelude> {
    if io.len()? < PRELUDE_LEN {
        return Err(StoreError::Consistency("id file shorter than its prelude".into()));
    }
    let mut buf = [0u8; PRELUDE_LEN as usize];
    io.read_at(0, &mut buf)?;
    let sticky = match buf[0] {
        CLEAN => false,
        STICKY => true,
        other => {
            return Err(StoreError::Consistency(format!(
                "id file state byte {other:#x} is unknown"
            )))
        }
    };
    let mut high = [0u8; 8];
    high.copy_from_slice(&buf[1..]);
    let high_id = i64::from_be_bytes(high);
    if high_id < 0 {
        return Err(StoreError::Consistency(format!("id file high id {high_id} is negative")));
    }
    Ok(Prelude { sticky, high_id })
}

pub(crate) fn write_prelude(io: &impl FileIo, prelude: Prelude) -> Result<()> {
    let mut buf = [0u8; PRELUDE_LEN as usize];
    buf[0] = if prelude.sticky { STICKY } else { CLEAN };
    buf[1..].copy_from_slice(&prelude.high_id.to_be_bytes());
    io.write_at(0, &buf)
}

pub(crate) fn encode_batch(ids: &[i64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BATCH_HEADER_LEN as usize + ids.len() * 8);
    buf.extend_from_slice(&(ids.len() as u32).to_be_bytes());
    buf.extend_from_slice(&id_batch_crc32(ids).to_be_bytes());
    for id in ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

fn read_batch_header(io: &impl FileIo, pos: u64, end: u64) -> Result<(u32, u32)> {
    if pos + BATCH_HEADER_LEN > end {
        return Err(StoreError::Consistency(format!(
            "truncated id batch header at offset {pos}"
        )));
    }
    let mut header = [0u8; BATCH_HEADER_LEN as usize];
    io.read_at(pos, &mut header)?;
    let count = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if pos + BATCH_HEADER_LEN + count as u64 * 8 > end {
        return Err(StoreError::Consistency(format!(
            "id batch at offset {pos} claims {count} ids past end of file"
        )));
    }
    Ok((count, crc))
}

/// Reads the batch at `pos`, returning its ids and the offset of the next one.
pub(crate) fn read_batch(io: &impl FileIo, pos: u64, end: u64) -> Result<(Vec<i64>, u64)> {
    let (count, crc) = read_batch_header(io, pos, end)?;
    let mut raw = vec![0u8; count as usize * 8];
    io.read_at(pos + BATCH_HEADER_LEN, &mut raw)?;
    let ids: Vec<i64> = raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            i64::from_be_bytes(bytes)
        })
        .collect();
    if !verify_id_batch(&ids, crc) {
        return Err(StoreError::Consistency(format!(
            "id batch at offset {pos} failed checksum"
        )));
    }
    Ok((ids, pos + BATCH_HEADER_LEN + raw.len() as u64))
}

/// Number of ids stored between `start` and `end`, walking batch headers only.
pub(crate) fn count_ids(io: &impl FileIo, mut start: u64, end: u64) -> Result<u64> {
    let mut total = 0u64;
    while start < end {
        let (count, _) = read_batch_header(io, start, end)?;
        total += count as u64;
        start += BATCH_HEADER_LEN + count as u64 * 8;
    }
    Ok(total)
}
