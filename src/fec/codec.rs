//! FEC codec: a thin wrapper around `reed-solomon-simd`'s systematic
//! erasure coder, operating on `Bucket`s instead of raw `Vec<u8>` so large
//! blocks never need to live fully in memory at once.

use crate::bucket::{read_all, write_all, Bucket};
use crate::error::FecError;
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use std::sync::Arc;

/// One data or check block slot during decode: present with its bytes, or
/// absent (lost in transit).
pub enum BlockSlot {
    Present(Arc<dyn Bucket>),
    Absent,
}

pub struct FecCodec;

impl FecCodec {
    /// Encode `k` data blocks of exactly `block_len` bytes into `m` parity
    /// blocks of the same length. Short data blocks are zero-padded up to
    /// `block_len` for the purpose of encoding only.
    pub fn encode(
        data_blocks: &[Arc<dyn Bucket>],
        m: usize,
        block_len: usize,
    ) -> Result<Vec<Vec<u8>>, FecError> {
        let k = data_blocks.len();
        let mut encoder = ReedSolomonEncoder::new(k, m, block_len)
            .map_err(|e| FecError::ReedSolomon(e.to_string()))?;

        for b in data_blocks {
            let mut bytes = read_all(b.as_ref())?;
            if bytes.len() > block_len {
                return Err(FecError::Malformed { expected: block_len, got: bytes.len() });
            }
            bytes.resize(block_len, 0);
            encoder.add_original_shard(&bytes).map_err(|e| FecError::ReedSolomon(e.to_string()))?;
        }

        let result = encoder.encode().map_err(|e| FecError::ReedSolomon(e.to_string()))?;
        Ok(result.recovery_iter().map(|s| s.to_vec()).collect())
    }

    /// Reconstruct all `k` data blocks given a mix of present/absent data
    /// and check slots. Requires at least `k` present slots total.
    pub fn decode(
        data_slots: &[BlockSlot],
        check_slots: &[BlockSlot],
        block_len: usize,
    ) -> Result<Vec<Arc<dyn Bucket>>, FecError> {
        let k = data_slots.len();
        let m = check_slots.len();

        let present = data_slots.iter().filter(|s| matches!(s, BlockSlot::Present(_))).count()
            + check_slots.iter().filter(|s| matches!(s, BlockSlot::Present(_))).count();
        if present < k {
            return Err(FecError::InsufficientBlocks { need: k, have: present });
        }

        let missing_data: Vec<usize> = data_slots.iter().enumerate()
            .filter(|(_, s)| matches!(s, BlockSlot::Absent))
            .map(|(i, _)| i)
            .collect();

        if missing_data.is_empty() {
            // Already fully available; nothing to reconstruct.
            let mut out = Vec::with_capacity(k);
            for slot in data_slots {
                if let BlockSlot::Present(b) = slot {
                    out.push(b.clone());
                }
            }
            return Ok(out);
        }

        let mut decoder = ReedSolomonDecoder::new(k, m, block_len)
            .map_err(|e| FecError::ReedSolomon(e.to_string()))?;

        for (i, slot) in data_slots.iter().enumerate() {
            if let BlockSlot::Present(b) = slot {
                let bytes = checked_shard(b.as_ref(), block_len)?;
                decoder.add_original_shard(i, &bytes).map_err(|e| FecError::ReedSolomon(e.to_string()))?;
            }
        }
        for (i, slot) in check_slots.iter().enumerate() {
            if let BlockSlot::Present(b) = slot {
                let bytes = checked_shard(b.as_ref(), block_len)?;
                decoder.add_recovery_shard(i, &bytes).map_err(|e| FecError::ReedSolomon(e.to_string()))?;
            }
        }

        let result = decoder.decode().map_err(|e| FecError::ReedSolomon(e.to_string()))?;

        let mut out = Vec::with_capacity(k);
        for (i, slot) in data_slots.iter().enumerate() {
            match slot {
                BlockSlot::Present(b) => out.push(b.clone()),
                BlockSlot::Absent => {
                    let restored = result.restored_original(i)
                        .ok_or_else(|| FecError::ReedSolomon(format!("shard {i} was not restored")))?;
                    let bucket = crate::bucket::MemBucket::from_bytes(restored.to_vec());
                    out.push(Arc::new(bucket));
                }
            }
        }
        Ok(out)
    }
}

fn checked_shard(b: &dyn Bucket, block_len: usize) -> Result<Vec<u8>, FecError> {
    let mut bytes = read_all(b)?;
    if bytes.len() > block_len {
        return Err(FecError::Malformed { expected: block_len, got: bytes.len() });
    }
    bytes.resize(block_len, 0);
    Ok(bytes)
}

/// Writes `data` into a fresh bucket via `factory`. Convenience used by
/// callers assembling `data_blocks`/`check_blocks` slices for `encode`.
pub fn bucket_of(factory: &crate::bucket::BucketFactory, data: &[u8]) -> std::io::Result<Arc<dyn Bucket>> {
    let b = factory.make(data.len() as u64)?;
    write_all(b.as_ref(), data)?;
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketFactory;

    #[test]
    fn encode_then_decode_with_one_missing() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BucketFactory::new(dir.path().to_path_buf());

        let b0 = bucket_of(&factory, &[1, 2, 3, 4]).unwrap();
        let b1 = bucket_of(&factory, &[5, 6, 7, 8]).unwrap();
        let data_blocks = vec![b0.clone(), b1.clone()];

        let parity = FecCodec::encode(&data_blocks, 1, 4).unwrap();
        assert_eq!(parity.len(), 1);
        let parity_bucket = bucket_of(&factory, &parity[0]).unwrap();

        let data_slots = vec![BlockSlot::Present(b0), BlockSlot::Absent];
        let check_slots = vec![BlockSlot::Present(parity_bucket)];

        let restored = FecCodec::decode(&data_slots, &check_slots, 4).unwrap();
        assert_eq!(read_all(restored[1].as_ref()).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn decode_fails_with_too_few_blocks() {
        let data_slots = vec![BlockSlot::Absent, BlockSlot::Absent];
        let check_slots = vec![BlockSlot::Absent];
        let result = FecCodec::decode(&data_slots, &check_slots, 4);
        assert!(matches!(result, Err(FecError::InsufficientBlocks { .. })));
    }
}
