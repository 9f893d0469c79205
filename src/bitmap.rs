//! Checksummed byte bitmap (C2)
//!
//! A concurrent set of integers in `[0, size_bits)` backed by a packed byte
//! vector, with a cached population count and CRC32 checksum so readers
//! never recompute either on the hot path. Every operation takes the
//! bitmap's lock, mirroring the teacher's short-critical-section style in
//! `engines/granite` rather than attempting anything lock-free here — only
//! C3's queue earns that complexity.

use std::sync::Mutex;

use crate::error::{Result, SubstrateError};

#[derive(Debug)]
struct BitmapState {
    bits: Vec<u8>,
    size_bits: usize,
    popcount: u32,
    checksum: Option<u32>,
}

impl BitmapState {
    fn recompute_checksum(&mut self) -> u32 {
        if let Some(c) = self.checksum {
            return c;
        }
        let c = crc32fast::hash(&self.bits);
        self.checksum = Some(c);
        c
    }

    fn invalidate(&mut self) {
        self.checksum = None;
    }
}

/// A checksummed, lock-guarded bitmap over `[0, size_bits)`.
#[derive(Debug)]
pub struct Bitmap {
    state: Mutex<BitmapState>,
}

impl Bitmap {
    /// Create a zeroed bitmap of `size_bits` bits. Fails with
    /// `InvalidArgument` for a zero size.
    pub fn create(size_bits: usize) -> Result<Self> {
        if size_bits == 0 {
            return Err(SubstrateError::invalid_argument("bitmap size must be non-zero"));
        }
        let byte_len = (size_bits + 7) / 8;
        Ok(Self {
            state: Mutex::new(BitmapState {
                bits: vec![0u8; byte_len],
                size_bits,
                popcount: 0,
                checksum: None,
            }),
        })
    }

    pub fn size_bits(&self) -> usize {
        self.state.lock().expect("bitmap lock poisoned").size_bits
    }

    fn check_bounds(size_bits: usize, bit: usize) -> Result<()> {
        if bit >= size_bits {
            return Err(SubstrateError::invalid_argument(format!(
                "bit {} out of bounds for bitmap of size {}",
                bit, size_bits
            )));
        }
        Ok(())
    }

    pub fn set(&self, bit: usize) -> Result<()> {
        let mut state = self.state.lock().expect("bitmap lock poisoned");
        Self::check_bounds(state.size_bits, bit)?;
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
        if state.bits[byte] & mask == 0 {
            state.bits[byte] |= mask;
            state.popcount += 1;
            state.invalidate();
        }
        Ok(())
    }

    pub fn clear(&self, bit: usize) -> Result<()> {
        let mut state = self.state.lock().expect("bitmap lock poisoned");
        Self::check_bounds(state.size_bits, bit)?;
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
        if state.bits[byte] & mask != 0 {
            state.bits[byte] &= !mask;
            state.popcount -= 1;
            state.invalidate();
        }
        Ok(())
    }

    pub fn test(&self, bit: usize) -> Result<bool> {
        let state = self.state.lock().expect("bitmap lock poisoned");
        Self::check_bounds(state.size_bits, bit)?;
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
        Ok(state.bits[byte] & mask != 0)
    }

    /// First clear bit at or after `from`, or `None` if the bitmap has no
    /// zero bits in `[from, size_bits)`.
    pub fn find_first_zero(&self, from: usize) -> Option<usize> {
        let state = self.state.lock().expect("bitmap lock poisoned");
        (from..state.size_bits).find(|&bit| {
            let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
            state.bits[byte] & mask == 0
        })
    }

    /// First index `>= from`, a multiple of `alignment`, that starts `count`
    /// consecutive clear bits. `alignment` must be a power of two.
    pub fn find_next_zero_run(&self, from: usize, count: usize, alignment: usize) -> Result<Option<usize>> {
        if count == 0 {
            return Err(SubstrateError::invalid_argument("run count must be non-zero"));
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(SubstrateError::invalid_argument("alignment must be a power of two"));
        }
        let state = self.state.lock().expect("bitmap lock poisoned");
        let mut start = round_up(from, alignment);
        while start + count <= state.size_bits {
            let mut ok = true;
            for bit in start..start + count {
                let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
                if state.bits[byte] & mask != 0 {
                    ok = false;
                    // jump past the set bit, then realign
                    start = round_up(bit + 1, alignment);
                    break;
                }
            }
            if ok {
                return Ok(Some(start));
            }
        }
        Ok(None)
    }

    pub fn popcount(&self) -> u32 {
        self.state.lock().expect("bitmap lock poisoned").popcount
    }

    pub fn checksum(&self) -> u32 {
        let mut state = self.state.lock().expect("bitmap lock poisoned");
        state.recompute_checksum()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().expect("bitmap lock poisoned").bits.clone()
    }

    /// Replace the bitmap's contents wholesale (used to apply before/after
    /// allocation snapshots during rollback and recovery).
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("bitmap lock poisoned");
        let expected_len = (state.size_bits + 7) / 8;
        if bytes.len() != expected_len {
            return Err(SubstrateError::invalid_argument(format!(
                "snapshot length {} does not match bitmap byte length {}",
                bytes.len(),
                expected_len
            )));
        }
        state.bits = bytes.to_vec();
        state.popcount = bytes.iter().map(|b| b.count_ones()).sum();
        state.invalidate();
        Ok(())
    }
}

fn round_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_zero_size() {
        assert!(matches!(
            Bitmap::create(0).unwrap_err(),
            SubstrateError::InvalidArgument(_)
        ));
    }

    #[test]
    fn set_clear_test_round_trip() {
        let bm = Bitmap::create(64).unwrap();
        assert!(!bm.test(10).unwrap());
        bm.set(10).unwrap();
        assert!(bm.test(10).unwrap());
        assert_eq!(bm.popcount(), 1);
        bm.clear(10).unwrap();
        assert!(!bm.test(10).unwrap());
        assert_eq!(bm.popcount(), 0);
    }

    #[test]
    fn out_of_bounds_is_invalid_argument() {
        let bm = Bitmap::create(8).unwrap();
        assert!(matches!(
            bm.set(8).unwrap_err(),
            SubstrateError::InvalidArgument(_)
        ));
    }

    #[test]
    fn find_first_zero_skips_set_bits() {
        let bm = Bitmap::create(16).unwrap();
        bm.set(0).unwrap();
        bm.set(1).unwrap();
        assert_eq!(bm.find_first_zero(0), Some(2));
    }

    #[test]
    fn find_next_zero_run_respects_alignment() {
        let bm = Bitmap::create(32).unwrap();
        bm.set(4).unwrap();
        // a run of 4 aligned to 4 starting at 0 hits the set bit at 4; next aligned slot is 8
        let found = bm.find_next_zero_run(0, 4, 4).unwrap();
        assert_eq!(found, Some(8));
    }

    #[test]
    fn find_next_zero_run_rejects_non_power_of_two_alignment() {
        let bm = Bitmap::create(32).unwrap();
        assert!(matches!(
            bm.find_next_zero_run(0, 1, 3).unwrap_err(),
            SubstrateError::InvalidArgument(_)
        ));
    }

    #[test]
    fn checksum_matches_crc32_and_is_invalidated_on_mutation() {
        let bm = Bitmap::create(16).unwrap();
        let empty_checksum = bm.checksum();
        bm.set(0).unwrap();
        let after_set = bm.checksum();
        assert_ne!(empty_checksum, after_set);
        assert_eq!(after_set, crc32fast::hash(&bm.snapshot()));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let bm = Bitmap::create(32).unwrap();
        bm.set(3).unwrap();
        bm.set(9).unwrap();
        let snap = bm.snapshot();
        bm.set(17).unwrap();
        bm.restore(&snap).unwrap();
        assert!(bm.test(3).unwrap());
        assert!(bm.test(9).unwrap());
        assert!(!bm.test(17).unwrap());
        assert_eq!(bm.popcount(), 2);
    }

    #[test]
    fn restore_rejects_wrong_length() {
        let bm = Bitmap::create(32).unwrap();
        assert!(matches!(
            bm.restore(&[0u8; 2]).unwrap_err(),
            SubstrateError::InvalidArgument(_)
        ));
    }
}
