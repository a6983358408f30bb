use md5::{Digest, Md5};

use crate::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent by the backend with an existence filter.
///
/// Membership is tested with `hash_count` bit positions derived from the two little-endian
/// 64-bit halves of the MD5 digest: `(h1 + i * h2) mod bit_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    /// Validates the wire parameters; `padding` unused bits trail the last byte.
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter hash count: {hash_count}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Invalid bloom filter hash count: 0"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter padding when bitmap length is 0: {padding}"
            )));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// False means `value` was definitely not added; true may be a false positive.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let digest = Md5::digest(value.as_bytes());
        let (low, high) = digest.split_at(8);
        let h1 = u64::from_le_bytes(to_array(low));
        let h2 = u64::from_le_bytes(to_array(high));

        (0..self.hash_count as u64).all(|i| {
            let index = h1.wrapping_add(h2.wrapping_mul(i)) % self.bit_count;
            self.is_bit_set(index)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn to_array(bytes: &[u8]) -> [u8; 8] {
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    array
}
