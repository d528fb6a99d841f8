//! Bloom filter for fast negative lookups
//!
//! Used at two granularities: one filter per segment over row keys, and one
//! small filter per row over column (and sub-column) names. Never reports a
//! false negative; false positive rate is set by bits-per-element (10 bits
//! gives roughly 1%).

use crate::encoding;
use crate::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub struct BloomFilter {
    /// Bit array
    bits: Vec<u8>,

    /// Number of hash functions
    num_hashes: u32,

    /// Number of bits
    num_bits: usize,
}

impl BloomFilter {
    /// Filter sized for `num_elements` entries at `bits_per_element` bits
    /// each. The optimal hash count is `(m/n) * ln(2)`.
    pub fn with_capacity(num_elements: usize, bits_per_element: usize) -> Self {
        let num_bits = (num_elements * bits_per_element).max(8);
        let num_bytes = num_bits.div_ceil(8);

        let num_hashes = ((bits_per_element as f64) * 0.693).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_hashes,
            num_bits,
        }
    }

    /// Mark an element present.
    pub fn fill(&mut self, element: &str) {
        for i in 0..self.num_hashes {
            let hash = self.hash(element, i);
            let bit_pos = (hash as usize) % self.num_bits;
            self.set_bit(bit_pos);
        }
    }

    /// Whether the element might be present (false positives possible).
    pub fn is_present(&self, element: &str) -> bool {
        for i in 0..self.num_hashes {
            let hash = self.hash(element, i);
            let bit_pos = (hash as usize) % self.num_bits;
            if !self.get_bit(bit_pos) {
                return false;
            }
        }
        true
    }

    /// Serialize as `num_hashes(i32) | num_bits(i64) | bit bytes`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&(self.num_hashes as i32).to_be_bytes());
        buf.extend_from_slice(&(self.num_bits as i64).to_be_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = std::io::Cursor::new(data);
        let num_hashes = encoding::read_i32(&mut cur)?;
        let num_bits = encoding::read_i64(&mut cur)?;
        // with_capacity never produces fewer than 8 bits or a hash count
        // outside 1..=30; anything else is a damaged file
        if !(1..=30).contains(&num_hashes) {
            return Err(crate::StorageError::Corruption(format!(
                "bloom filter hash count out of range: {}",
                num_hashes
            )));
        }
        if num_bits < 8 {
            return Err(crate::StorageError::Corruption(format!(
                "bloom filter bit count out of range: {}",
                num_bits
            )));
        }
        let num_bits = num_bits as usize;
        let bits = data[12..].to_vec();
        if bits.len() * 8 < num_bits {
            return Err(crate::StorageError::Corruption(format!(
                "bloom filter truncated: {} bits declared, {} bytes present",
                num_bits,
                bits.len()
            )));
        }
        Ok(Self {
            bits,
            num_hashes: num_hashes as u32,
            num_bits,
        })
    }

    pub fn serialized_size(&self) -> usize {
        12 + self.bits.len()
    }

    fn hash(&self, element: &str, seed: u32) -> u64 {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        element.hash(&mut hasher);
        hasher.finish()
    }

    fn set_bit(&mut self, pos: usize) {
        self.bits[pos / 8] |= 1 << (pos % 8);
    }

    fn get_bit(&self, pos: usize) -> bool {
        (self.bits[pos / 8] & (1 << (pos % 8))) != 0
    }
}
