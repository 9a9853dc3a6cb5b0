//! Per-sstable membership filters
//!
//! The engine only ever asks "might this sstable hold the partition?"
//! through [`MembershipFilter`], so the filter implementation can be
//! swapped without touching the read path. A `false` answer must be
//! exact; a `true` answer only costs one extra probe.

use crate::common::{Error, Result};
use xxhash_rust::xxh3::xxh3_128;

/// Probabilistic set-membership test stored in every sstable.
pub trait MembershipFilter: Send + Sync {
    /// `false` means definitely absent, `true` means possibly present.
    fn may_contain(&self, key: &[u8]) -> bool;

    fn insert(&mut self, key: &[u8]);

    fn kind(&self) -> FilterKind;

    /// Serialized form for the sstable filter block.
    fn encode(&self) -> Vec<u8>;
}

/// Tag written in front of the filter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Bloom = 1,
    /// Never excludes anything; used when filtering is disabled.
    PassThrough = 2,
}

impl FilterKind {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(FilterKind::Bloom),
            2 => Ok(FilterKind::PassThrough),
            other => Err(Error::Serialization(format!(
                "unknown filter kind: {}",
                other
            ))),
        }
    }
}

/// Build an empty filter of the given kind.
pub fn new_filter(
    kind: FilterKind,
    expected_items: usize,
    false_positive_rate: f64,
) -> Box<dyn MembershipFilter> {
    match kind {
        FilterKind::Bloom => Box::new(BloomFilter::new(expected_items, false_positive_rate)),
        FilterKind::PassThrough => Box::new(PassThrough),
    }
}

/// Decode a filter block written by [`MembershipFilter::encode`].
pub fn decode_filter(kind: FilterKind, data: &[u8]) -> Result<Box<dyn MembershipFilter>> {
    match kind {
        FilterKind::Bloom => Ok(Box::new(BloomFilter::decode(data)?)),
        FilterKind::PassThrough => Ok(Box::new(PassThrough)),
    }
}

/// Bit array with k hash functions.
///
/// Sizing:
///   bits_per_key = -1.44 * log2(fp_rate)
///   num_hashes   = bits_per_key * ln(2)
///
/// The k positions come from double hashing the two halves of one
/// 128-bit xxh3 hash: h_i = h1 + i * h2 (mod m).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

impl BloomFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let fp = false_positive_rate.clamp(1e-9, 0.5);
        let bits_per_key = -1.44 * fp.log2();
        let num_bits = ((expected_items.max(1) as f64) * bits_per_key).ceil() as u32;
        let num_bits = num_bits.max(64);
        let num_hashes = ((bits_per_key * std::f64::consts::LN_2).ceil() as u32).max(1);

        Self {
            bits: vec![0u64; (num_bits as usize).div_ceil(64)],
            num_hashes,
            num_bits,
        }
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let hash = xxh3_128(key);
        let h1 = hash as u64;
        let h2 = (hash >> 64) as u64;
        (0..self.num_hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as usize)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Serialization("bloom filter block too short".into()));
        }
        let num_hashes = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let num_bits = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let words = (num_bits as usize).div_ceil(64);
        if num_hashes == 0 || num_bits == 0 || data.len() != 8 + words * 8 {
            return Err(Error::Serialization("bloom filter block malformed".into()));
        }
        let bits = data[8..]
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }
}

impl MembershipFilter for BloomFilter {
    fn may_contain(&self, key: &[u8]) -> bool {
        self.positions(key)
            .all(|pos| (self.bits[pos / 64] >> (pos % 64)) & 1 == 1)
    }

    fn insert(&mut self, key: &[u8]) {
        let positions: Vec<usize> = self.positions(key).collect();
        for pos in positions {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Bloom
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.bits.len() * 8);
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        for word in &self.bits {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Filter that always answers "maybe".
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl MembershipFilter for PassThrough {
    fn may_contain(&self, _key: &[u8]) -> bool {
        true
    }

    fn insert(&mut self, _key: &[u8]) {}

    fn kind(&self) -> FilterKind {
        FilterKind::PassThrough
    }

    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.insert(format!("key-{}", i).as_bytes());
        }
        for i in 0..1000 {
            assert!(bf.may_contain(format!("key-{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.insert(format!("key-{}", i).as_bytes());
        }
        let false_positives = (0..10_000)
            .filter(|i| bf.may_contain(format!("absent-{}", i).as_bytes()))
            .count();
        // 1% target; allow generous slack
        assert!(false_positives < 500, "fp = {}", false_positives);
    }

    #[test]
    fn test_sizing() {
        let bf = BloomFilter::new(100, 0.01);
        assert_eq!(bf.num_hashes(), 7);
        assert!(bf.num_bits() >= 950);
    }

    #[test]
    fn test_encode_decode() {
        let mut bf = BloomFilter::new(50, 0.05);
        bf.insert(b"alpha");
        bf.insert(b"beta");
        let decoded = decode_filter(FilterKind::Bloom, &bf.encode()).unwrap();
        assert!(decoded.may_contain(b"alpha"));
        assert!(decoded.may_contain(b"beta"));
        assert_eq!(decoded.kind(), FilterKind::Bloom);

        assert!(decode_filter(FilterKind::Bloom, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_pass_through() {
        let filter = new_filter(FilterKind::PassThrough, 10, 0.01);
        assert!(filter.may_contain(b"anything"));
        assert!(filter.encode().is_empty());
        assert!(FilterKind::from_byte(9).is_err());
    }
}
