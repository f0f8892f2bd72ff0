//! Filter policy plug-in and the default Bloom filter implementation.
//!
//! A table writer feeds every key of the table to the active policy and
//! stores the resulting filter block; a table reader consults the filter
//! before touching any data block. False positives cost one extra block
//! read, false negatives must never happen.

/// Builds and queries per-table key filters. Implementations hash user keys;
/// internal-key trailers are stripped before the policy sees them.
pub trait FilterPolicy: Send + Sync {
    /// Name recorded next to the filter block. A reader skips filters whose
    /// name does not match the configured policy.
    fn name(&self) -> &'static str;

    /// Builds a filter covering exactly `keys`.
    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8>;

    /// Whether `key` may be present in a filter built by this policy.
    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool;
}

/// Bloom filter policy with a configurable bits-per-key budget.
///
/// Uses double hashing: probe i hits `h1 + i * h2`, with both hashes derived
/// from one pass over the key. 10 bits per key yields roughly a 1% false
/// positive rate.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_probes: u32,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane band.
        let num_probes = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30);
        Self {
            bits_per_key,
            num_probes,
        }
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let mut h1: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in key {
            h1 ^= b as u64;
            h1 = h1.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let h2 = h1.rotate_right(17) ^ 0x9e37_79b9_7f4a_7c15;
        (h1, h2)
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "silt.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8> {
        let num_bits = (keys.len() * self.bits_per_key).max(64);
        let mut bits = vec![0u8; num_bits.div_ceil(8)];
        let num_bits = bits.len() * 8;

        for key in keys {
            let (h1, h2) = Self::hash_pair(key);
            for i in 0..self.num_probes {
                let pos = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize;
                bits[pos / 8] |= 1 << (pos % 8);
            }
        }

        // Probe count travels with the filter so readers built with a
        // different budget still query it correctly.
        bits.push(self.num_probes as u8);
        bits
    }

    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool {
        let Some((&probes, bits)) = filter.split_last() else {
            return true;
        };
        if bits.is_empty() || probes == 0 || probes > 30 {
            // Unrecognized filter shape: fall through to the data blocks.
            return true;
        }
        let num_bits = bits.len() * 8;
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..probes as u32 {
            let pos = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize;
            if bits[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[&[u8]]) -> (BloomFilterPolicy, Vec<u8>) {
        let policy = BloomFilterPolicy::default();
        let filter = policy.create_filter(keys);
        (policy, filter)
    }

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..1000u32)
            .map(|i| format!("key_{i:06}").into_bytes())
            .collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let (policy, filter) = build(&refs);

        for key in &keys {
            assert!(
                policy.key_may_match(&filter, key),
                "false negative for {}",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let keys: Vec<Vec<u8>> = (0..10_000u32)
            .map(|i| format!("exist_{i:08}").into_bytes())
            .collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let (policy, filter) = build(&refs);

        let mut hits = 0;
        for i in 0..10_000u32 {
            let key = format!("absent_{i:08}");
            if policy.key_may_match(&filter, key.as_bytes()) {
                hits += 1;
            }
        }
        assert!(hits < 300, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn test_empty_filter_rejects() {
        let (policy, filter) = build(&[]);
        assert!(!policy.key_may_match(&filter, b"anything"));
    }

    #[test]
    fn test_garbage_filter_falls_through() {
        let policy = BloomFilterPolicy::default();
        assert!(policy.key_may_match(&[], b"k"));
        assert!(policy.key_may_match(&[0xff], b"k"));
    }

    #[test]
    fn test_empty_key_is_representable() {
        let (policy, filter) = build(&[b"".as_slice(), b"a".as_slice()]);
        assert!(policy.key_may_match(&filter, b""));
        assert!(policy.key_may_match(&filter, b"a"));
    }
}
