//! Table data blocks.
//!
//! A block is a run of prefix-compressed entries followed by a restart
//! array. Every `restart_interval`-th entry stores its key whole; the ones
//! between store only the suffix that differs from their predecessor:
//!
//! ```text
//! +------------+--------------+---------------+-----------+-------+
//! | shared:u32 | unshared:u32 | value_len:u32 | key delta | value |
//! +------------+--------------+---------------+-----------+-------+
//! ...entries..., restart offsets (u32 each), restart count:u32
//! ```
//!
//! Keys inside a block are internal keys in internal-key order. Index
//! blocks reuse the same format with block handles as values.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::InternalComparator;

const ENTRY_HEADER: usize = 12;

/// Accumulates ordered entries into an encoded block.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: vec![0],
            restart_interval: restart_interval.max(1),
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter >= self.restart_interval {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
            0
        } else {
            common_prefix(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        let mut header = [0u8; ENTRY_HEADER];
        BigEndian::write_u32(&mut header[..4], shared as u32);
        BigEndian::write_u32(&mut header[4..8], unshared as u32);
        BigEndian::write_u32(&mut header[8..12], value.len() as u32);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Encoded size if finished now.
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Seals the block, returning its encoding and resetting the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        for restart in &self.restarts {
            let mut enc = [0u8; 4];
            BigEndian::write_u32(&mut enc, *restart);
            self.buf.extend_from_slice(&enc);
        }
        let mut count = [0u8; 4];
        BigEndian::write_u32(&mut count, self.restarts.len() as u32);
        self.buf.extend_from_slice(&count);

        let data = std::mem::take(&mut self.buf);
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        data
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded, immutable block. Entries are materialized on construction so
/// cursors can move in either direction without re-walking prefixes.
pub struct Block {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Block {
    pub fn decode(data: &[u8]) -> Result<Block> {
        if data.len() < 4 {
            return Err(Error::Corruption("block shorter than its footer".into()));
        }
        let restart_count = BigEndian::read_u32(&data[data.len() - 4..]) as usize;
        let restart_bytes = restart_count
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::Corruption("restart count overflow".into()))?;
        if restart_bytes > data.len() {
            return Err(Error::Corruption(format!(
                "block of {} bytes claims {restart_count} restarts",
                data.len()
            )));
        }
        let mut entries = Vec::new();
        let body = &data[..data.len() - restart_bytes];
        let mut pos = 0;
        let mut last_key: Vec<u8> = Vec::new();
        while pos < body.len() {
            if pos + ENTRY_HEADER > body.len() {
                return Err(Error::Corruption("truncated block entry header".into()));
            }
            let shared = BigEndian::read_u32(&body[pos..pos + 4]) as usize;
            let unshared = BigEndian::read_u32(&body[pos + 4..pos + 8]) as usize;
            let value_len = BigEndian::read_u32(&body[pos + 8..pos + 12]) as usize;
            pos += ENTRY_HEADER;

            if shared > last_key.len() {
                return Err(Error::Corruption(format!(
                    "block entry shares {shared} bytes of a {}-byte key",
                    last_key.len()
                )));
            }
            if pos + unshared + value_len > body.len() {
                return Err(Error::Corruption("block entry overruns block".into()));
            }

            let mut key = Vec::with_capacity(shared + unshared);
            key.extend_from_slice(&last_key[..shared]);
            key.extend_from_slice(&body[pos..pos + unshared]);
            pos += unshared;
            let value = body[pos..pos + value_len].to_vec();
            pos += value_len;

            last_key.clone_from(&key);
            entries.push((key, value));
        }
        Ok(Block { entries })
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(self: &Arc<Self>, icmp: InternalComparator) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            icmp,
            idx: None,
        }
    }
}

/// Cursor over a decoded block.
pub struct BlockIter {
    block: Arc<Block>,
    icmp: InternalComparator,
    idx: Option<usize>,
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.idx.is_some()
    }

    fn seek_to_first(&mut self) {
        self.idx = (!self.block.is_empty()).then_some(0);
    }

    fn seek_to_last(&mut self) {
        self.idx = self.block.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        let entries = self.block.entries();
        let first_ge = entries
            .partition_point(|(key, _)| self.icmp.compare(key, target) == Ordering::Less);
        self.idx = (first_ge < entries.len()).then_some(first_ge);
    }

    fn next(&mut self) {
        self.idx = match self.idx {
            Some(i) if i + 1 < self.block.len() => Some(i + 1),
            _ => None,
        };
    }

    fn prev(&mut self) {
        self.idx = self.idx.and_then(|i| i.checked_sub(1));
    }

    fn key(&self) -> &[u8] {
        &self.block.entries[self.idx.expect("iterator is valid")].0
    }

    fn value(&self) -> &[u8] {
        &self.block.entries[self.idx.expect("iterator is valid")].1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalComparator};

    fn icmp() -> InternalComparator {
        InternalComparator::new(Arc::new(BytewiseComparator))
    }

    // Plain byte keys stand in for internal keys here; the block itself is
    // agnostic as long as insertions match the comparator's order.
    fn sample_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"apple\0\0\0\0\0\0\0\0".to_vec(), b"fruit".to_vec()),
            (b"applet\0\0\0\0\0\0\0\0".to_vec(), b"program".to_vec()),
            (b"banana\0\0\0\0\0\0\0\0".to_vec(), b"fruit".to_vec()),
            (b"band\0\0\0\0\0\0\0\0".to_vec(), b"music".to_vec()),
            (b"candy\0\0\0\0\0\0\0\0".to_vec(), b"sweet".to_vec()),
        ]
    }

    fn build(entries: &[(Vec<u8>, Vec<u8>)], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::decode(&builder.finish()).unwrap())
    }

    #[test]
    fn test_roundtrip_with_prefix_compression() {
        for restart_interval in [1, 2, 16] {
            let entries = sample_entries();
            let block = build(&entries, restart_interval);
            assert_eq!(block.entries(), entries.as_slice(), "ri={restart_interval}");
        }
    }

    #[test]
    fn test_compression_shrinks_shared_prefixes() {
        let entries = sample_entries();
        let mut builder = BlockBuilder::new(16);
        let raw: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        for (key, value) in &entries {
            builder.add(key, value);
        }
        let encoded = builder.finish();
        // Headers add overhead but shared prefixes more than pay for it at
        // this restart interval.
        assert!(encoded.len() < raw + entries.len() * ENTRY_HEADER + 8 * 4);
    }

    #[test]
    fn test_iter_seek_next_prev() {
        let entries = sample_entries();
        let block = build(&entries, 2);
        let mut iter = block.iter(icmp());

        iter.seek(b"banana\0\0\0\0\0\0\0\0");
        assert!(iter.valid());
        assert_eq!(iter.key(), entries[2].0.as_slice());

        iter.next();
        assert_eq!(iter.key(), entries[3].0.as_slice());

        iter.prev();
        iter.prev();
        assert_eq!(iter.key(), entries[1].0.as_slice());

        iter.seek(b"zzz\0\0\0\0\0\0\0\0");
        assert!(!iter.valid());

        iter.seek_to_first();
        assert_eq!(iter.key(), entries[0].0.as_slice());
        iter.prev();
        assert!(!iter.valid());

        iter.seek_to_last();
        assert_eq!(iter.key(), entries[4].0.as_slice());
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_block() {
        let mut builder = BlockBuilder::new(16);
        let block = Arc::new(Block::decode(&builder.finish()).unwrap());
        assert!(block.is_empty());
        let mut iter = block.iter(icmp());
        iter.seek_to_first();
        assert!(!iter.valid());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Block::decode(&[]).is_err());
        assert!(Block::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
        // Claims one entry but carries no body.
        let mut data = vec![0u8; 2];
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(Block::decode(&data).is_err());
    }

    #[test]
    fn test_builder_resets_after_finish() {
        let mut builder = BlockBuilder::new(4);
        builder.add(b"aaaa", b"1");
        let first = builder.finish();
        builder.add(b"aaaa", b"1");
        let second = builder.finish();
        assert_eq!(first, second);
    }
}
