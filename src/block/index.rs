//! [`BlockIndex`] — the sparse offset index persisted to a Block's `.indx`
//! file, plus the composite byte-key helpers shared by the index and the
//! bloom filter so both use an identical key shape.
//!
//! A flat list of `(key, block offset, block length)` tuples, binary-searched
//! at read time. There is no intermediate data-block layer here — a Block's
//! Revisions are already sorted, so the index maps directly from a
//! composite key to a byte range within the `.blk` file.

use std::collections::HashMap;

use crate::common::{Rid, Value};
use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_to_vec, encode_vec};

use super::revision::{Key, Locator};

/// Build the composite byte key for a locator-only lookup (used by the
/// Primary "does this RID exist in this block" bloom/index probe, and by
/// Secondary/Search "does this key have any revisions" probe).
pub fn locator_key(locator: &Locator) -> Vec<u8> {
    encode_to_vec(locator).unwrap_or_default()
}

/// Build the composite byte key for a `(locator, key)` pair lookup (used by
/// Primary "does RID have field K" and Secondary "does key=value exist").
pub fn locator_and_key(locator: &Locator, key: &Key) -> Vec<u8> {
    let mut buf = encode_to_vec(locator).unwrap_or_default();
    if let Ok(tail) = encode_to_vec(key) {
        buf.extend_from_slice(&tail);
    }
    buf
}

/// Shorthand for a Primary locator-only composite key.
pub fn rid_key(rid: Rid) -> Vec<u8> {
    locator_key(&Locator::Rid(rid))
}

/// Shorthand for a Secondary/Search `(key, value/term)` composite key.
pub fn text_key(key: &str, sub: &Key) -> Vec<u8> {
    locator_and_key(&Locator::Key(key.to_string()), sub)
}

/// Shorthand for a Secondary `(key=value)` composite key built straight
/// from a [`Value`].
pub fn secondary_key(key: &str, value: &Value) -> Vec<u8> {
    text_key(key, &Key::Value(value.clone()))
}

/// One `(composite key, byte offset, byte length)` entry in the sparse
/// index, covering the byte range of every Revision sharing that key
/// prefix within the sorted `.blk` file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexEntry {
    key: Vec<u8>,
    offset: u32,
    len: u32,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.len.encode_to(buf)
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (off, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (len, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((IndexEntry { key, offset: off, len }, offset))
    }
}

/// A Block's `.indx` file contents: a map from composite key bytes to the
/// byte range in `.blk` holding every Revision with that key (or key
/// prefix, for the locator-only entries).
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    ranges: HashMap<Vec<u8>, (u32, u32)>,
}

impl BlockIndex {
    /// An empty index, used while a Block is still mutable.
    pub fn empty() -> Self {
        Self {
            ranges: HashMap::new(),
        }
    }

    /// Record that `composite_key` covers bytes `[offset, offset+len)` of
    /// the `.blk` file.
    pub fn insert(&mut self, composite_key: Vec<u8>, offset: u32, len: u32) {
        self.ranges.insert(composite_key, (offset, len));
    }

    /// Look up the byte range for an exact composite key.
    pub fn lookup(&self, composite_key: &[u8]) -> Option<(u32, u32)> {
        self.ranges.get(composite_key).copied()
    }

    /// Number of distinct composite keys indexed.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Serialize to the `.indx` file format: `[u32 count][IndexEntry...]`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let entries: Vec<IndexEntry> = self
            .ranges
            .iter()
            .map(|(key, &(offset, len))| IndexEntry {
                key: key.clone(),
                offset,
                len,
            })
            .collect();
        encode_vec(&entries, buf)
    }

    /// Deserialize from a loaded `.indx` file's bytes.
    pub fn decode_from(buf: &[u8]) -> Result<Self, EncodingError> {
        let (entries, _) = decode_vec::<IndexEntry>(buf)?;
        let mut ranges = HashMap::with_capacity(entries.len());
        for e in entries {
            ranges.insert(e.key, (e.offset, e.len));
        }
        Ok(Self { ranges })
    }
}
