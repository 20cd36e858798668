//! [`Block`] — a sorted, immutable-on-sync, on-disk group of [`Revision`]s
//! sharing one [`Orientation`].
//!
//! An SSTable generalized to three orientations: block framing, checksum
//! discipline, and mmap-backed reads follow the usual sorted-string-table
//! shape, but the payload is a homogeneous, strictly-ordered multiset of
//! [`Revision`]s rather than a single key/value cell stream, so there is no
//! separate data-block layer. A block's [`BlockIndex`] maps a composite key
//! straight to a byte range.


pub mod index;
pub mod revision;

pub use index::{BlockIndex, locator_and_key, locator_key, rid_key, secondary_key, text_key};
pub use revision::{Key, Locator, Orientation, Position, Revision, SortValue};

use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::common::{Action, Rid, Value};
use crate::encoding::{self, EncodingError};
use crate::record::Record;

/// Target false-positive rate for a Block's bloom filter.
pub const BLOCK_BLOOM_FP_RATE: f64 = 0.01;

/// Stopwords skipped both when tokenizing a Search value at insert time and
/// a Search query at read time.
pub const STOPWORDS: &[&str] = &["a", "an", "and", "in", "is", "of", "on", "or", "the", "to"];

/// Minimum infix-substring length recorded per token (single characters are
/// not indexed; they would make every block bloom-positive for nearly
/// every query).
const MIN_SUBSTRING_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("block is immutable")]
    Immutable,
    #[error("internal error: {0}")]
    Internal(String),
}

enum State {
    Mutable(Vec<Revision>),
    Immutable { mmap: Mmap, index: BlockIndex },
}

/// One sorted, on-disk-or-staged group of Revisions sharing an
/// [`Orientation`]. Mutable from construction until [`Block::sync`]; once
/// sync'd the in-memory multiset is dropped and reads go through the
/// memory-mapped `.blk` file guided by the [`BlockIndex`].
pub struct Block {
    orientation: Orientation,
    block_id: u64,
    dir: PathBuf,
    state: RwLock<State>,
    bloom: RwLock<Bloom<Vec<u8>>>,
}

impl Block {
    /// Create a new, empty, mutable block rooted at `dir` (which must
    /// already exist — callers create `<env>/db/{cpb,csb,ctb}` up front).
    pub fn new(orientation: Orientation, block_id: u64, dir: impl Into<PathBuf>) -> Self {
        Self {
            orientation,
            block_id,
            dir: dir.into(),
            state: RwLock::new(State::Mutable(Vec::new())),
            bloom: RwLock::new(
                Bloom::new_for_fp_rate(1024, BLOCK_BLOOM_FP_RATE)
                    .expect("fixed bloom parameters are always valid"),
            ),
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn is_immutable(&self) -> bool {
        matches!(&*self.state.read().unwrap_or_else(|e| e.into_inner()), State::Immutable { .. })
    }

    fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.block_id))
    }

    /// Insert one revision. Requires the block to still be mutable;
    /// records the locator, `(locator,key)` and `(locator,key,value)`
    /// composites into the bloom filter.
    pub fn insert(&self, revision: Revision) -> Result<(), BlockError> {
        let mut state = self.state.write().map_err(|_| BlockError::Internal("poisoned".into()))?;
        let revisions = match &mut *state {
            State::Mutable(v) => v,
            State::Immutable { .. } => return Err(BlockError::Immutable),
        };

        {
            let mut bloom = self.bloom.write().unwrap_or_else(|e| e.into_inner());
            bloom.set(&locator_key(&revision.locator));
            bloom.set(&locator_and_key(&revision.locator, &revision.key));
            bloom.set(&full_triple_key(&revision));
        }

        revisions.push(revision);
        Ok(())
    }

    /// Search-only: tokenize `value`'s string form and insert one Search
    /// revision per de-duplicated, non-stopword, minimum-length substring
    /// of each word, at that word's position. This is how `insert` turns a
    /// single field write into an infix-searchable index.
    pub fn insert_search_value(
        &self,
        key: &str,
        value: &Value,
        rid: Rid,
        version: crate::common::Version,
        action: Action,
    ) -> Result<(), BlockError> {
        debug_assert_eq!(self.orientation, Orientation::Search);
        for (pos, word) in tokenize(&value.as_text()) {
            let mut seen = std::collections::HashSet::new();
            for substring in substrings(&word) {
                if !seen.insert(substring.clone()) {
                    continue;
                }
                self.insert(Revision::search(key, substring, rid, pos as u32, version, action))?;
            }
        }
        Ok(())
    }

    /// Whether the bloom filter says `(locator[,key[,value]])` might be
    /// present. A negative answer is authoritative (invariant 3).
    pub fn might_contain(&self, locator: &Locator, key: Option<&Key>, value: Option<&SortValue>) -> bool {
        let bloom = self.bloom.read().unwrap_or_else(|e| e.into_inner());
        let probe = match (key, value) {
            (None, _) => locator_key(locator),
            (Some(k), None) => locator_and_key(locator, k),
            (Some(k), Some(v)) => {
                let mut buf = locator_and_key(locator, k);
                if let Ok(tail) = encoding::encode_to_vec(&sort_value_bytes(v)) {
                    buf.extend_from_slice(&tail);
                }
                buf
            }
        };
        bloom.check(&probe)
    }

    /// Seek every revision matching `locator` (and, if given, `key`) and
    /// append it to `record`. Gated by the bloom filter; falls through to
    /// an in-memory scan (mutable) or an index-guided mmap decode
    /// (immutable).
    pub fn seek(&self, locator: &Locator, key: Option<&Key>, record: &mut Record) -> Result<(), BlockError> {
        if !self.might_contain(locator, key, None) {
            return Ok(());
        }

        let state = self.state.read().map_err(|_| BlockError::Internal("poisoned".into()))?;
        match &*state {
            State::Mutable(revisions) => {
                for rev in revisions {
                    if matches(rev, locator, key) {
                        record.append(rev.clone());
                    }
                }
                Ok(())
            }
            State::Immutable { mmap, index } => {
                let composite = match key {
                    Some(k) => locator_and_key(locator, k),
                    None => locator_key(locator),
                };
                let Some((offset, len)) = index.lookup(&composite) else {
                    return Ok(());
                };
                let start = offset as usize;
                let end = start + len as usize;
                let slice = mmap.get(start..end).ok_or_else(|| BlockError::Internal("index range out of bounds".into()))?;
                let mut cursor = 0usize;
                while cursor < slice.len() {
                    let (size, n) = u32::decode_from(&slice[cursor..])?;
                    cursor += n;
                    let body = &slice[cursor..cursor + size as usize];
                    cursor += size as usize;
                    let (rev, _) = Revision::decode_from(self.orientation, body)?;
                    if matches(&rev, locator, key) {
                        record.append(rev);
                    }
                }
                Ok(())
            }
        }
    }

    /// Serialize the in-memory multiset to `<id>.blk`/`.fltr`/`.indx`,
    /// fsync all three, then flip to immutable and release the in-memory
    /// vector. No-op if already immutable.
    pub fn sync(&self) -> Result<(), BlockError> {
        let mut state = self.state.write().map_err(|_| BlockError::Internal("poisoned".into()))?;
        let revisions = match &mut *state {
            State::Mutable(v) => std::mem::take(v),
            State::Immutable { .. } => return Ok(()),
        };

        fs::create_dir_all(&self.dir)?;

        let mut sorted = revisions;
        sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut blk_buf = Vec::new();
        let mut index = BlockIndex::empty();
        // (locator+key composite, start offset of the current contiguous run)
        let mut group_start: Option<(Vec<u8>, u32)> = None;

        for rev in &sorted {
            let offset_before = blk_buf.len() as u32;
            let mut body = Vec::new();
            rev.encode_to(&mut body)?;
            (body.len() as u32).encode_to(&mut blk_buf)?;
            blk_buf.extend_from_slice(&body);

            let lck = locator_and_key(&rev.locator, &rev.key);

            match &group_start {
                Some((cur_lck, _)) if *cur_lck == lck => {}
                _ => {
                    if let Some((prev_lck, start)) = group_start.take() {
                        index.insert(prev_lck, start, offset_before - start);
                    }
                    group_start = Some((lck, offset_before));
                }
            }
        }
        if let Some((lck, start)) = group_start.take() {
            index.insert(lck, start, blk_buf.len() as u32 - start);
        }

        // Locator-only ranges: contiguous runs sharing the same locator
        // (possibly spanning several keys) per invariant 4.
        rebuild_locator_ranges(&sorted, &mut index);

        let bloom_bytes = {
            let bloom = self.bloom.read().unwrap_or_else(|e| e.into_inner());
            bloom.as_slice().to_vec()
        };

        let mut index_buf = Vec::new();
        index.encode_to(&mut index_buf)?;

        write_file_fsync(&self.path("blk"), &blk_buf)?;
        write_file_fsync(&self.path("fltr"), &bloom_bytes)?;
        write_file_fsync(&self.path("indx"), &index_buf)?;

        let file = File::open(self.path("blk"))?;
        // SAFETY: the file was just written by this process and is never
        // mutated again once a Block turns immutable.
        let mmap = unsafe { Mmap::map(&file)? };

        debug!(block_id = self.block_id, revisions = sorted.len(), "block synced");
        *state = State::Immutable { mmap, index };
        Ok(())
    }

    /// Reopen a previously sync'd block from its three files.
    pub fn open_immutable(orientation: Orientation, block_id: u64, dir: impl Into<PathBuf>) -> Result<Self, BlockError> {
        let dir = dir.into();
        let blk_path = dir.join(format!("{block_id}.blk"));
        let fltr_path = dir.join(format!("{block_id}.fltr"));
        let indx_path = dir.join(format!("{block_id}.indx"));

        let file = File::open(&blk_path)?;
        // SAFETY: sync'd blocks are never mutated in place.
        let mmap = unsafe { Mmap::map(&file)? };

        let bloom_bytes = fs::read(&fltr_path)?;
        let bloom: Bloom<Vec<u8>> =
            Bloom::from_slice(&bloom_bytes).map_err(|e| BlockError::Internal(e.to_string()))?;

        let index_bytes = fs::read(&indx_path)?;
        let index = BlockIndex::decode_from(&index_bytes)?;

        trace!(block_id, path = %blk_path.display(), "block reopened");
        Ok(Self {
            orientation,
            block_id,
            dir,
            state: RwLock::new(State::Immutable { mmap, index }),
            bloom: RwLock::new(bloom),
        })
    }
}

fn full_triple_key(rev: &Revision) -> Vec<u8> {
    let mut buf = locator_and_key(&rev.locator, &rev.key);
    if let Ok(tail) = encoding::encode_to_vec(&sort_value_bytes(&rev.value)) {
        buf.extend_from_slice(&tail);
    }
    buf
}

fn sort_value_bytes(v: &SortValue) -> Vec<u8> {
    match v {
        SortValue::Value(v) => encoding::encode_to_vec(v).unwrap_or_default(),
        SortValue::Rid(r) => encoding::encode_to_vec(r).unwrap_or_default(),
        SortValue::Position(p) => encoding::encode_to_vec(p).unwrap_or_default(),
    }
}

fn matches(rev: &Revision, locator: &Locator, key: Option<&Key>) -> bool {
    if &rev.locator != locator {
        return false;
    }
    match key {
        Some(k) => &rev.key == k,
        None => true,
    }
}

fn rebuild_locator_ranges(sorted: &[Revision], index: &mut BlockIndex) {
    if sorted.is_empty() {
        return;
    }
    let mut start = 0usize;
    let mut offset = 0u32;
    let mut offsets = Vec::with_capacity(sorted.len() + 1);
    offsets.push(0u32);
    for rev in sorted {
        let mut body = Vec::new();
        let _ = rev.encode_to(&mut body);
        offset += 4 + body.len() as u32;
        offsets.push(offset);
    }
    for i in 1..=sorted.len() {
        if i == sorted.len() || sorted[i].locator != sorted[start].locator {
            let lk = locator_key(&sorted[start].locator);
            index.insert(lk, offsets[start], offsets[i] - offsets[start]);
            start = i;
        }
    }
}

fn write_file_fsync(path: &Path, bytes: &[u8]) -> Result<(), BlockError> {
    let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

/// Split `text` into whitespace-delimited, non-stopword, lowercased words
/// with their zero-based position in the original token stream (stopwords
/// still consume a position so later terms keep their true offset).
pub fn tokenize(text: &str) -> Vec<(usize, String)> {
    text.split_whitespace()
        .enumerate()
        .filter(|(_, w)| !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .map(|(i, w)| (i, w.to_lowercase()))
        .collect()
}

/// Every non-empty substring of `word` at least [`MIN_SUBSTRING_LEN`] long.
pub fn substrings(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut out = Vec::new();
    for start in 0..chars.len() {
        for end in (start + MIN_SUBSTRING_LEN).min(chars.len() + 1)..=chars.len() {
            if end - start < MIN_SUBSTRING_LEN {
                continue;
            }
            out.push(chars[start..end].iter().collect());
        }
    }
    out
}
