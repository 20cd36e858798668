//! [`Database`] — the durable store: a triplet of parallel
//! [`crate::block::Block`] lists (primary/secondary/search), one per
//! [`Orientation`], each rooted in its own directory.
//!
//! On startup, orphaned artifacts are cleaned up and surviving blocks are
//! reconciled in sorted order by block id. `sync()` seals three blocks and
//! opens three fresh ones under one critical section, using the same
//! atomic build-then-rename pattern a block's own writer uses.

#[cfg(test)]
mod tests;

mod cache;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::block::{Block, BlockError, Key, Locator, Orientation, Revision};
use crate::common::{Action, Operator, Rid, Value, Version, Write};
use crate::inventory::{Inventory, InventoryError};
use crate::record::Record;

use cache::LruCache;

/// Default bound on the number of materialized Primary/Secondary records
/// kept warm per index orientation.
const RECORD_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block error: {0}")]
    Block(#[from] BlockError),
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("internal error: {0}")]
    Internal(String),
}

struct Blocks {
    primary: Vec<Block>,
    secondary: Vec<Block>,
    search: Vec<Block>,
    current_id: u64,
}

/// The on-disk durable store: every sync'd [`Block`] plus the three
/// currently-mutable "head" blocks, gated by a persistent [`Inventory`].
pub struct Database {
    root: PathBuf,
    blocks: RwLock<Blocks>,
    inventory: std::sync::Arc<Inventory>,
    /// Field names known to carry a Secondary index, used by `gather`'s
    /// full scan across every Secondary key.
    secondary_keys: RwLock<HashSet<String>>,
    /// Transient cache for `gather` at the current time; cleared by any
    /// `accept`.
    gather_cache: Mutex<Option<HashMap<Rid, HashMap<String, HashSet<Value>>>>>,
    /// Bounded, size-limited cache of materialized full Primary records,
    /// keyed by RID; kept warm across reads, invalidated per-entry when
    /// `accept` appends a revision to a cached locator.
    primary_cache: Mutex<LruCache<Rid, Record>>,
    /// Same idea for Secondary records, keyed by field name.
    secondary_cache: Mutex<LruCache<String, Record>>,
}

fn dir_for(root: &Path, orientation: Orientation) -> PathBuf {
    root.join("db").join(orientation.dir_name())
}

impl Database {
    /// Open (or create) the database rooted at `root`, reconciling any
    /// crash-torn block set: a block id present in only one of
    /// primary/secondary indicates a crash between block syncs and is
    /// discarded from both lists; search blocks without both a primary and
    /// secondary counterpart are discarded too.
    pub fn open(root: impl Into<PathBuf>, inventory: std::sync::Arc<Inventory>) -> Result<Self, DatabaseError> {
        let root = root.into();
        for o in [Orientation::Primary, Orientation::Secondary, Orientation::Search] {
            std::fs::create_dir_all(dir_for(&root, o))?;
        }

        let primary_ids = block_ids_on_disk(&dir_for(&root, Orientation::Primary))?;
        let secondary_ids = block_ids_on_disk(&dir_for(&root, Orientation::Secondary))?;
        let search_ids = block_ids_on_disk(&dir_for(&root, Orientation::Search))?;

        let valid: HashSet<u64> = primary_ids.intersection(&secondary_ids).copied().collect();
        for stray in primary_ids.difference(&valid) {
            info!(block_id = stray, "discarding orphan primary block (crash between syncs)");
            remove_block_files(&dir_for(&root, Orientation::Primary), *stray)?;
        }
        for stray in secondary_ids.difference(&valid) {
            info!(block_id = stray, "discarding orphan secondary block (crash between syncs)");
            remove_block_files(&dir_for(&root, Orientation::Secondary), *stray)?;
        }
        for stray in search_ids.difference(&valid) {
            info!(block_id = stray, "discarding orphan search block");
            remove_block_files(&dir_for(&root, Orientation::Search), *stray)?;
        }

        let mut sorted: Vec<u64> = valid.into_iter().collect();
        sorted.sort_unstable();

        let mut primary = Vec::new();
        let mut secondary = Vec::new();
        let mut search = Vec::new();
        for id in &sorted {
            primary.push(Block::open_immutable(Orientation::Primary, *id, dir_for(&root, Orientation::Primary))?);
            secondary.push(Block::open_immutable(Orientation::Secondary, *id, dir_for(&root, Orientation::Secondary))?);
            if search_ids.contains(id) {
                search.push(Block::open_immutable(Orientation::Search, *id, dir_for(&root, Orientation::Search))?);
            }
        }

        let next_id = sorted.last().map(|id| id + 1).unwrap_or(1);
        primary.push(Block::new(Orientation::Primary, next_id, dir_for(&root, Orientation::Primary)));
        secondary.push(Block::new(Orientation::Secondary, next_id, dir_for(&root, Orientation::Secondary)));
        search.push(Block::new(Orientation::Search, next_id, dir_for(&root, Orientation::Search)));

        info!(sealed_blocks = sorted.len(), current_id = next_id, "database opened");

        Ok(Self {
            root,
            blocks: RwLock::new(Blocks {
                primary,
                secondary,
                search,
                current_id: next_id,
            }),
            inventory,
            secondary_keys: RwLock::new(HashSet::new()),
            gather_cache: Mutex::new(None),
            primary_cache: Mutex::new(LruCache::new(RECORD_CACHE_CAPACITY)),
            secondary_cache: Mutex::new(LruCache::new(RECORD_CACHE_CAPACITY)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Dispatch one write to all three currently-mutable blocks:
    /// a Primary revision, a Secondary revision, and (for non-blob values)
    /// a burst of Search revisions from infix tokenization.
    pub fn accept(&self, write: &Write, _sync: bool) -> Result<(), DatabaseError> {
        let blocks = self.blocks.read().map_err(|_| DatabaseError::Internal("poisoned".into()))?;

        let primary = blocks.primary.last().ok_or_else(|| DatabaseError::Internal("no current primary block".into()))?;
        primary.insert(Revision::primary(write.rid, write.key.clone(), write.value.clone(), write.version, write.action))?;

        let secondary = blocks.secondary.last().ok_or_else(|| DatabaseError::Internal("no current secondary block".into()))?;
        secondary.insert(Revision::secondary(write.key.clone(), write.value.clone(), write.rid, write.version, write.action))?;

        if matches!(write.value, Value::Str(_) | Value::Tag(_)) {
            let search = blocks.search.last().ok_or_else(|| DatabaseError::Internal("no current search block".into()))?;
            search.insert_search_value(&write.key, &write.value, write.rid, write.version, write.action)?;
        }

        drop(blocks);

        self.inventory.insert(write.rid)?;
        self.secondary_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(write.key.clone());
        *self.gather_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;

        // If a cached Record for this write's locator already exists,
        // append the new revision in place rather than evicting it —
        // avoids staleness without forcing a re-seek of every Block.
        if let Some(record) = self.primary_cache.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&write.rid) {
            record.append(Revision::primary(write.rid, write.key.clone(), write.value.clone(), write.version, write.action));
        }
        if let Some(record) = self
            .secondary_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&write.key)
        {
            record.append(Revision::secondary(write.key.clone(), write.value.clone(), write.rid, write.version, write.action));
        }
        Ok(())
    }

    /// Sync the three current blocks to disk, then allocate three fresh
    /// blocks sharing a newly-minted block id, all under one write-lock
    /// critical section.
    pub fn sync(&self) -> Result<(), DatabaseError> {
        let mut blocks = self.blocks.write().map_err(|_| DatabaseError::Internal("poisoned".into()))?;

        if let Some(b) = blocks.primary.last() {
            b.sync()?;
        }
        if let Some(b) = blocks.secondary.last() {
            b.sync()?;
        }
        if let Some(b) = blocks.search.last() {
            b.sync()?;
        }

        let next_id = blocks.current_id + 1;
        blocks.primary.push(Block::new(Orientation::Primary, next_id, dir_for(&self.root, Orientation::Primary)));
        blocks.secondary.push(Block::new(Orientation::Secondary, next_id, dir_for(&self.root, Orientation::Secondary)));
        blocks.search.push(Block::new(Orientation::Search, next_id, dir_for(&self.root, Orientation::Search)));
        blocks.current_id = next_id;

        debug!(new_block_id = next_id, "database synced and rotated");
        Ok(())
    }

    /// Whether `(key, value, rid)` is currently (or at `ts`) present,
    /// gated by the Inventory: an unknown RID is never present.
    pub fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, DatabaseError> {
        if !self.inventory.contains(rid) {
            return Ok(false);
        }
        let record = self.select_key(rid, key)?;
        let present = match ts {
            Some(ts) => record.get_at(&Key::Text(key.to_string()), ts),
            None => record.get(&Key::Text(key.to_string())),
        };
        Ok(present.iter().any(|v| matches!(v, crate::block::SortValue::Value(v) if v.eq_case_insensitive(value))))
    }

    /// Materialize the full Primary record for `rid` by seeking every
    /// Primary block whose bloom admits it, merged in block-id
    /// (chronological) order.
    pub fn select(&self, rid: Rid) -> Result<Record, DatabaseError> {
        if let Some(cached) = self.primary_cache.lock().unwrap_or_else(|e| e.into_inner()).get(&rid) {
            return Ok(cached);
        }

        let mut record = Record::new(Orientation::Primary, Locator::Rid(rid));
        let blocks = self.blocks.read().map_err(|_| DatabaseError::Internal("poisoned".into()))?;
        for block in &blocks.primary {
            block.seek(&Locator::Rid(rid), None, &mut record)?;
        }
        drop(blocks);

        self.primary_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rid, record.clone());
        Ok(record)
    }

    /// Materialize a partial Primary record for `(rid, key)`.
    pub fn select_key(&self, rid: Rid, key: &str) -> Result<Record, DatabaseError> {
        let mut record = Record::partial(Orientation::Primary, Locator::Rid(rid), Key::Text(key.to_string()));
        let blocks = self.blocks.read().map_err(|_| DatabaseError::Internal("poisoned".into()))?;
        for block in &blocks.primary {
            block.seek(&Locator::Rid(rid), Some(&Key::Text(key.to_string())), &mut record)?;
        }
        Ok(record)
    }

    /// Materialize the Secondary record for `key` (every `value -> {rid}`
    /// pair ever written under that field name).
    pub fn secondary_record(&self, key: &str) -> Result<Record, DatabaseError> {
        if let Some(cached) = self
            .secondary_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.to_string())
        {
            return Ok(cached);
        }

        let mut record = Record::new(Orientation::Secondary, Locator::Key(key.to_string()));
        let blocks = self.blocks.read().map_err(|_| DatabaseError::Internal("poisoned".into()))?;
        for block in &blocks.secondary {
            block.seek(&Locator::Key(key.to_string()), None, &mut record)?;
        }
        drop(blocks);

        self.secondary_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), record.clone());
        Ok(record)
    }

    /// Secondary `explore(key, op, operands)`.
    pub fn explore(&self, key: &str, op: Operator, operands: &[Value]) -> Result<HashMap<Rid, HashSet<Value>>, DatabaseError> {
        let record = self.secondary_record(key)?;
        record.explore(op, operands).map_err(|e| DatabaseError::Internal(e.to_string()))
    }

    /// Secondary `browse(key, value)`: the `EQUALS` shortcut of `explore`.
    pub fn browse(&self, key: &str, value: &Value) -> Result<HashSet<Rid>, DatabaseError> {
        Ok(self.explore(key, Operator::Equals, std::slice::from_ref(value))?.into_keys().collect())
    }

    /// Secondary `gather(rid[, ts])`: inverts the index to find every
    /// field this record currently (or historically) holds a value under.
    /// A transient cube cache accelerates current-time gathers across many
    /// RIDs until the next `accept` invalidates it.
    pub fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, HashSet<Value>>, DatabaseError> {
        if ts.is_none() {
            let mut cache = self.gather_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cube) = cache.as_ref() {
                return Ok(cube.get(&rid).cloned().unwrap_or_default());
            }
            let cube = self.build_gather_cube(None)?;
            let result = cube.get(&rid).cloned().unwrap_or_default();
            *cache = Some(cube);
            return Ok(result);
        }

        let cube = self.build_gather_cube(ts)?;
        Ok(cube.get(&rid).cloned().unwrap_or_default())
    }

    fn build_gather_cube(&self, ts: Option<Version>) -> Result<HashMap<Rid, HashMap<String, HashSet<Value>>>, DatabaseError> {
        let keys: Vec<String> = self.secondary_keys.read().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
        let mut cube: HashMap<Rid, HashMap<String, HashSet<Value>>> = HashMap::new();
        for key in keys {
            let record = self.secondary_record(&key)?;
            let sub_keys: Vec<_> = match ts {
                // A value held at `ts` may since have been removed from
                // every RID, making it absent from `present_keys()` — the
                // historical branch must walk the full history instead.
                Some(_) => record.history_keys().cloned().collect(),
                None => record.present_keys().cloned().collect(),
            };
            for sub_key in sub_keys {
                let Key::Value(value) = &sub_key else { continue };
                let rids = match ts {
                    Some(ts) => record.get_at(&sub_key, ts),
                    None => record.get(&sub_key),
                };
                for sv in rids {
                    if let crate::block::SortValue::Rid(rid) = sv {
                        cube.entry(rid).or_default().entry(key.clone()).or_default().insert(value.clone());
                    }
                }
            }
        }
        Ok(cube)
    }

    /// The full history of `(rid, key)`, oldest first.
    pub fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, DatabaseError> {
        let record = self.select_key(rid, key)?;
        Ok(record
            .history_of(&Key::Text(key.to_string()))
            .into_iter()
            .filter_map(|(version, action, sv)| match sv {
                crate::block::SortValue::Value(v) => Some((version, action, v)),
                _ => None,
            })
            .collect())
    }

    /// The complete history of every field ever written for `rid`.
    pub fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, DatabaseError> {
        let record = self.select(rid)?;
        let mut out = HashMap::new();
        for key in record.history_keys().cloned().collect::<Vec<_>>() {
            let Key::Text(text) = &key else { continue };
            let history = record
                .history_of(&key)
                .into_iter()
                .filter_map(|(v, a, sv)| match sv {
                    crate::block::SortValue::Value(val) => Some((v, a, val)),
                    _ => None,
                })
                .collect();
            out.insert(text.clone(), history);
        }
        Ok(out)
    }

    /// Infix search over `key`'s values for `query`, merged across every
    /// Search block.
    pub fn search(&self, key: &str, query: &str) -> Result<HashSet<Rid>, DatabaseError> {
        let mut record = Record::new(Orientation::Search, Locator::Key(key.to_string()));
        let blocks = self.blocks.read().map_err(|_| DatabaseError::Internal("poisoned".into()))?;
        for block in &blocks.search {
            block.seek(&Locator::Key(key.to_string()), None, &mut record)?;
        }
        drop(blocks);
        Ok(record.search(query))
    }
}

fn block_ids_on_disk(dir: &Path) -> Result<HashSet<u64>, DatabaseError> {
    let mut ids = HashSet::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("blk") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.insert(id);
                }
            }
        }
    }
    Ok(ids)
}

fn remove_block_files(dir: &Path, id: u64) -> Result<(), DatabaseError> {
    for ext in ["blk", "fltr", "indx"] {
        let path = dir.join(format!("{id}.{ext}"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}
