//! The Limbo: an ordered, append-only sequence of [`Write`]s.
//!
//! Three variants share the [`Limbo`] trait: [`Queue`] (memory-only, used by
//! every [`crate::atomic::AtomicOperation`]'s private staging area),
//! [`ToggleQueue`] (the [`crate::transaction::Transaction`] variant that
//! collapses duplicate toggles of the same topic), and [`Buffer`] (the
//! Engine's disk-backed, paged, fsyncable Limbo, built on
//! [`crate::wal::Wal`]).
//!
//! `BTreeMap`-per-key versioning under an `Arc<RwLock<_>>` guard, generalized
//! from `Put`/`Delete`/`RangeDelete` to the single
//! `Write{key,value,rid,version,action}` shape; `Buffer` wraps
//! `wal::Wal<Write>` directly instead of re-deriving a bespoke paged format.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use bloomfilter::Bloom;
use thiserror::Error;
use tracing::{debug, trace};

use crate::common::{Action, Rid, Value, Version, Write};
use crate::wal::{Wal, WalError};

/// Errors raised by Limbo operations.
#[derive(Debug, Error)]
pub enum LimboError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Tri-state answer from a fast-path membership probe: `Unsure` means the
/// caller must fall back to a slower, authoritative source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Unsure,
}

/// Threshold (in accumulated writes) above which read acceleration
/// structures (bloom filter + RID→key→values table) are built.
pub const ACCELERATION_THRESHOLD: usize = 10;

/// Common behavior shared by every Limbo variant.
pub trait Limbo: Send + Sync {
    /// Append `write`. `sync` is advisory: memory-only variants ignore it.
    fn insert(&self, write: Write, sync: bool) -> Result<(), LimboError>;

    /// A snapshot of all writes currently held, in insertion order.
    fn writes(&self) -> Vec<Write>;

    /// Number of writes currently held.
    fn len(&self) -> usize {
        self.writes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every write to `dst` in order, honoring `sync` the same way
    /// `insert` does, then clear this Limbo.
    fn transport(&self, dst: &dyn Fn(&Write) -> Result<(), LimboError>, sync: bool) -> Result<usize, LimboError>;

    /// Rewrite every held write in place via `f` (used to stamp the commit
    /// version onto every write just before transport).
    fn transform(&self, f: &dyn Fn(&mut Write));

    /// Fold the queue to determine the current ADD/REMOVE state for
    /// `(key, value, rid)` at or before `ts` (or at the current tail if
    /// `ts` is `None`).
    fn get_last_write_action(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Option<Action>;

    /// Tri-state verify: `True`/`False` when this Limbo holds an
    /// authoritative last toggle for `(key, value, rid)`, `Unsure` when it
    /// holds no information at all and the caller (normally
    /// [`crate::buffered_store::BufferedStore`]) must fall back to the
    /// durable side. A Limbo never asserts `False` for a topic it has never
    /// seen — only an explicit `REMOVE` toggle is authoritative `False`.
    fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> TriState {
        match self.get_last_write_action(key, value, rid, ts) {
            Some(Action::Add) => TriState::True,
            Some(Action::Remove) | Some(Action::Compare) => TriState::False,
            None => TriState::Unsure,
        }
    }
}

fn fold_action(writes: &[Write], key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Option<Action> {
    let mut result = None;
    for w in writes {
        if let Some(ts) = ts {
            if w.version.is_assigned() && w.version > ts {
                continue;
            }
        }
        if w.rid == rid && w.key == key && w.value.eq_case_insensitive(value) {
            result = Some(w.action);
        }
    }
    result
}

// ------------------------------------------------------------------------------------------------
// Read acceleration
// ------------------------------------------------------------------------------------------------

/// `(key, value, rid)` triple hashed into the acceleration bloom filter.
fn triple_bytes(key: &str, value: &Value, rid: Rid) -> Vec<u8> {
    let mut v = Vec::with_capacity(key.len() + 16);
    v.extend_from_slice(key.as_bytes());
    v.push(0);
    v.extend_from_slice(value.as_text().to_lowercase().as_bytes());
    v.push(0);
    v.extend_from_slice(&rid.get().to_le_bytes());
    v
}

struct Accel {
    bloom: Bloom<Vec<u8>>,
    table: HashMap<Rid, HashMap<String, Vec<Value>>>,
}

impl Accel {
    fn build(writes: &[Write]) -> Self {
        let n = writes.len().max(1);
        let mut bloom = Bloom::new_for_fp_rate(n, 0.01).unwrap_or_else(|_| {
            Bloom::new_for_fp_rate(1, 0.01).expect("fallback bloom parameters are always valid")
        });
        let mut table: HashMap<Rid, HashMap<String, Vec<Value>>> = HashMap::new();
        for w in writes {
            bloom.set(&triple_bytes(&w.key, &w.value, w.rid));
            apply_to_table(&mut table, w);
        }
        Self { bloom, table }
    }

    fn apply(&mut self, write: &Write) {
        self.bloom.set(&triple_bytes(&write.key, &write.value, write.rid));
        apply_to_table(&mut self.table, write);
    }
}

fn apply_to_table(table: &mut HashMap<Rid, HashMap<String, Vec<Value>>>, write: &Write) {
    let per_key = table.entry(write.rid).or_default();
    let values = per_key.entry(write.key.clone()).or_default();
    match write.action {
        Action::Add => {
            if !values.iter().any(|v| v.eq_case_insensitive(&write.value)) {
                values.push(write.value.clone());
            }
        }
        Action::Remove => {
            values.retain(|v| !v.eq_case_insensitive(&write.value));
        }
        Action::Compare => {}
    }
}

// ------------------------------------------------------------------------------------------------
// Queue
// ------------------------------------------------------------------------------------------------

struct QueueInner {
    writes: Vec<Write>,
    accel: Option<Accel>,
}

/// Memory-only [`Limbo`]: O(1) insert, O(n) scan, optional read
/// acceleration once the held write count crosses
/// [`ACCELERATION_THRESHOLD`].
pub struct Queue {
    inner: RwLock<QueueInner>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(QueueInner {
                writes: Vec::new(),
                accel: None,
            }),
        }
    }

    fn maybe_accelerate(inner: &mut QueueInner) {
        if inner.accel.is_none() && inner.writes.len() >= ACCELERATION_THRESHOLD {
            debug!(count = inner.writes.len(), "limbo queue read acceleration built");
            inner.accel = Some(Accel::build(&inner.writes));
        }
    }
}

impl Limbo for Queue {
    fn insert(&self, write: Write, _sync: bool) -> Result<(), LimboError> {
        let mut inner = self.inner.write().map_err(|_| LimboError::Internal("poisoned".into()))?;
        if let Some(accel) = inner.accel.as_mut() {
            accel.apply(&write);
        }
        inner.writes.push(write);
        Self::maybe_accelerate(&mut inner);
        Ok(())
    }

    fn writes(&self) -> Vec<Write> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).writes.clone()
    }

    fn transport(&self, dst: &dyn Fn(&Write) -> Result<(), LimboError>, _sync: bool) -> Result<usize, LimboError> {
        let mut inner = self.inner.write().map_err(|_| LimboError::Internal("poisoned".into()))?;
        for w in &inner.writes {
            dst(w)?;
        }
        let n = inner.writes.len();
        inner.writes.clear();
        inner.accel = None;
        trace!(count = n, "queue transported");
        Ok(n)
    }

    fn transform(&self, f: &dyn Fn(&mut Write)) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for w in inner.writes.iter_mut() {
            f(w);
        }
        inner.accel = None;
    }

    fn get_last_write_action(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Option<Action> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        fold_action(&inner.writes, key, value, rid, ts)
    }

    fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> TriState {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if ts.is_none() {
            if let Some(accel) = inner.accel.as_ref() {
                if !accel.bloom.check(&triple_bytes(key, value, rid)) {
                    // Negative bloom answer is authoritative about this
                    // Limbo only: the triple was never toggled here, so the
                    // caller must consult the durable side.
                    return TriState::Unsure;
                }
                // Bloom positive: fall through to the authoritative full
                // fold below rather than trusting the coarser table, which
                // cannot distinguish "never mentioned" from "removed".
            }
        }
        match fold_action(&inner.writes, key, value, rid, ts) {
            Some(Action::Add) => TriState::True,
            Some(Action::Remove) | Some(Action::Compare) => TriState::False,
            None => TriState::Unsure,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ToggleQueue
// ------------------------------------------------------------------------------------------------

/// A [`Queue`] variant that never lets two writes to the same `(key,
/// value, rid)` topic coexist: a later `insert` for an already-held topic
/// replaces the earlier entry in place, preserving its original position.
/// Used by [`crate::transaction::Transaction`] so a backup file never needs
/// to replay more than one toggle per topic.
pub struct ToggleQueue {
    inner: RwLock<ToggleInner>,
}

struct ToggleInner {
    writes: Vec<Write>,
    index: HashMap<(String, String, Rid), usize>,
}

fn topic_key(w: &Write) -> (String, String, Rid) {
    (w.key.clone(), w.value.as_text().to_lowercase(), w.rid)
}

impl Default for ToggleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ToggleQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ToggleInner {
                writes: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }
}

impl Limbo for ToggleQueue {
    fn insert(&self, write: Write, _sync: bool) -> Result<(), LimboError> {
        let mut inner = self.inner.write().map_err(|_| LimboError::Internal("poisoned".into()))?;
        let topic = topic_key(&write);
        if let Some(&idx) = inner.index.get(&topic) {
            inner.writes[idx] = write;
        } else {
            let idx = inner.writes.len();
            inner.writes.push(write);
            inner.index.insert(topic, idx);
        }
        Ok(())
    }

    fn writes(&self) -> Vec<Write> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).writes.clone()
    }

    fn transport(&self, dst: &dyn Fn(&Write) -> Result<(), LimboError>, _sync: bool) -> Result<usize, LimboError> {
        let mut inner = self.inner.write().map_err(|_| LimboError::Internal("poisoned".into()))?;
        for w in &inner.writes {
            dst(w)?;
        }
        let n = inner.writes.len();
        inner.writes.clear();
        inner.index.clear();
        Ok(n)
    }

    fn transform(&self, f: &dyn Fn(&mut Write)) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for w in inner.writes.iter_mut() {
            f(w);
        }
    }

    fn get_last_write_action(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Option<Action> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        fold_action(&inner.writes, key, value, rid, ts)
    }
}

// ------------------------------------------------------------------------------------------------
// Buffer — the Engine's disk-backed Limbo
// ------------------------------------------------------------------------------------------------

/// The Engine's disk-backed, paged, fsyncable Limbo: a [`Queue`] mirrored
/// into a [`Wal`] so pending writes survive a crash before the background
/// Transporter drains them into the Database.
pub struct Buffer {
    queue: Queue,
    wal: RwLock<Wal<Write>>,
}

impl Buffer {
    /// Open (or create, replaying any existing content into the in-memory
    /// mirror) the Buffer's backing WAL segment at `<dir>/wal-000001.log`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, LimboError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| LimboError::Internal(e.to_string()))?;
        let path = dir.join("wal-000001.log");
        let wal = Wal::<Write>::open(&path, None)?;

        let queue = Queue::new();
        for record in wal.replay_iter()? {
            let write = record?;
            queue.insert(write, false)?;
        }
        debug!(path = %path.display(), count = queue.len(), "buffer replayed from WAL");

        Ok(Self {
            queue,
            wal: RwLock::new(wal),
        })
    }
}

impl Limbo for Buffer {
    fn insert(&self, write: Write, sync: bool) -> Result<(), LimboError> {
        let wal = self.wal.read().map_err(|_| LimboError::Internal("poisoned".into()))?;
        wal.append(&write)?;
        drop(wal);
        let _ = sync; // every WAL append is already fsync'd
        self.queue.insert(write, sync)
    }

    fn writes(&self) -> Vec<Write> {
        self.queue.writes()
    }

    fn transport(&self, dst: &dyn Fn(&Write) -> Result<(), LimboError>, sync: bool) -> Result<usize, LimboError> {
        let n = self.queue.transport(dst, sync)?;
        let mut wal = self.wal.write().map_err(|_| LimboError::Internal("poisoned".into()))?;
        wal.truncate()?;
        Ok(n)
    }

    fn transform(&self, f: &dyn Fn(&mut Write)) {
        self.queue.transform(f);
    }

    fn get_last_write_action(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Option<Action> {
        self.queue.get_last_write_action(key, value, rid, ts)
    }

    fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> TriState {
        self.queue.verify(key, value, rid, ts)
    }
}
