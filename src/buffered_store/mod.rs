//! [`BufferedStore`] — layers a [`Limbo`] over a [`Durable`] store.
//!
//! Every [`crate::atomic::AtomicOperation`] reads through its own
//! `BufferedStore` (a private [`crate::limbo::Queue`] over a view of the
//! underlying store); the [`crate::engine::Engine`] itself is a
//! `BufferedStore` whose Limbo is the disk-backed
//! [`crate::limbo::Buffer`] and whose durable side is the
//! [`crate::database::Database`].
//!
//! The read path always consults the active Limbo before falling through to
//! the durable store, generalized from "one memtable, many SSTables" to
//! "one Limbo (tri-state fast path), one Durable store" and from a single
//! key/value cell to the three Record orientations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use thiserror::Error;

use crate::block::{Locator, Orientation, Revision};
use crate::common::{Action, Operator, Rid, Value, Version, Write};
use crate::lock::Locking;
use crate::record::Record;

#[derive(Debug, Error)]
pub enum BufferedStoreError {
    #[error("limbo error: {0}")]
    Limbo(#[from] crate::limbo::LimboError),
    #[error("durable store error: {0}")]
    Durable(#[from] DurableError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by a [`Durable`] implementation, composed from whatever
/// concrete store backs it (today, only [`crate::database::Database`]).
#[derive(Debug, Error)]
pub enum DurableError {
    #[error("database error: {0}")]
    Database(#[from] crate::database::DatabaseError),
}

/// The read/write surface a durable store must expose to sit under a
/// [`BufferedStore`]. Mirrors [`crate::database::Database`]'s public API so
/// the Engine's `BufferedStore` and any future durable backend compose the
/// same way.
pub trait Durable: Send + Sync {
    fn accept(&self, write: &Write, sync: bool) -> Result<(), DurableError>;
    fn sync(&self) -> Result<(), DurableError>;
    fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, DurableError>;
    fn select(&self, rid: Rid) -> Result<Record, DurableError>;
    fn select_key(&self, rid: Rid, key: &str) -> Result<Record, DurableError>;
    fn secondary_record(&self, key: &str) -> Result<Record, DurableError>;
    fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, HashSet<Value>>, DurableError>;
    fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, DurableError>;
    fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, DurableError>;
    fn search(&self, key: &str, query: &str) -> Result<HashSet<Rid>, DurableError>;
}

impl Durable for crate::database::Database {
    fn accept(&self, write: &Write, sync: bool) -> Result<(), DurableError> {
        Ok(crate::database::Database::accept(self, write, sync)?)
    }

    fn sync(&self) -> Result<(), DurableError> {
        Ok(crate::database::Database::sync(self)?)
    }

    fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, DurableError> {
        Ok(crate::database::Database::verify(self, key, value, rid, ts)?)
    }

    fn select(&self, rid: Rid) -> Result<Record, DurableError> {
        Ok(crate::database::Database::select(self, rid)?)
    }

    fn select_key(&self, rid: Rid, key: &str) -> Result<Record, DurableError> {
        Ok(crate::database::Database::select_key(self, rid, key)?)
    }

    fn secondary_record(&self, key: &str) -> Result<Record, DurableError> {
        Ok(crate::database::Database::secondary_record(self, key)?)
    }

    fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, HashSet<Value>>, DurableError> {
        Ok(crate::database::Database::gather(self, rid, ts)?)
    }

    fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, DurableError> {
        Ok(crate::database::Database::chronologize(self, rid, key)?)
    }

    fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, DurableError> {
        Ok(crate::database::Database::review(self, rid)?)
    }

    fn search(&self, key: &str, query: &str) -> Result<HashSet<Rid>, DurableError> {
        Ok(crate::database::Database::search(self, key, query)?)
    }
}

fn write_applies_at(write: &Write, ts: Option<Version>) -> bool {
    match ts {
        None => true,
        Some(ts) => !write.version.is_assigned() || write.version <= ts,
    }
}

/// Layers a [`crate::limbo::Limbo`] over a [`Durable`] store. Reads
/// materialize the durable side's Record, then fold the Limbo's pending
/// writes on top using [`Record::append`]'s offset algorithm — the same
/// mechanism a Block's revisions use, just sourced from pending Writes
/// instead of on-disk Revisions.
pub struct BufferedStore {
    limbo: Arc<dyn crate::limbo::Limbo>,
    durable: Arc<dyn Durable>,
    /// Read-biased guard preventing a concurrent Transporter pass from
    /// draining the Limbo between a read's "consult durable" and "consult
    /// limbo" steps. `None` for the per-operation `BufferedStore`s that
    /// compose over an already-locked parent view.
    transport_lock: Option<Arc<RwLock<()>>>,
}

impl BufferedStore {
    pub fn new(limbo: Arc<dyn crate::limbo::Limbo>, durable: Arc<dyn Durable>) -> Self {
        Self {
            limbo,
            durable,
            transport_lock: None,
        }
    }

    pub fn with_transport_lock(
        limbo: Arc<dyn crate::limbo::Limbo>,
        durable: Arc<dyn Durable>,
        transport_lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            limbo,
            durable,
            transport_lock: Some(transport_lock),
        }
    }

    pub fn limbo(&self) -> &Arc<dyn crate::limbo::Limbo> {
        &self.limbo
    }

    pub fn durable(&self) -> &Arc<dyn Durable> {
        &self.durable
    }

    fn transport_guard(&self, locking: Locking) -> Option<RwLockReadGuard<'_, ()>> {
        if locking == Locking::Skip {
            return None;
        }
        self.transport_lock.as_ref().map(|l| l.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Append `write` to the Limbo half of this store. The durable half is
    /// only ever populated by the Transporter, never directly by a reader.
    pub fn accept(&self, write: Write, sync: bool) -> Result<(), BufferedStoreError> {
        Ok(self.limbo.insert(write, sync)?)
    }

    pub fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>, locking: Locking) -> Result<bool, BufferedStoreError> {
        match self.limbo.verify(key, value, rid, ts) {
            crate::limbo::TriState::True => Ok(true),
            crate::limbo::TriState::False => Ok(false),
            crate::limbo::TriState::Unsure => {
                let _guard = self.transport_guard(locking);
                Ok(self.durable.verify(key, value, rid, ts)?)
            }
        }
    }

    pub fn select(&self, rid: Rid, locking: Locking) -> Result<Record, BufferedStoreError> {
        let mut record = {
            let _guard = self.transport_guard(locking);
            self.durable.select(rid)?
        };
        for w in self.limbo.writes() {
            if w.rid == rid {
                record.append(Revision::primary(w.rid, w.key, w.value, w.version, w.action));
            }
        }
        Ok(record)
    }

    pub fn select_key(&self, rid: Rid, key: &str, locking: Locking) -> Result<Record, BufferedStoreError> {
        let mut record = {
            let _guard = self.transport_guard(locking);
            self.durable.select_key(rid, key)?
        };
        for w in self.limbo.writes() {
            if w.rid == rid && w.key == key {
                record.append(Revision::primary(w.rid, w.key, w.value, w.version, w.action));
            }
        }
        Ok(record)
    }

    pub fn secondary_record(&self, key: &str, locking: Locking) -> Result<Record, BufferedStoreError> {
        let mut record = {
            let _guard = self.transport_guard(locking);
            self.durable.secondary_record(key)?
        };
        for w in self.limbo.writes() {
            if w.key == key {
                record.append(Revision::secondary(w.key, w.value, w.rid, w.version, w.action));
            }
        }
        Ok(record)
    }

    pub fn explore(&self, key: &str, op: Operator, operands: &[Value], locking: Locking) -> Result<HashMap<Rid, HashSet<Value>>, BufferedStoreError> {
        let record = self.secondary_record(key, locking)?;
        record.explore(op, operands).map_err(|e| BufferedStoreError::Internal(e.to_string()))
    }

    pub fn browse(&self, key: &str, value: &Value, locking: Locking) -> Result<HashSet<Rid>, BufferedStoreError> {
        Ok(self.explore(key, Operator::Equals, std::slice::from_ref(value), locking)?.into_keys().collect())
    }

    pub fn gather(&self, rid: Rid, ts: Option<Version>, locking: Locking) -> Result<HashMap<String, HashSet<Value>>, BufferedStoreError> {
        let mut cube = {
            let _guard = self.transport_guard(locking);
            self.durable.gather(rid, ts)?
        };
        for w in self.limbo.writes() {
            if w.rid != rid || !write_applies_at(&w, ts) {
                continue;
            }
            let values = cube.entry(w.key.clone()).or_default();
            match w.action {
                Action::Add => {
                    values.insert(w.value.clone());
                }
                Action::Remove => {
                    values.retain(|v| !v.eq_case_insensitive(&w.value));
                }
                Action::Compare => {}
            }
        }
        Ok(cube)
    }

    pub fn chronologize(&self, rid: Rid, key: &str, locking: Locking) -> Result<Vec<(Version, Action, Value)>, BufferedStoreError> {
        let mut history = {
            let _guard = self.transport_guard(locking);
            self.durable.chronologize(rid, key)?
        };
        for w in self.limbo.writes() {
            if w.rid == rid && w.key == key {
                history.push((w.version, w.action, w.value));
            }
        }
        Ok(history)
    }

    pub fn review(&self, rid: Rid, locking: Locking) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, BufferedStoreError> {
        let mut review = {
            let _guard = self.transport_guard(locking);
            self.durable.review(rid)?
        };
        for w in self.limbo.writes() {
            if w.rid == rid {
                review.entry(w.key.clone()).or_default().push((w.version, w.action, w.value));
            }
        }
        Ok(review)
    }

    /// Infix search, merged as the symmetric difference of the durable and
    /// Limbo result sets: any RID the Limbo has touched for `key` is
    /// resolved purely from the Limbo's own fold (a pending `REMOVE`
    /// cancels a durable match, a pending `ADD` admits a new one); RIDs the
    /// Limbo never mentioned fall through to the durable answer unchanged.
    pub fn search(&self, key: &str, query: &str, locking: Locking) -> Result<HashSet<Rid>, BufferedStoreError> {
        let durable_hits = {
            let _guard = self.transport_guard(locking);
            self.durable.search(key, query)?
        };

        let mut touched: HashSet<Rid> = HashSet::new();
        let mut pending = Record::new(Orientation::Search, Locator::Key(key.to_string()));
        for w in self.limbo.writes() {
            if w.key != key {
                continue;
            }
            touched.insert(w.rid);
            if !matches!(w.value, Value::Str(_) | Value::Tag(_)) {
                continue;
            }
            for (pos, word) in crate::block::tokenize(&w.value.as_text()) {
                let mut seen = HashSet::new();
                for substring in crate::block::substrings(&word) {
                    if !seen.insert(substring.clone()) {
                        continue;
                    }
                    pending.append(Revision::search(key, substring, w.rid, pos as u32, w.version, w.action));
                }
            }
        }
        let limbo_hits = pending.search(query);

        let mut merged: HashSet<Rid> = durable_hits.into_iter().filter(|r| !touched.contains(r)).collect();
        merged.extend(limbo_hits);
        Ok(merged)
    }

    /// Drain every write currently held in the Limbo into the durable
    /// store, in insertion order, optionally fsyncing the durable side
    /// once the drain completes. Used by [`crate::transporter::Transporter`]
    /// passes.
    pub fn transport(&self, sync: bool) -> Result<usize, BufferedStoreError> {
        let durable = Arc::clone(&self.durable);
        let n = self.limbo.transport(
            &|write| {
                durable.accept(write, false).map_err(|e| crate::limbo::LimboError::Internal(e.to_string()))
            },
            sync,
        )?;
        if sync && n > 0 {
            self.durable.sync()?;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests;
