//! [`TwoPhaseCommit`] — an [`AtomicOperation`] whose commit is split into a
//! lock-acquisition phase and a separate, externally-triggered apply phase,
//! plus an [`Allocator`] that tracks in-flight instances by an external id.
//!
//! Exists so an external coordinator (e.g. a two-phase-commit protocol
//! spanning more than one store) can hold this participant's locks pending
//! a global decision, without this crate needing to know anything about
//! that protocol.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashMap as Map, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::atomic::{AtomicError, AtomicOperation, AtomicOperationStatus, AtomicSupport};
use crate::common::{Action, Operator, Rid, Value, Version};
use crate::record::Record;

#[derive(Debug, Error)]
pub enum TwoPhaseCommitError {
    #[error("atomic operation error: {0}")]
    Atomic(#[from] AtomicError),
    /// `finish()` was called before a successful `commit()`.
    #[error("two-phase commit {0} has not completed its lock phase")]
    NotPrepared(u64),
    /// `begin()` was called with an id already tracked by the `Allocator`.
    #[error("two-phase commit {0} is already in flight")]
    AlreadyInFlight(u64),
    /// `finish()`/`abort()` named an id the `Allocator` has no record of.
    #[error("no in-flight two-phase commit with id {0}")]
    Unknown(u64),
}

/// An [`AtomicOperation`] whose `complete` is deferred: `commit(version)`
/// only runs the lock-acquisition phase and stashes `version`; a later call
/// to [`TwoPhaseCommit::finish`] rewrites and applies the staged writes.
pub struct TwoPhaseCommit {
    inner: Arc<AtomicOperation>,
    stashed_version: Mutex<Option<Version>>,
}

impl TwoPhaseCommit {
    pub fn new(parent: Arc<dyn AtomicSupport>, now: Version) -> Arc<Self> {
        Arc::new(Self {
            inner: AtomicOperation::new(parent, now),
            stashed_version: Mutex::new(None),
        })
    }

    // --------------------------------------------------------------------
    // Reads — plain forwarding to the wrapped AtomicOperation
    // --------------------------------------------------------------------

    pub fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, TwoPhaseCommitError> {
        self.inner.verify(key, value, rid, ts).map_err(Into::into)
    }

    pub fn select(&self, rid: Rid) -> Result<Record, TwoPhaseCommitError> {
        self.inner.select(rid).map_err(Into::into)
    }

    pub fn select_key(&self, rid: Rid, key: &str) -> Result<Record, TwoPhaseCommitError> {
        self.inner.select_key(rid, key).map_err(Into::into)
    }

    pub fn explore(&self, key: &str, op: Operator, operands: &[Value]) -> Result<HashMap<Rid, HashSet<Value>>, TwoPhaseCommitError> {
        self.inner.explore(key, op, operands).map_err(Into::into)
    }

    pub fn browse(&self, key: &str, value: &Value) -> Result<HashSet<Rid>, TwoPhaseCommitError> {
        self.inner.browse(key, value).map_err(Into::into)
    }

    pub fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, HashSet<Value>>, TwoPhaseCommitError> {
        self.inner.gather(rid, ts).map_err(Into::into)
    }

    pub fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, TwoPhaseCommitError> {
        self.inner.chronologize(rid, key).map_err(Into::into)
    }

    pub fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, TwoPhaseCommitError> {
        self.inner.review(rid).map_err(Into::into)
    }

    pub fn search(&self, key: &str, query: &str) -> Result<HashSet<Rid>, TwoPhaseCommitError> {
        self.inner.search(key, query).map_err(Into::into)
    }

    pub fn status(&self) -> AtomicOperationStatus {
        self.inner.status()
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    pub fn write(&self, key: impl Into<String>, value: Value, rid: Rid, action: Action) -> Result<(), TwoPhaseCommitError> {
        self.inner.write(key, value, rid, action).map_err(Into::into)
    }

    // --------------------------------------------------------------------
    // Two-phase commit
    // --------------------------------------------------------------------

    /// Phase 1: acquire JIT locks for every accumulated intention and, only
    /// if that succeeds, stash `version` (supplied by the external
    /// coordinator rather than minted locally) for the later [`Self::finish`].
    /// Locks remain held across the call regardless of outcome — a `false`
    /// result means lock acquisition failed and the coordinator must treat
    /// this participant as unable to proceed.
    pub fn commit(&self, version: Version) -> Result<bool, TwoPhaseCommitError> {
        if !self.inner.prepare()? {
            return Ok(false);
        }
        *self.stashed_version.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
        Ok(true)
    }

    /// Phase 2: rewrite every staged write with the stashed version, apply
    /// them, and release locks. Errors with [`TwoPhaseCommitError::NotPrepared`]
    /// if [`Self::commit`] has not yet succeeded for this instance.
    pub fn finish(&self) -> Result<(), TwoPhaseCommitError> {
        let version = self
            .stashed_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TwoPhaseCommitError::NotPrepared(0))?;
        self.inner.complete(version)?;
        Ok(())
    }

    /// Unconditionally release any locks held (whether or not `commit` ever
    /// ran) and mark this instance `Aborted`. There is no rollback path:
    /// once a participant has promised its locks via a successful
    /// `commit`, the only way out besides `finish` is to give them up.
    pub fn abort(&self) {
        self.inner.force_abort();
    }
}

/// Tracks in-flight [`TwoPhaseCommit`] instances keyed by an external
/// coordinator-assigned id, so a coordinator can drive `commit`/`finish`/
/// `abort` across a round trip (e.g. a network call to each participant)
/// without holding the `Arc<TwoPhaseCommit>` itself between calls.
pub struct Allocator {
    parent: Arc<dyn AtomicSupport>,
    inflight: Mutex<Map<u64, Arc<TwoPhaseCommit>>>,
}

impl Allocator {
    pub fn new(parent: Arc<dyn AtomicSupport>) -> Self {
        Self {
            parent,
            inflight: Mutex::new(Map::new()),
        }
    }

    /// Start tracking a fresh `TwoPhaseCommit` under `id`.
    pub fn begin(&self, id: u64, now: Version) -> Result<Arc<TwoPhaseCommit>, TwoPhaseCommitError> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight.contains_key(&id) {
            return Err(TwoPhaseCommitError::AlreadyInFlight(id));
        }
        let txn = TwoPhaseCommit::new(self.parent.clone(), now);
        inflight.insert(id, txn.clone());
        Ok(txn)
    }

    /// The in-flight instance for `id`, if any.
    pub fn get(&self, id: u64) -> Option<Arc<TwoPhaseCommit>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    /// Drive `id`'s phase-2 apply and stop tracking it.
    pub fn finish(&self, id: u64) -> Result<(), TwoPhaseCommitError> {
        let txn = self
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .ok_or(TwoPhaseCommitError::Unknown(id))?;
        txn.finish().map_err(|e| match e {
            TwoPhaseCommitError::NotPrepared(_) => TwoPhaseCommitError::NotPrepared(id),
            other => other,
        })
    }

    /// Abort and stop tracking `id`.
    pub fn abort(&self, id: u64) -> Result<(), TwoPhaseCommitError> {
        let txn = self
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .ok_or(TwoPhaseCommitError::Unknown(id))?;
        txn.abort();
        Ok(())
    }
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<TwoPhaseCommit>();
    _assert_send_sync::<Allocator>();
};
