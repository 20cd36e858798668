//! [`AtomicOperation`] — isolated multi-read/multi-write staging over an
//! [`AtomicSupport`] store (the [`crate::engine::Engine`] or another
//! `AtomicOperation`), committed with JIT locking and optimistic,
//! version-change-driven preemption.
//!
//! The nested "absorb" commit path and nested no-op locking reuse
//! [`crate::lock::LockBroker::no_op`] exactly as a root commit uses
//! `try_read`/`try_write`.


use std::collections::{HashMap, HashSet as Set};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::buffered_store::{BufferedStore, BufferedStoreError, Durable, DurableError};
use crate::common::{Action, ModelError, Operator, Rid, Value, Version, Write};
use crate::lock::{Locking, LockBroker, Permit, SharedAnnouncer, Token, ValueRange};
use crate::record::Record;

#[derive(Debug, Error)]
pub enum AtomicError {
    #[error("operation is not open (current status: {0:?})")]
    NotOpen(AtomicOperationStatus),
    #[error("operation was preempted by a concurrent commit")]
    Preempted,
    #[error("buffered store error: {0}")]
    Store(#[from] BufferedStoreError),
    #[error("durable store error: {0}")]
    Durable(#[from] DurableError),
    #[error("invalid write: {0}")]
    Model(#[from] ModelError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Lifecycle of an [`AtomicOperation`]. Exactly six variants: the
/// original's separate `PREPARED` marker is not reproduced (resolved
/// ambiguity: the JIT lock-acquisition step and the durability stamp happen
/// together in [`AtomicOperation::complete`], so there is no distinct
/// "locked but not yet applied" state worth naming for a plain
/// `AtomicOperation` — [`crate::two_phase_commit::TwoPhaseCommit`] is where
/// that separation actually matters, and it names its own phases).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOperationStatus {
    Open,
    Pending,
    Finalizing,
    Preempted,
    Aborted,
    Committed,
}

/// The store an [`AtomicOperation`] runs against: either the root
/// [`crate::engine::Engine`] or a parent `AtomicOperation` (nested case).
pub trait AtomicSupport: Send + Sync {
    /// The merged read view this operation's own Limbo composes over.
    fn view(&self) -> Arc<BufferedStore>;

    /// The announcer this support broadcasts version-change events on.
    fn announcer(&self) -> SharedAnnouncer;

    /// `Some` for the Engine (root locking); `None` for a nested parent
    /// `AtomicOperation`, in which case the child uses
    /// [`LockBroker::no_op`] for every token and defers real locking to the
    /// root's eventual commit.
    fn lock_broker(&self) -> Option<Arc<LockBroker>>;

    /// Mint the next commit version. Only ever called on the root.
    fn next_version(&self) -> Version;

    /// Invoked once a child's `complete` has rewritten its writes with a
    /// version. The root folds the writes into its own Limbo and announces
    /// the child's tokens; a parent `AtomicOperation` instead absorbs the
    /// child's writes and lock intentions into itself.
    fn on_child_committed(&self, writes: Vec<Write>, tokens: Vec<Token>) -> Result<(), AtomicError>;
}

struct Intentions {
    reads: Set<Token>,
    range_reads: Set<Token>,
    range_read_keys: HashMap<String, Vec<Token>>,
    writes: Set<Token>,
    write_keys: Set<String>,
    exemptions: Set<Token>,
    /// `Field(key)` tokens for every key written, kept separate from
    /// `writes`: these are never handed to `acquireLocks` (a write range
    /// token is "infinitely wide" for announcement purposes only, not a
    /// thing to serialize writers on), but they do ride along with
    /// `complete`'s announcement so a concurrent range reader on the same
    /// key is preempted.
    write_field_tokens: Set<Token>,
}

impl Intentions {
    fn new() -> Self {
        Self {
            reads: Set::new(),
            range_reads: Set::new(),
            range_read_keys: HashMap::new(),
            writes: Set::new(),
            write_keys: Set::new(),
            exemptions: Set::new(),
            write_field_tokens: Set::new(),
        }
    }
}

/// Isolated multi-read/multi-write staging area with JIT-locked,
/// optimistically-preemptible commit. See the module docs for the full
/// commit algorithm.
pub struct AtomicOperation {
    parent: Arc<dyn AtomicSupport>,
    own_limbo: Arc<dyn crate::limbo::Limbo>,
    view: Arc<BufferedStore>,
    status: Mutex<AtomicOperationStatus>,
    intentions: Mutex<Intentions>,
    permits: Mutex<Vec<Permit>>,
    events: crossbeam::channel::Receiver<crate::lock::TokenEvent>,
    queued_field_events: Mutex<Vec<String>>,
    now: Version,
}

struct OperationDurableAdapter(Arc<BufferedStore>);

impl Durable for OperationDurableAdapter {
    fn accept(&self, write: &Write, sync: bool) -> Result<(), DurableError> {
        self.0
            .accept(write.clone(), sync)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn sync(&self) -> Result<(), DurableError> {
        Ok(())
    }

    fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, DurableError> {
        self.0
            .verify(key, value, rid, ts, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn select(&self, rid: Rid) -> Result<Record, DurableError> {
        self.0
            .select(rid, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn select_key(&self, rid: Rid, key: &str) -> Result<Record, DurableError> {
        self.0
            .select_key(rid, key, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn secondary_record(&self, key: &str) -> Result<Record, DurableError> {
        self.0
            .secondary_record(key, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, Set<Value>>, DurableError> {
        self.0
            .gather(rid, ts, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, DurableError> {
        self.0
            .chronologize(rid, key, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, DurableError> {
        self.0
            .review(rid, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }

    fn search(&self, key: &str, query: &str) -> Result<Set<Rid>, DurableError> {
        self.0
            .search(key, query, Locking::Default)
            .map_err(|e| DurableError::Database(crate::database::DatabaseError::Internal(e.to_string())))
    }
}

impl AtomicOperation {
    /// Construct an operation whose private Limbo is a plain
    /// [`crate::limbo::Queue`] — the variant used by the Engine's
    /// `start_atomic_operation()` and by every nested operation.
    pub fn new(parent: Arc<dyn AtomicSupport>, now: Version) -> Arc<Self> {
        Self::new_with_limbo(parent, now, Arc::new(crate::limbo::Queue::new()))
    }

    /// Construct an operation over an arbitrary [`crate::limbo::Limbo`]
    /// implementation. [`crate::transaction::Transaction`] uses this to run
    /// over a [`crate::limbo::ToggleQueue`] instead of a plain `Queue`,
    /// while reusing every other piece of the commit machinery unchanged.
    pub fn new_with_limbo(parent: Arc<dyn AtomicSupport>, now: Version, own_limbo: Arc<dyn crate::limbo::Limbo>) -> Arc<Self> {
        let events = parent.announcer().subscribe();
        let durable = Arc::new(OperationDurableAdapter(parent.view()));
        let view = Arc::new(BufferedStore::new(own_limbo.clone(), durable));
        Arc::new(Self {
            parent,
            own_limbo,
            view,
            status: Mutex::new(AtomicOperationStatus::Open),
            intentions: Mutex::new(Intentions::new()),
            permits: Mutex::new(Vec::new()),
            events,
            queued_field_events: Mutex::new(Vec::new()),
            now,
        })
    }

    /// A snapshot of every write currently staged in this operation's own
    /// Limbo, in insertion order. Used by
    /// [`crate::transaction::Transaction`] to serialize its backup file
    /// before applying.
    pub fn pending_writes(&self) -> Vec<Write> {
        self.own_limbo.writes()
    }

    /// The tokens this operation currently holds permits for. Used by
    /// [`crate::transaction::Transaction`] to populate a backup file's
    /// `LockDescription` records.
    pub fn held_tokens(&self) -> Vec<Token> {
        self.permits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| p.token().clone())
            .collect()
    }

    /// Run `prepare()` and, only if it succeeds, mint the commit version
    /// from the root without applying it yet. Used by
    /// [`crate::transaction::Transaction`] (which must write its backup
    /// file between lock acquisition and apply) and by
    /// [`crate::two_phase_commit::TwoPhaseCommit`] (whose `commit()` is
    /// lock-acquisition only, with `finish()` applying later).
    pub fn prepare_and_version(&self) -> Result<Option<Version>, AtomicError> {
        if !self.prepare()? {
            return Ok(None);
        }
        Ok(Some(self.parent.next_version()))
    }

    /// Stamp `version` onto every write currently staged in this
    /// operation's own Limbo without transporting or releasing locks.
    /// [`crate::transaction::Transaction::commit`] calls this to obtain the
    /// exact versioned writes it serializes into its backup file before
    /// `complete` (which re-stamps the same version idempotently) actually
    /// applies them.
    pub(crate) fn stamp_pending_version(&self, version: Version) {
        self.own_limbo.transform(&|w| w.version = version);
    }

    fn set_status(&self, status: AtomicOperationStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Drain any queued version-change events. Point-token events are
    /// assessed immediately (flip to `Preempted` if this operation holds a
    /// matching, non-exempt intention); range-capable `Field` events are
    /// queued for `assess_range_preemption`.
    fn drain_events(&self) {
        loop {
            let event = match self.events.try_recv() {
                Ok(e) => e,
                Err(_) => break,
            };
            if let Token::Field(key) = &event.token {
                self.queued_field_events.lock().unwrap_or_else(|e| e.into_inner()).push(key.clone());
                continue;
            }

            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*status, AtomicOperationStatus::Open | AtomicOperationStatus::Pending) {
                continue;
            }
            let intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
            let is_intention = intentions.reads.contains(&event.token) || intentions.writes.contains(&event.token);
            let exempt = intentions.exemptions.contains(&event.token);
            if is_intention && !exempt {
                debug!(token = ?event.token, "atomic operation preempted by version change");
                *status = AtomicOperationStatus::Preempted;
            }
        }
    }

    fn assess_range_preemption(&self) {
        let queued: Vec<String> = std::mem::take(&mut *self.queued_field_events.lock().unwrap_or_else(|e| e.into_inner()));
        if queued.is_empty() {
            return;
        }
        let intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
        let preempted = queued.iter().any(|key| intentions.range_read_keys.contains_key(key));
        drop(intentions);
        if preempted {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*status, AtomicOperationStatus::Open | AtomicOperationStatus::Pending) {
                *status = AtomicOperationStatus::Preempted;
            }
        }
    }

    pub fn status(&self) -> AtomicOperationStatus {
        self.drain_events();
        self.assess_range_preemption();
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard_open(&self) -> Result<(), AtomicError> {
        self.drain_events();
        let status = *self.status.lock().unwrap_or_else(|e| e.into_inner());
        match status {
            AtomicOperationStatus::Preempted => Err(AtomicError::Preempted),
            AtomicOperationStatus::Open | AtomicOperationStatus::Pending => Ok(()),
            other => Err(AtomicError::NotOpen(other)),
        }
    }

    fn record_read(&self, token: Token) {
        self.intentions.lock().unwrap_or_else(|e| e.into_inner()).reads.insert(token);
    }

    fn record_range_read(&self, key: &str, token: Token) {
        let mut intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
        intentions.range_reads.insert(token.clone());
        intentions.range_read_keys.entry(key.to_string()).or_default().push(token);
    }

    fn is_historical(&self, ts: Option<Version>) -> bool {
        matches!(ts, Some(ts) if ts <= self.now)
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    pub fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, AtomicError> {
        self.guard_open()?;
        if !self.is_historical(ts) {
            self.record_read(Token::wrap_cell(key, rid));
        }
        Ok(self.view.verify(key, value, rid, ts, Locking::Default)?)
    }

    pub fn select(&self, rid: Rid) -> Result<Record, AtomicError> {
        self.guard_open()?;
        self.record_read(Token::wrap_rid(rid));
        Ok(self.view.select(rid, Locking::Default)?)
    }

    pub fn select_key(&self, rid: Rid, key: &str) -> Result<Record, AtomicError> {
        self.guard_open()?;
        self.record_read(Token::wrap_cell(key, rid));
        Ok(self.view.select_key(rid, key, Locking::Default)?)
    }

    pub fn explore(&self, key: &str, op: Operator, operands: &[Value]) -> Result<HashMap<Rid, Set<Value>>, AtomicError> {
        self.guard_open()?;
        self.record_range_read(key, Token::range(key, op, operands.to_vec()));
        Ok(self.view.explore(key, op, operands, Locking::Default)?)
    }

    pub fn browse(&self, key: &str, value: &Value) -> Result<Set<Rid>, AtomicError> {
        Ok(self.explore(key, Operator::Equals, std::slice::from_ref(value))?.into_keys().collect())
    }

    pub fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, Set<Value>>, AtomicError> {
        self.guard_open()?;
        if !self.is_historical(ts) {
            self.record_read(Token::wrap_rid(rid));
        }
        Ok(self.view.gather(rid, ts, Locking::Default)?)
    }

    pub fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, AtomicError> {
        self.guard_open()?;
        self.record_read(Token::wrap_cell(key, rid));
        Ok(self.view.chronologize(rid, key, Locking::Default)?)
    }

    pub fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, AtomicError> {
        self.guard_open()?;
        self.record_read(Token::wrap_rid(rid));
        Ok(self.view.review(rid, Locking::Default)?)
    }

    pub fn search(&self, key: &str, query: &str) -> Result<Set<Rid>, AtomicError> {
        self.guard_open()?;
        self.record_range_read(key, Token::wrap_field(key));
        Ok(self.view.search(key, query, Locking::Default)?)
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Stage a write in this operation's own Limbo and record its lock
    /// intentions: a cell token `(key, rid)`, a "wide" token `(rid)` (added
    /// to `exemptions` too, per CON-669, unless a prior wide *read* for the
    /// same rid already exists — in that case the wide read is a real
    /// dependency and must not be exempted), and a write-range token for
    /// `key` (treated as "infinitely wide": it invalidates every range read
    /// on `key`, not just ones overlapping `value`).
    pub fn write(&self, key: impl Into<String>, value: Value, rid: Rid, action: Action) -> Result<(), AtomicError> {
        self.guard_open()?;
        let key = key.into();
        validate_write(&key, &value)?;

        // A record cannot link to itself. Add and Remove both silently
        // reject the write rather than erroring.
        if let Value::Link(target) = &value {
            if *target == rid {
                return Ok(());
            }
        }

        let cell = Token::wrap_cell(key.clone(), rid);
        let wide = Token::wrap_rid(rid);
        {
            let mut intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
            intentions.writes.insert(cell);
            intentions.writes.insert(wide.clone());
            intentions.write_keys.insert(key.clone());
            intentions.write_field_tokens.insert(Token::wrap_field(key.clone()));
            if !intentions.reads.contains(&wide) {
                intentions.exemptions.insert(wide);
            }
        }

        let write = Write::new(key, value, rid, action);
        self.own_limbo
            .insert(write, false)
            .map_err(|e| AtomicError::Store(BufferedStoreError::Limbo(e)))
    }

    // --------------------------------------------------------------------
    // Commit
    // --------------------------------------------------------------------

    /// Phase 1 of commit: CAS `Open -> Pending`, reassess preemption, then
    /// JIT-acquire every accumulated lock intention (writes first, then
    /// remaining range reads, then remaining point reads). Returns `Ok(true)`
    /// only if every lock was acquired without preemption; any failure
    /// releases whatever was already acquired and transitions to
    /// `Aborted`/`Preempted`. Never panics: commit failure is always a
    /// plain `false`.
    pub fn prepare(&self) -> Result<bool, AtomicError> {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *status != AtomicOperationStatus::Open {
                return Err(AtomicError::NotOpen(*status));
            }
            *status = AtomicOperationStatus::Pending;
        }

        self.drain_events();
        self.assess_range_preemption();
        if *self.status.lock().unwrap_or_else(|e| e.into_inner()) == AtomicOperationStatus::Preempted {
            return Ok(false);
        }

        if self.own_limbo.is_empty() {
            self.set_status(AtomicOperationStatus::Finalizing);
            return Ok(true);
        }

        if !self.acquire_locks()? {
            self.release_all();
            self.set_status(AtomicOperationStatus::Aborted);
            return Ok(false);
        }

        self.drain_events();
        self.assess_range_preemption();
        if *self.status.lock().unwrap_or_else(|e| e.into_inner()) == AtomicOperationStatus::Preempted {
            self.release_all();
            self.set_status(AtomicOperationStatus::Aborted);
            return Ok(false);
        }

        self.set_status(AtomicOperationStatus::Finalizing);
        Ok(true)
    }

    fn acquire_locks(&self) -> Result<bool, AtomicError> {
        let broker = self.parent.lock_broker();

        let (writes, mut range_reads, reads, write_keys) = {
            let intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
            (
                intentions.writes.clone(),
                intentions.range_read_keys.clone(),
                intentions.reads.clone(),
                intentions.write_keys.clone(),
            )
        };

        // A write to `key` carries an infinitely wide range token (§4.6):
        // XOR that coverage against every range-read token recorded for
        // the same key, dropping whichever ones it fully subsumes. Any
        // leftover coverage a token's `xor` didn't clear still needs its
        // own range_read lock below.
        let write_range = ValueRange::everything();
        for (key, tokens) in range_reads.iter_mut() {
            if !write_keys.contains(key) {
                continue;
            }
            tokens.retain(|token| {
                let mut coverage = ValueRange::from_token(token);
                if write_range.intersects(&coverage) {
                    coverage.xor(&write_range);
                }
                !coverage.is_empty()
            });
        }
        range_reads.retain(|_, tokens| !tokens.is_empty());

        let mut acquired = Vec::new();

        for token in &writes {
            let permit = match &broker {
                Some(b) => b.try_write(token),
                None => Ok(LockBroker::no_op(token)),
            };
            match permit {
                Ok(p) => acquired.push(p),
                Err(e) => {
                    trace!(?token, error = %e, "write lock acquisition failed");
                    self.permits.lock().unwrap_or_else(|e| e.into_inner()).extend(acquired);
                    return Ok(false);
                }
            }
        }

        for tokens in range_reads.values() {
            for token in tokens {
                let permit = match &broker {
                    Some(b) => b.try_read(token),
                    None => Ok(LockBroker::no_op(token)),
                };
                match permit {
                    Ok(p) => acquired.push(p),
                    Err(e) => {
                        trace!(?token, error = %e, "range read lock acquisition failed");
                        self.permits.lock().unwrap_or_else(|e| e.into_inner()).extend(acquired);
                        return Ok(false);
                    }
                }
            }
        }

        for token in &reads {
            if writes.contains(token) {
                continue;
            }
            let permit = match &broker {
                Some(b) => b.try_read(token),
                None => Ok(LockBroker::no_op(token)),
            };
            match permit {
                Ok(p) => acquired.push(p),
                Err(e) => {
                    trace!(?token, error = %e, "read lock acquisition failed");
                    self.permits.lock().unwrap_or_else(|e| e.into_inner()).extend(acquired);
                    return Ok(false);
                }
            }
        }

        self.permits.lock().unwrap_or_else(|e| e.into_inner()).extend(acquired);
        Ok(true)
    }

    fn release_all(&self) {
        let broker = self.parent.lock_broker();
        let permits = std::mem::take(&mut *self.permits.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(broker) = broker {
            for permit in permits {
                broker.release(permit);
            }
        }
    }

    /// Phase 2 of commit: rewrite every staged write with `version`,
    /// notify the parent (which either folds the writes into the Engine's
    /// Limbo and announces tokens, or absorbs them into a parent
    /// operation), release locks, and transition to `Committed`.
    pub fn complete(&self, version: Version) -> Result<(), AtomicError> {
        {
            let status = *self.status.lock().unwrap_or_else(|e| e.into_inner());
            if status != AtomicOperationStatus::Finalizing {
                return Err(AtomicError::NotOpen(status));
            }
        }

        self.own_limbo.transform(&|w| w.version = version);
        let writes = self.own_limbo.writes();

        let tokens: Vec<Token> = {
            let intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
            intentions
                .writes
                .iter()
                .chain(intentions.write_field_tokens.iter())
                .cloned()
                .collect()
        };

        self.parent.on_child_committed(writes, tokens)?;
        self.release_all();
        self.set_status(AtomicOperationStatus::Committed);
        Ok(())
    }

    /// Convenience wrapping `prepare` + `complete` for a root (Engine-
    /// parented) operation: mints the next version from the parent only if
    /// locking succeeds.
    pub fn commit(&self) -> Result<bool, AtomicError> {
        if !self.prepare()? {
            return Ok(false);
        }
        let version = self.parent.next_version();
        self.complete(version)?;
        Ok(true)
    }

    /// Abort an in-flight operation: releases any locks already acquired
    /// and transitions to `Aborted`. Valid from `Open` or `Pending`; any
    /// other state is a state error — a dead or committed operation cannot
    /// be cancelled twice.
    pub fn cancel(&self) -> Result<(), AtomicError> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*status, AtomicOperationStatus::Open | AtomicOperationStatus::Pending) {
            return Err(AtomicError::NotOpen(*status));
        }
        *status = AtomicOperationStatus::Aborted;
        drop(status);
        self.release_all();
        warn!("atomic operation cancelled");
        Ok(())
    }

    /// Unconditionally release whatever locks are held and transition to
    /// `Aborted`, regardless of current status. Used by
    /// [`crate::two_phase_commit::TwoPhaseCommit::abort`], which must be
    /// able to give up a coordinator-held commit even after its own
    /// `prepare()` has already moved it past `Pending` into `Finalizing`.
    pub(crate) fn force_abort(&self) {
        self.release_all();
        self.set_status(AtomicOperationStatus::Aborted);
        warn!("atomic operation force-aborted");
    }

    /// Start a nested `AtomicOperation` whose parent is `self`: the child
    /// uses a no-op lock broker (all real locking defers to this
    /// operation's eventual root commit) and its commit is implemented as
    /// "absorb" — folding into `self` rather than acquiring its own locks.
    pub fn start_atomic_operation(self: &Arc<Self>) -> Arc<AtomicOperation> {
        AtomicOperation::new(self.clone() as Arc<dyn AtomicSupport>, self.now)
    }
}

impl AtomicSupport for AtomicOperation {
    fn view(&self) -> Arc<BufferedStore> {
        self.view.clone()
    }

    fn announcer(&self) -> SharedAnnouncer {
        self.parent.announcer()
    }

    fn lock_broker(&self) -> Option<Arc<LockBroker>> {
        None
    }

    fn next_version(&self) -> Version {
        Version::NO_VERSION
    }

    /// Absorb: only permitted while `self` is `Finalizing` (mid-commit) or
    /// `Pending`. Folds the child's writes straight into this operation's
    /// own Limbo and its tokens into this operation's write intentions, so
    /// they ride along with `self`'s own eventual commit.
    fn on_child_committed(&self, writes: Vec<Write>, tokens: Vec<Token>) -> Result<(), AtomicError> {
        let status = *self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status != AtomicOperationStatus::Finalizing && status != AtomicOperationStatus::Pending {
            return Err(AtomicError::NotOpen(status));
        }
        for w in writes {
            self.own_limbo
                .insert(w, false)
                .map_err(|e| AtomicError::Store(BufferedStoreError::Limbo(e)))?;
        }
        let mut intentions = self.intentions.lock().unwrap_or_else(|e| e.into_inner());
        for token in tokens {
            intentions.writes.insert(token);
        }
        Ok(())
    }
}

/// InvalidInput checks shared by every write path: the key must be
/// non-empty and the value must not be "blank" (an empty string/tag/blob).
fn validate_write(key: &str, value: &Value) -> Result<(), ModelError> {
    if key.is_empty() {
        return Err(ModelError::InvalidKey(key.to_string()));
    }
    if value.is_blank() {
        return Err(ModelError::BlankValue(key.to_string()));
    }
    Ok(())
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<AtomicOperation>();
};
