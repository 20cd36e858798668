//! [`Engine`] — the root [`crate::buffered_store::BufferedStore`]: a
//! disk-backed [`crate::limbo::Buffer`] layered over the
//! [`crate::database::Database`], with a version-change [`Announcer`], a
//! root [`LockBroker`], a read-biased `transportLock`, and a background
//! [`Transporter`] draining the Buffer into the Database.
//!
//! `open()` reconciles on-disk state before accepting traffic, and the
//! whole thing lives behind a single root handle shared via `Arc`. Rather
//! than direct `put`/`get`/`delete` methods, the surface is
//! `start_atomic_operation`/`start_transaction` plus a read surface that
//! forwards through the root `BufferedStore`.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::info;

use crate::atomic::{AtomicError, AtomicOperation, AtomicSupport};
use crate::buffered_store::{BufferedStore, BufferedStoreError, Durable};
use crate::common::{Action, Operator, Rid, Value, Version, Write};
use crate::database::{Database, DatabaseError};
use crate::inventory::{Inventory, InventoryError};
use crate::limbo::{Buffer, Limbo, LimboError};
use crate::lock::{Announcer, Locking, LockBroker, SharedAnnouncer, Token};
use crate::record::Record;
use crate::transaction::{self, Transaction, TransactionError};
use crate::transporter::{Transporter, TransporterConfig};

/// Errors surfaced by [`Engine`] construction and its forwarding read API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("limbo error: {0}")]
    Limbo(#[from] LimboError),
    #[error("buffered store error: {0}")]
    Store(#[from] BufferedStoreError),
    #[error("atomic operation error: {0}")]
    Atomic(#[from] AtomicError),
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for an [`Engine`] instance.
///
/// Bloom false-positive rate and Limbo read-acceleration threshold are
/// compile-time constants elsewhere in the crate
/// ([`crate::block`]'s `BLOCK_BLOOM_FP_RATE`, [`crate::limbo`]'s
/// `ACCELERATION_THRESHOLD`) rather than per-instance knobs: nothing here
/// needs them tunable per environment.
pub struct EngineConfig {
    /// Root directory for this environment's on-disk layout.
    pub root: PathBuf,
    /// Tuning for the background drain worker pool.
    pub transporter: TransporterConfig,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            transporter: TransporterConfig::default(),
        }
    }
}

/// A monotonic, crash-durable version counter. Each mint is fsync'd before
/// it is handed out, so a version once observed by a caller is never
/// reissued after a restart.
struct VersionCounter {
    file: Mutex<fs::File>,
    next: AtomicU64,
}

impl VersionCounter {
    fn open(path: &std::path::Path) -> Result<Self, std::io::Error> {
        use std::io::{Read, Write as _};

        let mut file = fs::OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let mut buf = [0u8; 8];
        let start = match file.read_exact(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(_) => 1,
        };
        Ok(Self {
            file: Mutex::new(file),
            next: AtomicU64::new(start),
        })
    }

    fn peek(&self) -> Version {
        Version(self.next.load(Ordering::SeqCst).saturating_sub(1))
    }

    fn next(&self) -> Result<Version, std::io::Error> {
        use std::io::{Seek, SeekFrom, Write as _};

        let v = self.next.fetch_add(1, Ordering::SeqCst);
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&(v + 1).to_le_bytes())?;
        file.sync_all()?;
        Ok(Version(v))
    }
}

/// The root store: a [`BufferedStore`] over a disk-backed [`Buffer`] and the
/// [`Database`], plus everything an [`AtomicOperation`]/[`Transaction`]
/// needs from its root (`Announcer`, `LockBroker`, version minting) and a
/// background [`Transporter`] keeping the Buffer drained.
pub struct Engine {
    store: Arc<BufferedStore>,
    announcer: SharedAnnouncer,
    broker: Arc<LockBroker>,
    versions: VersionCounter,
    txn_dir: PathBuf,
    txn_counter: AtomicU64,
    transporter: Arc<Transporter>,
}

impl Engine {
    /// Open (or create) an environment rooted at `config.root`: opens the
    /// `Inventory` and `Database`, replays the disk-backed `Buffer`'s WAL,
    /// replays any pending transaction backups left by a crash, then starts
    /// the background `Transporter`.
    pub fn open(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        fs::create_dir_all(&config.root)?;

        let inventory = Arc::new(Inventory::open(config.root.join("inventory"))?);
        let database = Arc::new(Database::open(&config.root, inventory)?);
        let buffer = Arc::new(Buffer::open(config.root.join("buffer"))?);
        let transport_lock = Arc::new(RwLock::new(()));

        let store = Arc::new(BufferedStore::with_transport_lock(
            buffer as Arc<dyn Limbo>,
            database as Arc<dyn Durable>,
            transport_lock,
        ));

        let txn_dir = config.root.join("txn");
        let replayed = transaction::replay_pending(&txn_dir, &store)?;
        if replayed > 0 {
            info!(count = replayed, "engine startup replayed pending transaction backups");
        }

        let versions = VersionCounter::open(&config.root.join("version"))?;
        let transporter = Transporter::start(Arc::clone(&store), config.transporter);

        info!(root = %config.root.display(), "engine opened");

        Ok(Arc::new(Self {
            store,
            announcer: Arc::new(Announcer::new()),
            broker: Arc::new(LockBroker::new()),
            versions,
            txn_dir,
            txn_counter: AtomicU64::new(1),
            transporter,
        }))
    }

    /// Start a fresh [`AtomicOperation`] rooted at this Engine.
    pub fn start_atomic_operation(self: &Arc<Self>) -> Arc<AtomicOperation> {
        AtomicOperation::new(self.clone() as Arc<dyn AtomicSupport>, self.versions.peek())
    }

    /// Start a fresh [`Transaction`] rooted at this Engine, with its backup
    /// file written under `${root}/txn/{id}.txn`.
    pub fn start_transaction(self: &Arc<Self>) -> Arc<Transaction> {
        let id = self.txn_counter.fetch_add(1, Ordering::SeqCst);
        Transaction::new(self.clone() as Arc<dyn AtomicSupport>, self.versions.peek(), self.txn_dir.clone(), id)
    }

    /// A snapshot of the background Transporter's worker pass statistics.
    pub fn transporter_stats(&self) -> Vec<crate::transporter::PassStats> {
        self.transporter.stats()
    }

    /// Force an immediate fsync of the durable side (e.g. before a
    /// controlled shutdown).
    pub fn sync(&self) -> Result<(), EngineError> {
        self.store.durable().sync().map_err(|e| EngineError::Store(BufferedStoreError::Durable(e)))
    }

    // --------------------------------------------------------------------
    // Read surface — forwards to the root BufferedStore, which itself
    // guards durable access with the Engine's transportLock.
    // --------------------------------------------------------------------

    pub fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, EngineError> {
        Ok(self.store.verify(key, value, rid, ts, Locking::Default)?)
    }

    pub fn select(&self, rid: Rid) -> Result<Record, EngineError> {
        Ok(self.store.select(rid, Locking::Default)?)
    }

    pub fn select_key(&self, rid: Rid, key: &str) -> Result<Record, EngineError> {
        Ok(self.store.select_key(rid, key, Locking::Default)?)
    }

    pub fn explore(&self, key: &str, op: Operator, operands: &[Value]) -> Result<HashMap<Rid, HashSet<Value>>, EngineError> {
        Ok(self.store.explore(key, op, operands, Locking::Default)?)
    }

    pub fn browse(&self, key: &str, value: &Value) -> Result<HashSet<Rid>, EngineError> {
        Ok(self.store.browse(key, value, Locking::Default)?)
    }

    pub fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, HashSet<Value>>, EngineError> {
        Ok(self.store.gather(rid, ts, Locking::Default)?)
    }

    pub fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, EngineError> {
        Ok(self.store.chronologize(rid, key, Locking::Default)?)
    }

    pub fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, EngineError> {
        Ok(self.store.review(rid, Locking::Default)?)
    }

    pub fn search(&self, key: &str, query: &str) -> Result<HashSet<Rid>, EngineError> {
        Ok(self.store.search(key, query, Locking::Default)?)
    }
}

impl AtomicSupport for Engine {
    fn view(&self) -> Arc<BufferedStore> {
        self.store.clone()
    }

    fn announcer(&self) -> SharedAnnouncer {
        self.announcer.clone()
    }

    fn lock_broker(&self) -> Option<Arc<LockBroker>> {
        Some(self.broker.clone())
    }

    fn next_version(&self) -> Version {
        // A poisoned version file is an unrecoverable environment fault;
        // this panics for the same reason `wal::Wal::append` does on
        // unrecoverable I/O in the hot write path.
        self.versions.next().expect("version counter persistence failed")
    }

    /// The Engine is the root: fold the committed writes straight into its
    /// own Buffer and announce every token so concurrently-open operations
    /// can detect preemption.
    fn on_child_committed(&self, writes: Vec<Write>, tokens: Vec<Token>) -> Result<(), AtomicError> {
        for w in writes {
            self.store.accept(w, true)?;
        }
        for token in tokens {
            self.announcer.announce(token);
        }
        Ok(())
    }
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<Engine>();
};
