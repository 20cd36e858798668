//! [`Transaction`] — an [`AtomicOperation`] whose private Limbo is a
//! [`crate::limbo::ToggleQueue`] and whose commit is backed by a durable,
//! fsync'd recovery file.
//!
//! The backup file's framing and crash-recovery replay loop follow the
//! [`crate::wal`] module's discipline (length-prefixed records,
//! fsync-before-return, replay-then-clean on restart), narrowed here to a
//! single-shot file per transaction instead of a continuously-appended log.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::atomic::{AtomicError, AtomicOperation, AtomicOperationStatus, AtomicSupport};
use crate::buffered_store::BufferedStore;
use crate::common::{Action, Operator, Rid, Value, Version, Write};
use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};
use crate::lock::Token;
use crate::record::Record;

/// Errors raised by [`Transaction`] operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The underlying operation is no longer OPEN — unlike a plain
    /// [`AtomicError::NotOpen`], callers must not retry: the session is
    /// dead and a fresh Transaction must be started instead.
    #[error("transaction session is dead (status: {0:?})")]
    DeadSession(AtomicOperationStatus),
    /// An error from the wrapped [`AtomicOperation`].
    #[error("atomic operation error: {0}")]
    Atomic(#[from] AtomicError),
    /// The backup file could not be written or read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The backup file's framing was corrupt.
    #[error("corrupt transaction backup: {0}")]
    Corrupt(String),
}

impl From<EncodingError> for TransactionError {
    fn from(e: EncodingError) -> Self {
        TransactionError::Corrupt(e.to_string())
    }
}

fn is_dead(e: &AtomicError) -> bool {
    matches!(e, AtomicError::NotOpen(_) | AtomicError::Preempted)
}

/// Serialize `(locks, writes)` into the backup-file wire format:
/// `[u32 locksByteLength][locks...][writes...]`.
fn encode_backup(locks: &[Token], writes: &[Write]) -> Result<Vec<u8>, EncodingError> {
    let mut locks_buf = Vec::new();
    encode_vec(locks, &mut locks_buf)?;

    let mut out = Vec::new();
    (locks_buf.len() as u32).encode_to(&mut out)?;
    out.extend_from_slice(&locks_buf);
    encode_vec(writes, &mut out)?;
    Ok(out)
}

/// Inverse of [`encode_backup`].
fn decode_backup(buf: &[u8]) -> Result<(Vec<Token>, Vec<Write>), EncodingError> {
    let (locks_len, mut offset) = u32::decode_from(buf)?;
    let locks_len = locks_len as usize;
    if offset + locks_len > buf.len() {
        return Err(EncodingError::UnexpectedEof {
            needed: offset + locks_len,
            available: buf.len(),
        });
    }
    let (locks, _) = decode_vec::<Token>(&buf[offset..offset + locks_len])?;
    offset += locks_len;
    let (writes, n) = decode_vec::<Write>(&buf[offset..])?;
    offset += n;
    let _ = offset;
    Ok((locks, writes))
}

/// An [`AtomicOperation`] over a [`crate::limbo::ToggleQueue`], recoverable
/// across a crash via a backup file written under
/// `${buffer}/txn/{id}.txn`.
///
/// Single-threaded, like every `AtomicOperation`: a `Transaction` must not
/// be shared across threads.
pub struct Transaction {
    inner: Arc<AtomicOperation>,
    txn_dir: PathBuf,
    id: u64,
}

impl Transaction {
    /// Construct a Transaction rooted at `parent` (normally the Engine),
    /// identified by `id`, with backup files written under `txn_dir`
    /// (the Engine's `${buffer}/txn` directory).
    pub fn new(parent: Arc<dyn AtomicSupport>, now: Version, txn_dir: impl Into<PathBuf>, id: u64) -> Arc<Self> {
        let own_limbo: Arc<dyn crate::limbo::Limbo> = Arc::new(crate::limbo::ToggleQueue::new());
        let inner = AtomicOperation::new_with_limbo(parent, now, own_limbo);
        Arc::new(Self {
            inner,
            txn_dir: txn_dir.into(),
            id,
        })
    }

    fn backup_path(&self) -> PathBuf {
        self.txn_dir.join(format!("{}.txn", self.id))
    }

    // --------------------------------------------------------------------
    // Reads — plain forwarding to the wrapped AtomicOperation
    // --------------------------------------------------------------------

    pub fn verify(&self, key: &str, value: &Value, rid: Rid, ts: Option<Version>) -> Result<bool, TransactionError> {
        self.inner.verify(key, value, rid, ts).map_err(Into::into)
    }

    pub fn select(&self, rid: Rid) -> Result<Record, TransactionError> {
        self.inner.select(rid).map_err(Into::into)
    }

    pub fn select_key(&self, rid: Rid, key: &str) -> Result<Record, TransactionError> {
        self.inner.select_key(rid, key).map_err(Into::into)
    }

    pub fn explore(&self, key: &str, op: Operator, operands: &[Value]) -> Result<HashMap<Rid, HashSet<Value>>, TransactionError> {
        self.inner.explore(key, op, operands).map_err(Into::into)
    }

    pub fn browse(&self, key: &str, value: &Value) -> Result<HashSet<Rid>, TransactionError> {
        self.inner.browse(key, value).map_err(Into::into)
    }

    pub fn gather(&self, rid: Rid, ts: Option<Version>) -> Result<HashMap<String, HashSet<Value>>, TransactionError> {
        self.inner.gather(rid, ts).map_err(Into::into)
    }

    pub fn chronologize(&self, rid: Rid, key: &str) -> Result<Vec<(Version, Action, Value)>, TransactionError> {
        self.inner.chronologize(rid, key).map_err(Into::into)
    }

    pub fn review(&self, rid: Rid) -> Result<HashMap<String, Vec<(Version, Action, Value)>>, TransactionError> {
        self.inner.review(rid).map_err(Into::into)
    }

    pub fn search(&self, key: &str, query: &str) -> Result<HashSet<Rid>, TransactionError> {
        self.inner.search(key, query).map_err(Into::into)
    }

    pub fn status(&self) -> AtomicOperationStatus {
        self.inner.status()
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    pub fn write(&self, key: impl Into<String>, value: Value, rid: Rid, action: Action) -> Result<(), TransactionError> {
        self.inner.write(key, value, rid, action).map_err(Into::into)
    }

    // --------------------------------------------------------------------
    // Commit
    // --------------------------------------------------------------------

    /// Acquire locks, serialize and fsync a recovery backup, apply the
    /// writes, then delete the backup. Returns `Ok(false)` on ordinary
    /// commit failure (preemption/lock contention) — the caller may start a
    /// fresh Transaction and retry. A `TransactionError::DeadSession` or
    /// `Io`/`Corrupt` error means the session itself cannot be retried.
    pub fn commit(&self) -> Result<bool, TransactionError> {
        let version = match self.inner.prepare_and_version() {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(false),
            Err(e) if is_dead(&e) => return Err(TransactionError::DeadSession(self.inner.status())),
            Err(e) => return Err(e.into()),
        };

        self.inner.stamp_pending_version(version);
        let writes = self.inner.pending_writes();
        let locks = self.inner.held_tokens();

        if writes.is_empty() {
            self.inner.complete(version)?;
            return Ok(true);
        }

        fs::create_dir_all(&self.txn_dir)?;
        let backup_bytes = encode_backup(&locks, &writes)?;
        let path = self.backup_path();
        {
            let mut file = fs::File::create(&path)?;
            file.write_all(&backup_bytes)?;
            file.sync_all()?;
        }
        debug!(id = self.id, writes = writes.len(), "transaction backup written");

        self.inner.complete(version)?;

        fs::remove_file(&path)?;
        debug!(id = self.id, "transaction backup removed after commit");
        Ok(true)
    }

    pub fn cancel(&self) -> Result<(), TransactionError> {
        self.inner.cancel().map_err(Into::into)
    }

    pub fn start_atomic_operation(self: &Arc<Self>) -> Arc<AtomicOperation> {
        self.inner.start_atomic_operation()
    }
}

/// Scan `txn_dir` for leftover backup files (a transaction that crashed
/// between its fsync and its post-apply delete) and replay each one
/// directly into `view`, with sync-and-verify: every replayed write is
/// applied through `view.accept` and, per CON-83, a duplicate apply is a
/// no-op at the `present`-state level even if the file is replayed more
/// than once. A file whose framing fails to decode is logged and removed
/// rather than blocking Engine startup.
pub fn replay_pending(txn_dir: &Path, view: &BufferedStore) -> Result<usize, TransactionError> {
    if !txn_dir.exists() {
        return Ok(0);
    }

    let mut replayed = 0;
    let mut entries: Vec<PathBuf> = fs::read_dir(txn_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txn"))
        .collect();
    entries.sort();

    for path in entries {
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read transaction backup, removing");
                let _ = fs::remove_file(&path);
                continue;
            }
        };

        match decode_backup(&bytes) {
            Ok((_locks, writes)) => {
                for w in &writes {
                    if let Err(e) = view.accept(w.clone(), true) {
                        error!(path = %path.display(), error = %e, "failed to replay transaction write");
                    }
                }
                replayed += writes.len();
                debug!(path = %path.display(), count = writes.len(), "transaction backup replayed");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt transaction backup, removing");
            }
        }

        if let Err(e) = fs::remove_file(&path) {
            error!(path = %path.display(), error = %e, "failed to remove transaction backup after replay");
        }
    }

    Ok(replayed)
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<Transaction>();
};
