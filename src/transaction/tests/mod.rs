use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::tempdir;

use crate::atomic::{AtomicError, AtomicOperationStatus, AtomicSupport};
use crate::buffered_store::BufferedStore;
use crate::common::{Action, Rid, Value, Version, Write};
use crate::database::Database;
use crate::inventory::Inventory;
use crate::limbo::Queue;
use crate::lock::{Announcer, LockBroker, SharedAnnouncer, Token};
use crate::transaction::{Transaction, replay_pending};

/// Same minimal root harness as `crate::atomic::tests`, standing in for the
/// not-yet-built Engine.
struct Root {
    view: Arc<BufferedStore>,
    broker: Arc<LockBroker>,
    announcer: SharedAnnouncer,
    next_version: AtomicU64,
}

impl Root {
    fn new(dir: &std::path::Path) -> Arc<Self> {
        let inventory = Arc::new(Inventory::open(dir.join("inventory")).unwrap());
        let db = Arc::new(Database::open(dir, inventory).unwrap());
        let view = Arc::new(BufferedStore::new(Arc::new(Queue::new()), db));
        Arc::new(Self {
            view,
            broker: Arc::new(LockBroker::new()),
            announcer: Arc::new(Announcer::new()),
            next_version: AtomicU64::new(1),
        })
    }
}

impl AtomicSupport for Root {
    fn view(&self) -> Arc<BufferedStore> {
        self.view.clone()
    }

    fn announcer(&self) -> SharedAnnouncer {
        self.announcer.clone()
    }

    fn lock_broker(&self) -> Option<Arc<LockBroker>> {
        Some(self.broker.clone())
    }

    fn next_version(&self) -> Version {
        Version(self.next_version.fetch_add(1, Ordering::SeqCst))
    }

    fn on_child_committed(&self, writes: Vec<Write>, tokens: Vec<Token>) -> Result<(), AtomicError> {
        for w in writes {
            self.view.accept(w, false).map_err(AtomicError::Store)?;
        }
        for t in tokens {
            self.announcer.announce(t);
        }
        Ok(())
    }
}

fn rid(n: u64) -> Rid {
    Rid::new(n)
}

#[test]
fn commit_writes_and_then_removes_its_own_backup_file() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("txn");

    let txn = Transaction::new(root.clone(), Version(0), &txn_dir, 1);
    txn.write("name", Value::Str("Alice".into()), rid(1), Action::Add).unwrap();
    assert!(txn.commit().unwrap());

    // the backup file must not survive a successful commit
    assert!(!txn_dir.join("1.txn").exists());

    let verify = crate::atomic::AtomicOperation::new(root.clone(), Version(0));
    assert!(verify.verify("name", &Value::Str("Alice".into()), rid(1), None).unwrap());
}

#[test]
fn empty_commit_never_creates_a_backup_directory() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("txn");

    let txn = Transaction::new(root.clone(), Version(0), &txn_dir, 1);
    assert!(txn.commit().unwrap());
    assert!(!txn_dir.exists());
}

#[test]
fn preempted_transaction_commit_returns_false_and_is_dead_after() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("txn");

    let seed = crate::atomic::AtomicOperation::new(root.clone(), Version(0));
    seed.write("age", Value::Int(1), rid(5), Action::Add).unwrap();
    assert!(seed.commit().unwrap());

    let t1 = Transaction::new(root.clone(), Version(0), &txn_dir, 1);
    assert!(t1.verify("age", &Value::Int(1), rid(5), None).unwrap());

    let t2 = crate::atomic::AtomicOperation::new(root.clone(), Version(0));
    t2.write("age", Value::Int(2), rid(5), Action::Add).unwrap();
    assert!(t2.commit().unwrap());

    t1.write("age", Value::Int(3), rid(5), Action::Add).unwrap();
    assert!(!t1.commit().unwrap());
    assert_eq!(t1.status(), AtomicOperationStatus::Preempted);

    // the session is dead: a further commit attempt is a DeadSession, not a
    // silent false
    match t1.commit() {
        Err(crate::transaction::TransactionError::DeadSession(AtomicOperationStatus::Preempted)) => {}
        other => panic!("expected DeadSession(Preempted), got {other:?}"),
    }
}

#[test]
fn replay_pending_applies_a_leftover_backup_file_left_by_a_simulated_crash() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("txn");
    std::fs::create_dir_all(&txn_dir).unwrap();

    // Build the exact backup bytes a real commit would have written, then
    // drop them on disk directly rather than going through Transaction::commit
    // — simulating a crash between fsync and the post-apply delete.
    let version = Version(1);
    let mut write = Write::new("city", Value::Str("Berlin".into()), rid(7), Action::Add);
    write.version = version;

    let locks = vec![Token::wrap_cell("city", rid(7))];
    let bytes = super::encode_backup(&locks, &[write.clone()]).unwrap();
    std::fs::write(txn_dir.join("42.txn"), &bytes).unwrap();

    let n = replay_pending(&txn_dir, &root.view).unwrap();
    assert_eq!(n, 1);

    // the backup file is cleaned up after replay
    assert!(!txn_dir.join("42.txn").exists());

    assert!(root.view.verify("city", &Value::Str("Berlin".into()), rid(7), None, crate::lock::Locking::Default).unwrap());
}

#[test]
fn replay_pending_removes_a_corrupt_backup_file_without_failing_startup() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("txn");
    std::fs::create_dir_all(&txn_dir).unwrap();

    std::fs::write(txn_dir.join("99.txn"), b"not a valid backup frame at all").unwrap();

    let n = replay_pending(&txn_dir, &root.view).unwrap();
    assert_eq!(n, 0);
    assert!(!txn_dir.join("99.txn").exists());
}

#[test]
fn replay_pending_on_a_missing_directory_is_a_no_op() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("does-not-exist");

    assert_eq!(replay_pending(&txn_dir, &root.view).unwrap(), 0);
}

#[test]
fn cancel_releases_locks_and_leaves_no_backup_behind() {
    let dir = tempdir().unwrap();
    let root = Root::new(dir.path());
    let txn_dir = dir.path().join("txn");

    let txn = Transaction::new(root.clone(), Version(0), &txn_dir, 1);
    txn.write("name", Value::Str("Carl".into()), rid(4), Action::Add).unwrap();
    txn.cancel().unwrap();

    assert!(!txn_dir.join("1.txn").exists());
    assert!(matches!(
        txn.commit(),
        Err(crate::transaction::TransactionError::Atomic(AtomicError::NotOpen(AtomicOperationStatus::Aborted)))
    ));
}
