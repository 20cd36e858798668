use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::atomic::{AtomicError, AtomicOperationStatus, AtomicSupport};
use crate::buffered_store::BufferedStore;
use crate::common::{Action, Rid, Value, Version, Write};
use crate::database::Database;
use crate::inventory::Inventory;
use crate::limbo::Queue;
use crate::lock::{Announcer, LockBroker, SharedAnnouncer, Token};
use crate::two_phase_commit::{Allocator, TwoPhaseCommit, TwoPhaseCommitError};

/// A minimal root `AtomicSupport` over a fresh in-memory-backed `Database`,
/// mirroring the shape `crate::engine::Engine` provides in production.
struct TestRoot {
    _dir: TempDir,
    view: Arc<BufferedStore>,
    announcer: SharedAnnouncer,
    broker: Arc<LockBroker>,
    next_version: Mutex<u64>,
}

impl TestRoot {
    fn new() -> Arc<Self> {
        let dir = TempDir::new().unwrap();
        let inventory = Arc::new(Inventory::open(dir.path().join("inventory")).unwrap());
        let db = Database::open(dir.path(), inventory).unwrap();
        Arc::new(Self {
            _dir: dir,
            view: Arc::new(BufferedStore::new(Arc::new(Queue::new()), Arc::new(db))),
            announcer: Arc::new(Announcer::new()),
            broker: Arc::new(LockBroker::new()),
            next_version: Mutex::new(1),
        })
    }
}

impl AtomicSupport for TestRoot {
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
        let mut n = self.next_version.lock().unwrap();
        let v = Version(*n);
        *n += 1;
        v
    }

    fn on_child_committed(&self, writes: Vec<Write>, tokens: Vec<Token>) -> Result<(), AtomicError> {
        for w in writes {
            self.view.accept(w, false)?;
        }
        for t in tokens {
            self.announcer.announce(t);
        }
        Ok(())
    }
}

#[test]
fn commit_holds_locks_until_finish_applies() {
    let root = TestRoot::new();
    let two_pc = TwoPhaseCommit::new(root.clone() as Arc<dyn AtomicSupport>, Version(0));
    two_pc.write("name", Value::Str("alice".into()), Rid::new(1), Action::Add).unwrap();

    assert!(two_pc.commit(Version(42)).unwrap());
    assert_eq!(two_pc.status(), AtomicOperationStatus::Finalizing);

    // A concurrent writer to the same rid must be locked out.
    let other = crate::atomic::AtomicOperation::new(root.clone() as Arc<dyn AtomicSupport>, Version(0));
    other.write("name", Value::Str("bob".into()), Rid::new(1), Action::Add).unwrap();
    assert!(!other.prepare().unwrap());

    two_pc.finish().unwrap();
    assert_eq!(two_pc.status(), AtomicOperationStatus::Committed);

    let record = root.view.select(Rid::new(1), crate::lock::Locking::Default).unwrap();
    assert!(!record.is_empty());
}

#[test]
fn finish_before_commit_is_rejected() {
    let root = TestRoot::new();
    let two_pc = TwoPhaseCommit::new(root as Arc<dyn AtomicSupport>, Version(0));
    two_pc.write("name", Value::Str("alice".into()), Rid::new(1), Action::Add).unwrap();
    assert!(matches!(two_pc.finish(), Err(TwoPhaseCommitError::NotPrepared(0))));
}

#[test]
fn abort_releases_locks_without_applying() {
    let root = TestRoot::new();
    let two_pc = TwoPhaseCommit::new(root.clone() as Arc<dyn AtomicSupport>, Version(0));
    two_pc.write("name", Value::Str("alice".into()), Rid::new(1), Action::Add).unwrap();
    assert!(two_pc.commit(Version(1)).unwrap());

    two_pc.abort();
    assert_eq!(two_pc.status(), AtomicOperationStatus::Aborted);

    let other = crate::atomic::AtomicOperation::new(root as Arc<dyn AtomicSupport>, Version(0));
    other.write("name", Value::Str("bob".into()), Rid::new(1), Action::Add).unwrap();
    assert!(other.prepare().unwrap());
}

#[test]
fn allocator_tracks_instances_by_external_id() {
    let root = TestRoot::new();
    let allocator = Allocator::new(root as Arc<dyn AtomicSupport>);

    let txn = allocator.begin(7, Version(0)).unwrap();
    assert!(allocator.begin(7, Version(0)).is_err());
    assert!(allocator.get(7).is_some());

    txn.write("name", Value::Str("carol".into()), Rid::new(2), Action::Add).unwrap();
    assert!(txn.commit(Version(5)).unwrap());
    allocator.finish(7).unwrap();

    assert!(allocator.get(7).is_none());
    assert!(matches!(allocator.finish(7), Err(TwoPhaseCommitError::Unknown(7))));
}

#[test]
fn allocator_abort_releases_and_forgets() {
    let root = TestRoot::new();
    let allocator = Allocator::new(root as Arc<dyn AtomicSupport>);
    let txn = allocator.begin(3, Version(0)).unwrap();
    txn.write("name", Value::Str("dave".into()), Rid::new(9), Action::Add).unwrap();
    assert!(txn.commit(Version(9)).unwrap());

    allocator.abort(3).unwrap();
    assert!(allocator.get(3).is_none());
    assert_eq!(txn.status(), AtomicOperationStatus::Aborted);
}
