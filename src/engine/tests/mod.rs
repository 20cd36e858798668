use tempfile::tempdir;

use crate::common::{Action, Operator, Rid, Value, Version};
use crate::engine::{Engine, EngineConfig};

#[test]
fn atomic_operation_commits_are_visible_after_commit() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

    let op = engine.start_atomic_operation();
    op.write("name", Value::Str("alice".into()), Rid::new(1), Action::Add).unwrap();
    assert!(op.commit().unwrap());

    let record = engine.select(Rid::new(1)).unwrap();
    assert!(!record.is_empty());
}

#[test]
fn concurrent_writers_to_the_same_cell_do_not_corrupt_state() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

    let a = engine.start_atomic_operation();
    a.write("name", Value::Str("alice".into()), Rid::new(1), Action::Add).unwrap();
    assert!(a.commit().unwrap());

    // Once `a` has released its locks (commit returns only after release),
    // `b` is free to acquire the same cell token and commit on top.
    let b = engine.start_atomic_operation();
    b.write("name", Value::Str("bob".into()), Rid::new(1), Action::Add).unwrap();
    assert!(b.commit().unwrap());

    let record = engine.select(Rid::new(1)).unwrap();
    assert!(!record.is_empty());
}

#[test]
fn a_reader_holding_a_range_lock_preempts_a_concurrent_writer_to_the_same_key() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

    let seed = engine.start_atomic_operation();
    seed.write("age", Value::Int(10), Rid::new(1), Action::Add).unwrap();
    assert!(seed.commit().unwrap());

    std::thread::sleep(std::time::Duration::from_millis(20));

    let reader = engine.start_atomic_operation();
    reader.explore("age", Operator::Gt, &[Value::Int(0)]).unwrap();

    let writer = engine.start_atomic_operation();
    writer.write("age", Value::Int(99), Rid::new(2), Action::Add).unwrap();
    assert!(writer.commit().unwrap());

    assert!(matches!(reader.status(), crate::atomic::AtomicOperationStatus::Preempted));
}

#[test]
fn transaction_writes_are_durable_after_commit() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

    let txn = engine.start_transaction();
    txn.write("age", Value::Int(30), Rid::new(7), Action::Add).unwrap();
    assert!(txn.commit().unwrap());

    let record = engine.select(Rid::new(7)).unwrap();
    assert!(!record.is_empty());
}

#[test]
fn reopening_the_engine_preserves_committed_data_once_transported() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        let op = engine.start_atomic_operation();
        op.write("city", Value::Str("paris".into()), Rid::new(9), Action::Add).unwrap();
        assert!(op.commit().unwrap());

        // Give the background Transporter a chance to drain the Buffer
        // into the Database before this Engine (and its transporter) drop.
        for _ in 0..200 {
            std::thread::sleep(std::time::Duration::from_millis(5));
            if engine.select(Rid::new(9)).map(|r| !r.is_empty()).unwrap_or(false) {
                break;
            }
        }
        engine.sync().unwrap();
    }

    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
    let record = engine.select(Rid::new(9)).unwrap();
    assert!(!record.is_empty());
}

#[test]
fn explore_eventually_sees_writes_after_transport_drains_the_buffer() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

    let op = engine.start_atomic_operation();
    op.write("age", Value::Int(42), Rid::new(3), Action::Add).unwrap();
    assert!(op.commit().unwrap());

    let mut found = false;
    for _ in 0..200 {
        std::thread::sleep(std::time::Duration::from_millis(5));
        let hits = engine.explore("age", Operator::Equals, &[Value::Int(42)]).unwrap();
        if hits.contains_key(&Rid::new(3)) {
            found = true;
            break;
        }
    }
    assert!(found, "engine never surfaced the committed write through explore");
}

#[test]
fn two_phase_commit_locks_survive_until_finish() {
    use crate::two_phase_commit::TwoPhaseCommit;

    let dir = tempdir().unwrap();
    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

    let two_pc = TwoPhaseCommit::new(engine.clone() as std::sync::Arc<dyn crate::atomic::AtomicSupport>, Version::NO_VERSION);
    two_pc.write("country", Value::Str("france".into()), Rid::new(11), Action::Add).unwrap();
    assert!(two_pc.commit(crate::common::Version(1)).unwrap());

    let other = engine.start_atomic_operation();
    other.write("country", Value::Str("spain".into()), Rid::new(11), Action::Add).unwrap();
    assert!(!other.prepare().unwrap());

    two_pc.finish().unwrap();
    let record = engine.select(Rid::new(11)).unwrap();
    assert!(!record.is_empty());
}

use crate::common::Version;
