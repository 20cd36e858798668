use std::sync::Arc;

use tempfile::tempdir;

use crate::buffered_store::BufferedStore;
use crate::common::{Action, Operator, Rid, Value, Version, Write};
use crate::database::Database;
use crate::inventory::Inventory;
use crate::lock::Locking;
use crate::limbo::Queue;

fn open_store(dir: &std::path::Path) -> BufferedStore {
    let inventory = Arc::new(Inventory::open(dir.join("inventory")).unwrap());
    let db = Database::open(dir, inventory).unwrap();
    BufferedStore::new(Arc::new(Queue::new()), Arc::new(db))
}

fn write(key: &str, value: Value, rid: u64, action: Action) -> Write {
    Write::new(key, value, Rid::new(rid), action)
}

#[test]
fn select_merges_pending_limbo_write_over_empty_durable_side() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.accept(write("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();

    let record = store.select(Rid::new(1), Locking::Default).unwrap();
    assert_eq!(
        record.get(&crate::block::Key::Text("name".into())),
        vec![crate::block::SortValue::Value(Value::Str("alice".into()))]
    );
}

#[test]
fn verify_prefers_limbo_fast_path_over_durable() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.accept(write("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();
    assert!(store.verify("name", &Value::Str("alice".into()), Rid::new(1), None, Locking::Default).unwrap());

    store.accept(write("name", Value::Str("alice".into()), 1, Action::Remove), false).unwrap();
    assert!(!store.verify("name", &Value::Str("alice".into()), Rid::new(1), None, Locking::Default).unwrap());
}

#[test]
fn verify_falls_back_to_durable_when_limbo_is_unsure() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut w = write("name", Value::Str("alice".into()), 1, Action::Add);
    w.version = Version(1);
    store.durable().accept(&w, true).unwrap();
    store.durable().sync().unwrap();

    assert!(store.verify("name", &Value::Str("alice".into()), Rid::new(1), None, Locking::Default).unwrap());
}

#[test]
fn explore_merges_durable_hits_with_pending_writes() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut durable_write = write("age", Value::Int(40), 1, Action::Add);
    durable_write.version = Version(1);
    store.durable().accept(&durable_write, true).unwrap();
    store.durable().sync().unwrap();

    store.accept(write("age", Value::Int(50), 2, Action::Add), false).unwrap();

    let hits = store.explore("age", Operator::Gt, &[Value::Int(30)], Locking::Default).unwrap();
    assert_eq!(hits.len(), 2);
}

#[test]
fn search_lets_pending_remove_cancel_a_durable_match() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut durable_write = write("bio", Value::Str("quick brown fox".into()), 1, Action::Add);
    durable_write.version = Version(1);
    store.durable().accept(&durable_write, true).unwrap();
    store.durable().sync().unwrap();
    assert!(store.search("bio", "fox", Locking::Default).unwrap().contains(&Rid::new(1)));

    store.accept(write("bio", Value::Str("quick brown fox".into()), 1, Action::Remove), false).unwrap();
    assert!(!store.search("bio", "fox", Locking::Default).unwrap().contains(&Rid::new(1)));
}

#[test]
fn transport_drains_limbo_into_durable_side() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.accept(write("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();

    let n = store.transport(false).unwrap();
    assert_eq!(n, 1);
    assert!(store.limbo().is_empty());
    assert!(store.durable().verify("name", &Value::Str("alice".into()), Rid::new(1), None).unwrap());
}
