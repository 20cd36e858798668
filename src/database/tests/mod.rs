use std::sync::Arc;

use tempfile::tempdir;

use crate::common::{Action, Operator, Rid, Value, Version, Write};
use crate::database::Database;
use crate::inventory::Inventory;

fn open_db(dir: &std::path::Path) -> Database {
    let inventory = Arc::new(Inventory::open(dir.join("inventory")).unwrap());
    Database::open(dir, inventory).unwrap()
}

fn write(key: &str, value: Value, rid: u64, version: u64, action: Action) -> Write {
    let mut w = Write::new(key, value, Rid::new(rid), action);
    w.version = Version(version);
    w
}

#[test]
fn accept_then_select_sees_the_write_before_sync() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.accept(&write("name", Value::Str("alice".into()), 1, 1, Action::Add), false).unwrap();

    let record = db.select(Rid::new(1)).unwrap();
    assert_eq!(
        record.get(&crate::block::Key::Text("name".into())),
        vec![crate::block::SortValue::Value(Value::Str("alice".into()))]
    );
}

#[test]
fn verify_is_false_for_unknown_rid() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    assert!(!db.verify("name", &Value::Str("alice".into()), Rid::new(1), None).unwrap());
}

#[test]
fn accept_then_sync_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(dir.path());
        db.accept(&write("name", Value::Str("alice".into()), 1, 1, Action::Add), true).unwrap();
        db.sync().unwrap();
    }

    let reopened = open_db(dir.path());
    assert!(reopened.verify("name", &Value::Str("alice".into()), Rid::new(1), None).unwrap());
}

#[test]
fn browse_finds_rid_by_secondary_value() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.accept(&write("name", Value::Str("alice".into()), 1, 1, Action::Add), false).unwrap();
    db.accept(&write("name", Value::Str("bob".into()), 2, 1, Action::Add), false).unwrap();

    let hits = db.browse("name", &Value::Str("alice".into())).unwrap();
    assert_eq!(hits, [Rid::new(1)].into_iter().collect());
}

#[test]
fn explore_gt_filters_by_bound() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.accept(&write("age", Value::Int(20), 1, 1, Action::Add), false).unwrap();
    db.accept(&write("age", Value::Int(40), 2, 1, Action::Add), false).unwrap();

    let hits = db.explore("age", Operator::Gt, &[Value::Int(30)]).unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits.contains_key(&Rid::new(2)));
}

#[test]
fn gather_inverts_secondary_index_by_rid() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.accept(&write("name", Value::Str("alice".into()), 1, 1, Action::Add), false).unwrap();
    db.accept(&write("age", Value::Int(30), 1, 1, Action::Add), false).unwrap();

    let cube = db.gather(Rid::new(1), None).unwrap();
    assert!(cube.contains_key("name"));
    assert!(cube.contains_key("age"));
}

#[test]
fn chronologize_returns_full_history_oldest_first() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.accept(&write("name", Value::Str("alice".into()), 1, 1, Action::Add), false).unwrap();
    db.accept(&write("name", Value::Str("alice".into()), 1, 2, Action::Remove), false).unwrap();

    let history = db.chronologize(Rid::new(1), "name").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].1, Action::Add);
    assert_eq!(history[1].1, Action::Remove);
}

#[test]
fn search_finds_infix_term_across_blocks() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.accept(&write("bio", Value::Str("quick brown fox".into()), 1, 1, Action::Add), false).unwrap();
    db.sync().unwrap();
    db.accept(&write("bio", Value::Str("lazy dog".into()), 2, 1, Action::Add), false).unwrap();

    let hits = db.search("bio", "fox").unwrap();
    assert!(hits.contains(&Rid::new(1)));
    assert!(!hits.contains(&Rid::new(2)));
}

#[test]
fn open_discards_orphan_blocks_from_a_crash_between_syncs() {
    let dir = tempdir().unwrap();
    let primary_dir = dir.path().join("db").join("cpb");
    std::fs::create_dir_all(&primary_dir).unwrap();
    std::fs::write(primary_dir.join("1.blk"), b"").unwrap();
    std::fs::write(primary_dir.join("1.fltr"), b"").unwrap();
    std::fs::write(primary_dir.join("1.indx"), b"").unwrap();

    let db = open_db(dir.path());
    assert!(db.select(Rid::new(1)).unwrap().is_empty());
    assert!(!primary_dir.join("1.blk").exists(), "orphan primary block must be discarded");
}
