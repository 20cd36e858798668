use tempfile::tempdir;

use crate::common::{Action, Rid, Value, Version, Write};
use crate::limbo::{Buffer, Limbo, Queue, ToggleQueue, TriState, ACCELERATION_THRESHOLD};

fn w(key: &str, value: Value, rid: u64, action: Action) -> Write {
    Write::new(key, value, Rid::new(rid), action)
}

#[test]
fn queue_insert_and_get_last_write_action() {
    let q = Queue::new();
    q.insert(w("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();
    assert_eq!(
        q.get_last_write_action("name", &Value::Str("alice".into()), Rid::new(1), None),
        Some(Action::Add)
    );
    q.insert(w("name", Value::Str("alice".into()), 1, Action::Remove), false).unwrap();
    assert_eq!(
        q.get_last_write_action("name", &Value::Str("alice".into()), Rid::new(1), None),
        Some(Action::Remove)
    );
}

#[test]
fn queue_verify_is_unsure_for_unknown_topic() {
    let q = Queue::new();
    q.insert(w("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();
    assert_eq!(
        q.verify("other", &Value::Str("x".into()), Rid::new(9), None),
        TriState::Unsure
    );
}

#[test]
fn queue_verify_true_false_after_toggles() {
    let q = Queue::new();
    q.insert(w("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();
    assert_eq!(q.verify("name", &Value::Str("alice".into()), Rid::new(1), None), TriState::True);
    q.insert(w("name", Value::Str("alice".into()), 1, Action::Remove), false).unwrap();
    assert_eq!(q.verify("name", &Value::Str("alice".into()), Rid::new(1), None), TriState::False);
}

#[test]
fn queue_verify_stays_accurate_past_acceleration_threshold() {
    let q = Queue::new();
    for i in 0..(ACCELERATION_THRESHOLD as u64 + 5) {
        q.insert(w("filler", Value::Int(i as i64), i, Action::Add), false).unwrap();
    }
    q.insert(w("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();
    assert_eq!(q.verify("name", &Value::Str("alice".into()), Rid::new(1), None), TriState::True);
    assert_eq!(
        q.verify("name", &Value::Str("nobody".into()), Rid::new(1), None),
        TriState::Unsure
    );
}

#[test]
fn queue_transport_drains_in_order_and_clears() {
    let q = Queue::new();
    q.insert(w("a", Value::Int(1), 1, Action::Add), false).unwrap();
    q.insert(w("b", Value::Int(2), 2, Action::Add), false).unwrap();

    let mut drained = Vec::new();
    let n = q
        .transport(
            &|write| {
                drained.push(write.clone());
                Ok(())
            },
            false,
        )
        .unwrap();
    assert_eq!(n, 2);
    assert!(q.is_empty());
    assert_eq!(drained.len(), 2);
}

#[test]
fn queue_transform_rewrites_every_write() {
    let q = Queue::new();
    q.insert(w("a", Value::Int(1), 1, Action::Add), false).unwrap();
    q.transform(&|write| write.version = Version(7));
    assert_eq!(q.writes()[0].version, Version(7));
}

#[test]
fn toggle_queue_collapses_same_topic_in_place() {
    let tq = ToggleQueue::new();
    tq.insert(w("name", Value::Str("alice".into()), 1, Action::Add), false).unwrap();
    tq.insert(w("age", Value::Int(30), 1, Action::Add), false).unwrap();
    tq.insert(w("name", Value::Str("alice".into()), 1, Action::Remove), false).unwrap();

    let writes = tq.writes();
    assert_eq!(writes.len(), 2, "same topic toggle must replace, not append");
    assert_eq!(writes[0].action, Action::Remove);
    assert_eq!(writes[1].key, "age");
}

#[test]
fn buffer_replays_pending_writes_after_reopen() {
    let dir = tempdir().unwrap();
    {
        let buf = Buffer::open(dir.path()).unwrap();
        buf.insert(w("name", Value::Str("alice".into()), 1, Action::Add), true).unwrap();
        buf.insert(w("age", Value::Int(30), 1, Action::Add), true).unwrap();
    }

    let reopened = Buffer::open(dir.path()).unwrap();
    assert_eq!(reopened.len(), 2);
}

#[test]
fn buffer_transport_clears_queue_and_truncates_wal() {
    let dir = tempdir().unwrap();
    let buf = Buffer::open(dir.path()).unwrap();
    buf.insert(w("name", Value::Str("alice".into()), 1, Action::Add), true).unwrap();

    let n = buf.transport(&|_| Ok(()), true).unwrap();
    assert_eq!(n, 1);
    assert!(buf.is_empty());

    let reopened = Buffer::open(dir.path()).unwrap();
    assert!(reopened.is_empty(), "truncated WAL must replay empty");
}
