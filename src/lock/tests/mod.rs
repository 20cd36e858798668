use crate::common::{Bound, Rid, Value};
use crate::lock::{Announcer, Interval, LockBroker, LockError, Token, ValueRange};

#[test]
fn try_read_allows_multiple_readers() {
    let broker = LockBroker::new();
    let token = Token::wrap_rid(Rid::new(1));
    let p1 = broker.try_read(&token).unwrap();
    let p2 = broker.try_read(&token).unwrap();
    broker.release(p1);
    broker.release(p2);
}

#[test]
fn try_write_excludes_concurrent_readers_and_writers() {
    let broker = LockBroker::new();
    let token = Token::wrap_rid(Rid::new(1));
    let _write_permit = broker.try_write(&token).unwrap();

    assert!(matches!(broker.try_read(&token), Err(LockError::WouldBlock(_))));
    assert!(matches!(broker.try_write(&token), Err(LockError::WouldBlock(_))));
}

#[test]
fn release_of_last_reader_frees_the_token() {
    let broker = LockBroker::new();
    let token = Token::wrap_rid(Rid::new(1));
    let permit = broker.try_read(&token).unwrap();
    broker.release(permit);
    assert!(broker.try_write(&token).is_ok());
}

#[test]
fn wide_and_cell_tokens_for_same_rid_are_distinct() {
    let a = Token::wrap_rid(Rid::new(1));
    let b = Token::wrap_cell("name", Rid::new(1));
    assert_ne!(a, b);
}

#[test]
fn value_range_contains_point_within_interval() {
    let mut range = ValueRange::new();
    range.merge(&ValueRange {
        intervals: vec![Interval {
            lo: Bound::Included(Value::Int(10)),
            hi: Bound::Included(Value::Int(20)),
        }],
    });
    assert!(range.contains_point(&Value::Int(15)));
    assert!(!range.contains_point(&Value::Int(25)));
}

#[test]
fn value_range_everything_contains_any_point() {
    let range = ValueRange::everything();
    assert!(range.contains_point(&Value::Int(i64::MIN)));
    assert!(range.contains_point(&Value::Int(i64::MAX)));
}

#[test]
fn value_range_xor_removes_shared_intervals() {
    let shared = Interval {
        lo: Bound::Included(Value::Int(0)),
        hi: Bound::Included(Value::Int(10)),
    };
    let mut a = ValueRange {
        intervals: vec![shared.clone()],
    };
    let b = ValueRange { intervals: vec![shared] };
    a.xor(&b);
    assert!(a.is_empty());
}

#[test]
fn value_range_xor_against_everything_clears_any_bounded_interval() {
    let mut bounded = ValueRange {
        intervals: vec![Interval {
            lo: Bound::Included(Value::Int(100_000)),
            hi: Bound::PosInf,
        }],
    };
    assert!(bounded.intersects(&ValueRange::everything()));
    bounded.xor(&ValueRange::everything());
    assert!(bounded.is_empty());
}

#[test]
fn value_range_from_spec_builds_the_expected_interval_per_operator() {
    use crate::common::Operator;
    use crate::lock::RangeSpec;

    let gt = ValueRange::from_spec(&RangeSpec {
        op: Operator::Gt,
        values: vec![Value::Int(100_000)],
    });
    assert!(gt.contains_point(&Value::Int(250_000)));
    assert!(!gt.contains_point(&Value::Int(50_000)));

    let between = ValueRange::from_spec(&RangeSpec {
        op: Operator::Between,
        values: vec![Value::Int(10), Value::Int(20)],
    });
    assert!(between.contains_point(&Value::Int(15)));
    assert!(!between.contains_point(&Value::Int(25)));

    let eq = ValueRange::from_spec(&RangeSpec {
        op: Operator::Equals,
        values: vec![Value::Int(42)],
    });
    assert!(eq.contains_point(&Value::Int(42)));
    assert!(!eq.contains_point(&Value::Int(43)));

    // Operators with no interval shape conservatively cover everything.
    let contains = ValueRange::from_spec(&RangeSpec {
        op: Operator::Contains,
        values: vec![Value::Str("abc".into())],
    });
    assert!(contains.contains_point(&Value::Int(i64::MAX)));
}

#[test]
fn value_range_from_token_dispatches_range_tokens_and_defaults_to_everything() {
    use crate::common::Operator;

    let range_token = Token::range("salary", Operator::Gte, vec![Value::Int(100)]);
    let coverage = ValueRange::from_token(&range_token);
    assert!(coverage.contains_point(&Value::Int(100)));
    assert!(!coverage.contains_point(&Value::Int(99)));

    let field_token = Token::wrap_field("notes");
    assert!(ValueRange::from_token(&field_token).contains_point(&Value::Int(i64::MIN)));
}

#[test]
fn announcer_delivers_to_every_subscriber() {
    let announcer = Announcer::new();
    let rx1 = announcer.subscribe();
    let rx2 = announcer.subscribe();

    announcer.announce(Token::wrap_rid(Rid::new(7)));

    let e1 = rx1.try_recv().unwrap();
    let e2 = rx2.try_recv().unwrap();
    assert_eq!(e1.token, Token::wrap_rid(Rid::new(7)));
    assert_eq!(e2.token, Token::wrap_rid(Rid::new(7)));
}

#[test]
fn announcer_prunes_dropped_subscribers() {
    let announcer = Announcer::new();
    {
        let _rx = announcer.subscribe();
    }
    // dropped receiver's sender should be pruned on next announce, not panic
    announcer.announce(Token::wrap_rid(Rid::new(1)));
}
