use crate::common::{Action, Bound, Operator, Rid, Value, Version, Write};
use crate::encoding::{decode_from_slice, encode_to_vec};

#[test]
fn value_total_order_crosses_variants() {
    let mut values = vec![
        Value::Blob(vec![1]),
        Value::Bool(true),
        Value::Tag("z".into()),
        Value::Int(5),
    ];
    values.sort();
    assert_eq!(
        values,
        vec![
            Value::Bool(true),
            Value::Int(5),
            Value::Tag("z".into()),
            Value::Blob(vec![1]),
        ]
    );
}

#[test]
fn value_case_insensitive_equality() {
    let a = Value::Str("Alice".into());
    let b = Value::Str("ALICE".into());
    assert!(a.eq_case_insensitive(&b));
    assert_ne!(a, b);
}

#[test]
fn bound_ordering_sentinels() {
    assert!(Bound::NegInf < Bound::Included(Value::Int(0)));
    assert!(Bound::Included(Value::Int(0)) < Bound::PosInf);
    assert!(Bound::NegInf < Bound::PosInf);
}

#[test]
fn bound_fold_direction_for_case_insensitive_range() {
    let v = Value::Str("Mid".into());
    assert_eq!(
        v.fold_bound_for_operator(Operator::Gt),
        Value::Str("mid".into())
    );
    assert_eq!(
        v.fold_bound_for_operator(Operator::Gte),
        Value::Str("MID".into())
    );
    assert_eq!(
        v.fold_bound_for_operator(Operator::Lt),
        Value::Str("MID".into())
    );
    assert_eq!(
        v.fold_bound_for_operator(Operator::Lte),
        Value::Str("mid".into())
    );
}

#[test]
fn write_round_trips_through_encoding() {
    let w = Write::new("name", Value::Str("Alice".into()), Rid::new(17), Action::Add);
    let bytes = encode_to_vec(&w).expect("encode");
    let (decoded, consumed) = decode_from_slice::<Write>(&bytes).expect("decode");
    assert_eq!(consumed, bytes.len());
    assert_eq!(decoded, w);
}

#[test]
fn version_no_version_is_unassigned() {
    assert!(!Version::NO_VERSION.is_assigned());
    assert!(Version(1).is_assigned());
}

#[test]
fn rid_encodes_as_fixed_eight_bytes() {
    let rid = Rid::new(0xdead_beef);
    let bytes = encode_to_vec(&rid).expect("encode");
    assert_eq!(bytes.len(), 8);
}
