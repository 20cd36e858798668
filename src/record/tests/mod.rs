use crate::block::{Key, Locator, Orientation, Revision, SortValue};
use crate::common::{Action, Operator, Rid, Value, Version};
use crate::record::Record;

#[test]
fn append_tracks_present_and_history() {
    let mut record = Record::new(Orientation::Primary, Locator::Rid(Rid::new(1)));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("alice".into()), Version(1), Action::Add));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("bob".into()), Version(2), Action::Add));

    let present = record.get(&Key::Text("name".into()));
    assert_eq!(present.len(), 2);
    assert_eq!(record.history_of(&Key::Text("name".into())).len(), 2);
}

#[test]
fn remove_without_prior_add_does_not_corrupt_present() {
    let mut record = Record::new(Orientation::Primary, Locator::Rid(Rid::new(1)));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("alice".into()), Version(1), Action::Remove));
    assert!(record.get(&Key::Text("name".into())).is_empty());
    // the non-offsetting toggle is still recorded in history
    assert_eq!(record.history_of(&Key::Text("name".into())).len(), 1);
}

#[test]
fn duplicate_add_is_discarded_from_present_but_kept_in_history() {
    let mut record = Record::new(Orientation::Primary, Locator::Rid(Rid::new(1)));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("alice".into()), Version(1), Action::Add));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("alice".into()), Version(2), Action::Add));

    assert_eq!(record.get(&Key::Text("name".into())).len(), 1);
    assert_eq!(record.history_of(&Key::Text("name".into())).len(), 2);
}

#[test]
fn try_append_rejects_locator_mismatch() {
    let mut record = Record::new(Orientation::Primary, Locator::Rid(Rid::new(1)));
    let err = record
        .try_append(Revision::primary(Rid::new(2), "name".into(), Value::Str("alice".into()), Version(1), Action::Add))
        .unwrap_err();
    assert!(matches!(err, crate::record::RecordError::LocatorMismatch(_, _)));
}

#[test]
fn get_at_folds_history_up_to_timestamp() {
    let mut record = Record::new(Orientation::Primary, Locator::Rid(Rid::new(1)));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("alice".into()), Version(1), Action::Add));
    record.append(Revision::primary(Rid::new(1), "name".into(), Value::Str("alice".into()), Version(2), Action::Remove));

    assert_eq!(
        record.get_at(&Key::Text("name".into()), Version(1)),
        vec![SortValue::Value(Value::Str("alice".into()))]
    );
    assert!(record.get_at(&Key::Text("name".into()), Version(2)).is_empty());
}

#[test]
fn explore_matches_equals_case_insensitively() {
    let mut record = Record::new(Orientation::Secondary, Locator::Key("name".into()));
    record.append(Revision::secondary("name".into(), Value::Str("Alice".into()), Rid::new(1), Version(1), Action::Add));
    record.append(Revision::secondary("name".into(), Value::Str("bob".into()), Rid::new(2), Version(1), Action::Add));

    let matches = record.explore(Operator::Equals, &[Value::Str("alice".into())]).unwrap();
    assert_eq!(matches.len(), 1);
    assert!(matches.contains_key(&Rid::new(1)));
}

#[test]
fn explore_between_is_inclusive() {
    let mut record = Record::new(Orientation::Secondary, Locator::Key("age".into()));
    for (rid, age) in [(1, 20), (2, 30), (3, 40)] {
        record.append(Revision::secondary("age".into(), Value::Int(age), Rid::new(rid), Version(1), Action::Add));
    }

    let matches = record
        .explore(Operator::Between, &[Value::Int(20), Value::Int(30)])
        .unwrap();
    assert_eq!(matches.len(), 2);
    assert!(!matches.contains_key(&Rid::new(3)));
}

#[test]
fn explore_not_contains_is_strict_negation() {
    let mut record = Record::new(Orientation::Secondary, Locator::Key("bio".into()));
    record.append(Revision::secondary("bio".into(), Value::Str("quick fox".into()), Rid::new(1), Version(1), Action::Add));
    record.append(Revision::secondary("bio".into(), Value::Str("slow bear".into()), Rid::new(2), Version(1), Action::Add));

    let matches = record
        .explore(Operator::NotContains, &[Value::Str("fox".into())])
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert!(matches.contains_key(&Rid::new(2)));
}

#[test]
fn search_intersects_adjacent_terms_across_stopwords() {
    let mut record = Record::new(Orientation::Search, Locator::Key("bio".into()));
    // "quick" at pos 0, "fox" at pos 2 (skipping stopword "the" at pos 1)
    record.append(Revision::search("bio".into(), "quick".into(), Rid::new(1), 0, Version(1), Action::Add));
    record.append(Revision::search("bio".into(), "fox".into(), Rid::new(1), 2, Version(1), Action::Add));

    let hits = record.search("quick the fox");
    assert!(hits.contains(&Rid::new(1)));
}

#[test]
fn search_with_no_surviving_terms_is_empty() {
    let record = Record::new(Orientation::Search, Locator::Key("bio".into()));
    assert!(record.search("the a an").is_empty());
}
