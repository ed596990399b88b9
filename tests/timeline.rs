use chrono::{Duration, TimeZone, Utc};

use resctl::engine::Timeline;
use resctl_test_utils::builders::rn;

#[test]
fn next_is_the_earliest_entry() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut timeline = Timeline::new();
    assert_eq!(timeline.next(), None);

    timeline.set(&rn("late"), t0 + Duration::seconds(10));
    timeline.set(&rn("early"), t0 + Duration::seconds(5));

    assert_eq!(timeline.next(), Some(t0 + Duration::seconds(5)));
    assert_eq!(timeline.len(), 2);
}

#[test]
fn set_replaces_previous_time() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut timeline = Timeline::new();

    timeline.set(&rn("a"), t0 + Duration::seconds(5));
    timeline.set(&rn("a"), t0 + Duration::seconds(20));

    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.get(&rn("a")), Some(t0 + Duration::seconds(20)));
    assert_eq!(timeline.next(), Some(t0 + Duration::seconds(20)));
}

#[test]
fn pop_due_returns_due_entries_in_time_order() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut timeline = Timeline::new();
    timeline.set(&rn("b"), t0 + Duration::seconds(2));
    timeline.set(&rn("a"), t0 + Duration::seconds(1));
    timeline.set(&rn("c"), t0 + Duration::seconds(30));

    let due = timeline.pop_due(t0 + Duration::seconds(2));
    assert_eq!(due, vec![rn("a"), rn("b")]);
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.next(), Some(t0 + Duration::seconds(30)));
}

#[test]
fn remove_drops_entry() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut timeline = Timeline::new();
    timeline.set(&rn("a"), t0);

    assert!(timeline.remove(&rn("a")));
    assert!(!timeline.remove(&rn("a")));
    assert!(timeline.is_empty());
    assert!(timeline.pop_due(t0 + Duration::days(1)).is_empty());
}
