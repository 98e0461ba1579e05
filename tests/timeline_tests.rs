// Timeline property tests: confluence under reordering, redelivery
// idempotence, and reconciliation of optimistic sends.

use parley::models::{DeliveryStatus, Message, MessageKind};
use parley::store::EventSource;
use parley::sync::{CanonicalEvent, EventKind, Timeline};

fn message(id: &str, ts: i64, status: DeliveryStatus) -> Message {
    Message {
        id: id.to_string(),
        chat_id: "conv7".to_string(),
        sender_id: "bob".to_string(),
        content: format!("content of {}", id),
        kind: MessageKind::Text,
        timestamp: ts,
        status,
        reply_to: None,
        metadata: None,
    }
}

fn event(seq: u64, kind: EventKind) -> CanonicalEvent {
    CanonicalEvent { seq, source: EventSource::RemoteFeed, kind }
}

fn apply_all(events: &[CanonicalEvent]) -> Vec<Message> {
    let mut timeline = Timeline::new("conv7");
    for e in events {
        timeline.apply(e);
    }
    timeline.snapshot()
}

/// Applying event sequences in any interleaving that preserves each
/// message's own event order yields the same final timeline.
#[test]
fn interleavings_converge_to_the_same_timeline() {
    // Per-message event chains.
    let a_insert = event(1, EventKind::Insert(message("a", 100, DeliveryStatus::Sent)));
    let a_read = event(2, EventKind::Update(message("a", 100, DeliveryStatus::Read)));
    let b_insert = event(3, EventKind::Insert(message("b", 200, DeliveryStatus::Sent)));
    let b_delete = event(4, EventKind::Delete {
        chat_id: "conv7".to_string(),
        message_id: "b".to_string(),
    });
    let c_insert = event(5, EventKind::Insert(message("c", 150, DeliveryStatus::Delivered)));

    let interleavings: Vec<Vec<CanonicalEvent>> = vec![
        // In causal order.
        vec![
            a_insert.clone(), a_read.clone(), b_insert.clone(), b_delete.clone(),
            c_insert.clone(),
        ],
        // Chains interleaved.
        vec![
            b_insert.clone(), a_insert.clone(), c_insert.clone(), a_read.clone(),
            b_delete.clone(),
        ],
        // Another shuffle, update racing ahead of unrelated inserts.
        vec![
            a_insert.clone(), b_insert.clone(), b_delete.clone(), a_read.clone(),
            c_insert.clone(),
        ],
    ];

    let reference = apply_all(&interleavings[0]);
    for (i, ordering) in interleavings.iter().enumerate().skip(1) {
        let result = apply_all(ordering);
        assert_eq!(result, reference, "interleaving {} diverged", i);
    }

    // And the converged result is what the causal order says it should be.
    let ids: Vec<&str> = reference.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert_eq!(reference[0].status, DeliveryStatus::Read);
}

/// Replaying an entire event sequence is a no-op.
#[test]
fn reapplying_a_sequence_is_idempotent() {
    let events = vec![
        event(1, EventKind::Insert(message("a", 100, DeliveryStatus::Sent))),
        event(2, EventKind::Update(message("a", 100, DeliveryStatus::Delivered))),
        event(3, EventKind::Insert(message("b", 200, DeliveryStatus::Sent))),
    ];

    let mut timeline = Timeline::new("conv7");
    for e in &events {
        timeline.apply(e);
    }
    let first_pass = timeline.snapshot();

    // The feed redelivers everything.
    for e in &events {
        timeline.apply(e);
    }
    assert_eq!(timeline.snapshot(), first_pass);
}

#[test]
fn duplicate_insert_never_duplicates_the_entry() {
    // Scenario: the same insert for id 9 in conv 7 arrives twice.
    let m = message("9", 100, DeliveryStatus::Sent);
    let mut timeline = Timeline::new("conv7");
    timeline.apply(&event(1, EventKind::Insert(m.clone())));
    timeline.apply(&event(2, EventKind::Insert(m)));

    let snapshot = timeline.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "9");
}

#[test]
fn read_update_arriving_before_insert_wins() {
    // Scenario: the status update outruns the insert across the fan-out.
    let mut timeline = Timeline::new("conv7");
    timeline.apply(&event(1, EventKind::Update(message("9", 100, DeliveryStatus::Read))));
    timeline.apply(&event(2, EventKind::Insert(message("9", 100, DeliveryStatus::Sent))));

    assert_eq!(timeline.get("9").unwrap().status, DeliveryStatus::Read);
}

#[test]
fn replace_temporary_keeps_sort_order_and_drops_the_temp() {
    let mut timeline = Timeline::new("conv7");
    timeline.apply(&event(1, EventKind::Insert(message("m1", 100, DeliveryStatus::Read))));
    timeline.apply(&event(2, EventKind::Insert(message("temp-abc", 250, DeliveryStatus::Sending))));
    timeline.apply(&event(3, EventKind::Insert(message("m2", 300, DeliveryStatus::Delivered))));

    // Server assigns a timestamp between the two confirmed neighbours.
    timeline.replace_temporary("temp-abc", message("srv-9", 200, DeliveryStatus::Sent));

    let snapshot = timeline.snapshot();
    let ids: Vec<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "srv-9", "m2"]);
    assert!(timeline.get("temp-abc").is_none(), "temporary id fully removed");

    let timestamps: Vec<i64> = snapshot.iter().map(|m| m.timestamp).collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted, "display order stays sorted");
}
