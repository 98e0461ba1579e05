// Per-conversation message timeline: an append-with-merge store keyed by
// message identifier, kept in (timestamp, id) order for display. All the
// idempotence and status-merge rules that make redelivered or reordered
// feed events safe live here.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::models::{DeliveryStatus, Message};
use crate::sync::normalizer::{CanonicalEvent, EventKind};

/// How many subsequent applies an orphan update survives while waiting for
/// its insert. Covers the normalizer fan-out race without holding stale
/// buffers forever.
const DEFERRED_APPLY_WINDOW: u64 = 32;

/// Display order within a conversation: creation timestamp, ties broken by
/// identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimelineKey {
    timestamp: i64,
    id: String,
}

impl TimelineKey {
    fn of(message: &Message) -> Self {
        TimelineKey { timestamp: message.timestamp, id: message.id.clone() }
    }
}

/// An update that arrived before its insert. Kept one-deep per message id
/// and replayed when the insert lands, or discarded once the window lapses.
#[derive(Debug)]
struct DeferredUpdate {
    message: Message,
    expires_after: u64,
}

/// Ordered, deduplicated message collection for a single conversation.
///
/// The engine gives each open conversation exactly one of these, owned by
/// that conversation's actor task; nothing else mutates it.
pub struct Timeline {
    chat_id: String,
    entries: BTreeMap<TimelineKey, Message>,
    index: HashMap<String, TimelineKey>,
    deferred: HashMap<String, DeferredUpdate>,
    applied: u64,
}

impl Timeline {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Timeline {
            chat_id: chat_id.into(),
            entries: BTreeMap::new(),
            index: HashMap::new(),
            deferred: HashMap::new(),
            applied: 0,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.index.get(message_id).and_then(|key| self.entries.get(key))
    }

    /// The timeline in display order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    /// Seed from a history page (oldest-first). Goes through the same merge
    /// rules as live events, so loading over a partially filled timeline is
    /// safe.
    pub fn load(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.insert(message);
        }
    }

    /// Apply one canonical event. Returns true when the timeline changed.
    pub fn apply(&mut self, event: &CanonicalEvent) -> bool {
        if event.chat_id() != self.chat_id {
            warn!(
                "timeline {}: dropping event for foreign chat {}",
                self.chat_id,
                event.chat_id()
            );
            return false;
        }
        self.applied += 1;
        let changed = match &event.kind {
            EventKind::Insert(message) => self.insert(message.clone()),
            EventKind::Update(message) => self.update(message.clone()),
            EventKind::Delete { message_id, .. } => self.delete(message_id),
            // Membership changes do not touch the timeline.
            EventKind::MemberJoined { .. } | EventKind::MemberLeft { .. } => false,
        };
        self.expire_deferred();
        changed
    }

    /// Swap a locally pending entry for the server-confirmed record. The
    /// confirmed entry takes its position from the server timestamp.
    /// Tolerates the confirmed insert having already arrived through the
    /// feed: the temporary entry is removed and the confirmed one merged,
    /// never duplicated.
    pub fn replace_temporary(&mut self, temp_id: &str, confirmed: Message) -> bool {
        let had_temp = self.remove_entry(temp_id);
        if !had_temp {
            debug!(
                "timeline {}: no pending entry {} to replace (already confirmed?)",
                self.chat_id, temp_id
            );
        }
        self.insert(confirmed);
        had_temp
    }

    fn insert(&mut self, message: Message) -> bool {
        match self.index.get(&message.id) {
            Some(key) => {
                // Redelivery of a known id. The newer snapshot wins only if
                // its timestamp is not older than what we hold.
                let existing = self.entries.get(key).expect("index points at entry");
                if message.timestamp < existing.timestamp {
                    debug!(
                        "timeline {}: ignoring stale insert for {} ({} < {})",
                        self.chat_id, message.id, message.timestamp, existing.timestamp
                    );
                    return false;
                }
                let mut merged = existing.clone();
                merge_fields(&mut merged, &message);
                merged.timestamp = message.timestamp;
                let changed = merged != *existing;
                if changed {
                    self.remove_entry(&message.id);
                    self.store(merged);
                }
                changed
            }
            None => {
                let mut fresh = message;
                // An update that outran its insert is replayed on arrival.
                if let Some(deferred) = self.deferred.remove(&fresh.id) {
                    debug!(
                        "timeline {}: replaying buffered update for {}",
                        self.chat_id, fresh.id
                    );
                    merge_fields(&mut fresh, &deferred.message);
                }
                self.store(fresh);
                true
            }
        }
    }

    fn update(&mut self, message: Message) -> bool {
        match self.index.get(&message.id) {
            Some(key) => {
                let existing = self.entries.get_mut(key).expect("index points at entry");
                let before = existing.clone();
                merge_fields(existing, &message);
                *existing != before
            }
            None => {
                // Buffer one event per id until the insert arrives.
                debug!(
                    "timeline {}: buffering update for unknown message {}",
                    self.chat_id, message.id
                );
                let expires_after = self.applied + DEFERRED_APPLY_WINDOW;
                self.deferred
                    .insert(message.id.clone(), DeferredUpdate { message, expires_after });
                false
            }
        }
    }

    fn delete(&mut self, message_id: &str) -> bool {
        // Absence is not an error; deletes are idempotent.
        self.deferred.remove(message_id);
        self.remove_entry(message_id)
    }

    fn store(&mut self, message: Message) {
        let key = TimelineKey::of(&message);
        self.index.insert(message.id.clone(), key.clone());
        self.entries.insert(key, message);
    }

    fn remove_entry(&mut self, message_id: &str) -> bool {
        match self.index.remove(message_id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    fn expire_deferred(&mut self) {
        let applied = self.applied;
        self.deferred.retain(|id, deferred| {
            let keep = deferred.expires_after > applied;
            if !keep {
                debug!("dropping buffered update for {}: insert never arrived", id);
            }
            keep
        });
    }
}

/// Merge an incoming snapshot into an existing entry. Content edits always
/// apply; the delivery status follows the lattice and never moves backward.
fn merge_fields(existing: &mut Message, incoming: &Message) {
    existing.content = incoming.content.clone();
    existing.reply_to = incoming.reply_to.clone();
    existing.metadata = incoming.metadata.clone();
    existing.status = merge_status(existing.status, incoming.status);
}

/// Status transitions form a lattice: `sending < sent < delivered < read`,
/// with `read` absorbing. `Failed` is a local terminal marker that only
/// applies over `Sending`; a later server confirmation overrides it (the
/// attempt timed out locally but the store accepted it).
pub fn merge_status(current: DeliveryStatus, incoming: DeliveryStatus) -> DeliveryStatus {
    use DeliveryStatus::*;
    match (current, incoming) {
        (Read, _) => Read,
        (Sending, Failed) => Failed,
        (_, Failed) => current,
        (Failed, s) if s.rank() >= Sent.rank() => s,
        (Failed, _) => Failed,
        (c, i) => {
            if i.rank() > c.rank() {
                i
            } else {
                c
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use crate::store::EventSource;

    fn message(id: &str, timestamp: i64, status: DeliveryStatus) -> Message {
        Message {
            id: id.to_string(),
            chat_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            content: format!("message {}", id),
            kind: MessageKind::Text,
            timestamp,
            status,
            reply_to: None,
            metadata: None,
        }
    }

    fn insert_event(seq: u64, m: Message) -> CanonicalEvent {
        CanonicalEvent { seq, source: EventSource::RemoteFeed, kind: EventKind::Insert(m) }
    }

    fn update_event(seq: u64, m: Message) -> CanonicalEvent {
        CanonicalEvent { seq, source: EventSource::RemoteFeed, kind: EventKind::Update(m) }
    }

    fn delete_event(seq: u64, id: &str) -> CanonicalEvent {
        CanonicalEvent {
            seq,
            source: EventSource::RemoteFeed,
            kind: EventKind::Delete { chat_id: "c1".to_string(), message_id: id.to_string() },
        }
    }

    #[test]
    fn orders_by_timestamp_then_id() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("b", 200, DeliveryStatus::Sent)));
        timeline.apply(&insert_event(2, message("c", 100, DeliveryStatus::Sent)));
        timeline.apply(&insert_event(3, message("a", 200, DeliveryStatus::Sent)));

        let ids: Vec<String> = timeline.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn redelivered_insert_is_deduplicated() {
        let mut timeline = Timeline::new("c1");
        let m = message("m9", 100, DeliveryStatus::Sent);
        timeline.apply(&insert_event(1, m.clone()));
        timeline.apply(&insert_event(2, m));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn stale_insert_loses_the_race() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("m1", 200, DeliveryStatus::Sent)));
        let mut stale = message("m1", 100, DeliveryStatus::Sent);
        stale.content = "older snapshot".to_string();
        assert!(!timeline.apply(&insert_event(2, stale)));
        assert_eq!(timeline.get("m1").unwrap().timestamp, 200);
        assert_eq!(timeline.get("m1").unwrap().content, "message m1");
    }

    #[test]
    fn status_never_regresses() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("m1", 100, DeliveryStatus::Read)));
        timeline.apply(&update_event(2, message("m1", 100, DeliveryStatus::Delivered)));
        assert_eq!(timeline.get("m1").unwrap().status, DeliveryStatus::Read);
    }

    #[test]
    fn content_edit_does_not_touch_status() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("m1", 100, DeliveryStatus::Read)));
        let mut edit = message("m1", 100, DeliveryStatus::Sent);
        edit.content = "edited".to_string();
        timeline.apply(&update_event(2, edit));

        let entry = timeline.get("m1").unwrap();
        assert_eq!(entry.content, "edited");
        assert_eq!(entry.status, DeliveryStatus::Read);
    }

    #[test]
    fn failed_only_applies_over_sending() {
        assert_eq!(
            merge_status(DeliveryStatus::Sending, DeliveryStatus::Failed),
            DeliveryStatus::Failed
        );
        assert_eq!(
            merge_status(DeliveryStatus::Sent, DeliveryStatus::Failed),
            DeliveryStatus::Sent
        );
        // A late confirmation wins over a local failure marker.
        assert_eq!(
            merge_status(DeliveryStatus::Failed, DeliveryStatus::Sent),
            DeliveryStatus::Sent
        );
        assert_eq!(
            merge_status(DeliveryStatus::Failed, DeliveryStatus::Sending),
            DeliveryStatus::Failed
        );
    }

    #[test]
    fn update_before_insert_is_buffered_and_replayed() {
        let mut timeline = Timeline::new("c1");
        // Update outruns its insert (fan-out race).
        timeline.apply(&update_event(1, message("m9", 100, DeliveryStatus::Read)));
        assert!(timeline.is_empty());

        timeline.apply(&insert_event(2, message("m9", 100, DeliveryStatus::Delivered)));
        assert_eq!(timeline.get("m9").unwrap().status, DeliveryStatus::Read);
    }

    #[test]
    fn buffered_update_expires_after_window() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&update_event(1, message("ghost", 100, DeliveryStatus::Read)));

        // Push the buffer past its window with unrelated traffic.
        for i in 0..=DEFERRED_APPLY_WINDOW {
            timeline.apply(&insert_event(
                2 + i,
                message(&format!("m{}", i), 200 + i as i64, DeliveryStatus::Sent),
            ));
        }

        // The insert finally arrives; the stale buffered status is gone.
        timeline.apply(&insert_event(100, message("ghost", 100, DeliveryStatus::Delivered)));
        assert_eq!(timeline.get("ghost").unwrap().status, DeliveryStatus::Delivered);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("m1", 100, DeliveryStatus::Sent)));
        assert!(timeline.apply(&delete_event(2, "m1")));
        assert!(!timeline.apply(&delete_event(3, "m1")));
        assert!(timeline.is_empty());
    }

    #[test]
    fn replace_temporary_removes_temp_and_keeps_order() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("m-early", 100, DeliveryStatus::Sent)));
        timeline.apply(&insert_event(2, message("temp-1", 150, DeliveryStatus::Sending)));
        timeline.apply(&insert_event(3, message("m-late", 300, DeliveryStatus::Sent)));

        let confirmed = message("srv-42", 200, DeliveryStatus::Sent);
        assert!(timeline.replace_temporary("temp-1", confirmed));

        let ids: Vec<String> = timeline.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m-early", "srv-42", "m-late"]);
        assert!(timeline.get("temp-1").is_none(), "no orphan temporary entry");
    }

    #[test]
    fn replace_temporary_tolerates_feed_echo_arriving_first() {
        let mut timeline = Timeline::new("c1");
        timeline.apply(&insert_event(1, message("temp-1", 150, DeliveryStatus::Sending)));
        // The store's own insert event beats the confirmation response.
        timeline.apply(&insert_event(2, message("srv-42", 200, DeliveryStatus::Sent)));

        timeline.replace_temporary("temp-1", message("srv-42", 200, DeliveryStatus::Sent));
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.snapshot()[0].id, "srv-42");
    }
}
