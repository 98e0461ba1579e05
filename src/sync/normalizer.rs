// Event normalizer: converts raw change-feed events and local optimistic
// actions into the canonical event shape the rest of the engine consumes.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::models::{Message, Participant};
use crate::store::{MembershipKind, RawEvent, RawEventKind, RawMembershipEvent, RawMessageEvent};
pub use crate::store::EventSource;

/// A raw event that cannot be normalized. The ingestion path logs these and
/// drops them; they never reach a timeline or the chat list.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{0:?} event carries no message snapshot")]
    MissingSnapshot(RawEventKind),

    #[error("event is missing a message identifier")]
    MissingMessageId,

    #[error("event is missing a conversation reference")]
    MissingChatId,

    #[error("membership event for chat {0} carries no user snapshot")]
    MissingUser(String),
}

/// The canonical event kind. Two raw events describing the same final state
/// of the same message compare equal here, which is what lets the stores
/// detect redelivery.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Insert(Message),
    Update(Message),
    Delete { chat_id: String, message_id: String },
    MemberJoined { chat_id: String, participant: Participant },
    MemberLeft { chat_id: String, user_id: String },
}

/// A normalized event carrying the local sequence number assigned at
/// ingestion. Events for one conversation are applied in `seq` order;
/// final timeline placement comes from message timestamps, not from the
/// order the transport happened to deliver things in.
#[derive(Debug, Clone)]
pub struct CanonicalEvent {
    pub seq: u64,
    pub source: EventSource,
    pub kind: EventKind,
}

impl CanonicalEvent {
    /// The conversation this event belongs to.
    pub fn chat_id(&self) -> &str {
        match &self.kind {
            EventKind::Insert(m) | EventKind::Update(m) => &m.chat_id,
            EventKind::Delete { chat_id, .. } => chat_id,
            EventKind::MemberJoined { chat_id, .. } => chat_id,
            EventKind::MemberLeft { chat_id, .. } => chat_id,
        }
    }
}

/// Assigns monotonically increasing sequence numbers and validates raw
/// events into the canonical shape. One normalizer serves every ingestion
/// path in the engine so the sequence is process-wide.
pub struct EventNormalizer {
    next_seq: AtomicU64,
}

impl EventNormalizer {
    pub fn new() -> Self {
        EventNormalizer { next_seq: AtomicU64::new(1) }
    }

    fn assign_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn normalize(&self, raw: RawEvent) -> Result<CanonicalEvent, NormalizeError> {
        let (source, kind) = match raw {
            RawEvent::Message(event) => (event.source, Self::normalize_message(event)?),
            RawEvent::Membership(event) => {
                (EventSource::RemoteFeed, Self::normalize_membership(event)?)
            }
        };
        Ok(CanonicalEvent { seq: self.assign_seq(), source, kind })
    }

    fn normalize_message(event: RawMessageEvent) -> Result<EventKind, NormalizeError> {
        match event.kind {
            RawEventKind::Insert | RawEventKind::Update => {
                let message = event
                    .message
                    .ok_or(NormalizeError::MissingSnapshot(event.kind))?;
                if message.id.is_empty() {
                    return Err(NormalizeError::MissingMessageId);
                }
                if message.chat_id.is_empty() {
                    return Err(NormalizeError::MissingChatId);
                }
                Ok(match event.kind {
                    RawEventKind::Insert => EventKind::Insert(message),
                    _ => EventKind::Update(message),
                })
            }
            RawEventKind::Delete => {
                let message_id = event
                    .message_id
                    .filter(|id| !id.is_empty())
                    .ok_or(NormalizeError::MissingMessageId)?;
                let chat_id = event
                    .chat_id
                    .filter(|id| !id.is_empty())
                    .ok_or(NormalizeError::MissingChatId)?;
                Ok(EventKind::Delete { chat_id, message_id })
            }
        }
    }

    fn normalize_membership(event: RawMembershipEvent) -> Result<EventKind, NormalizeError> {
        if event.chat_id.is_empty() {
            return Err(NormalizeError::MissingChatId);
        }
        match event.kind {
            MembershipKind::Joined => {
                let user = event
                    .user
                    .ok_or_else(|| NormalizeError::MissingUser(event.chat_id.clone()))?;
                Ok(EventKind::MemberJoined {
                    chat_id: event.chat_id,
                    participant: Participant { user, joined_at: event.joined_at },
                })
            }
            MembershipKind::Left => Ok(EventKind::MemberLeft {
                chat_id: event.chat_id,
                user_id: event.user_id,
            }),
        }
    }
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, MessageKind};

    fn sample_message(id: &str, chat_id: &str) -> Message {
        Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: "alice".to_string(),
            content: "hello".to_string(),
            kind: MessageKind::Text,
            timestamp: 1_700_000_000_000,
            status: DeliveryStatus::Sent,
            reply_to: None,
            metadata: None,
        }
    }

    fn raw_insert(message: Message) -> RawEvent {
        RawEvent::Message(RawMessageEvent {
            kind: RawEventKind::Insert,
            source: EventSource::RemoteFeed,
            message: Some(message),
            message_id: None,
            chat_id: None,
        })
    }

    #[test]
    fn assigns_monotonic_sequence_numbers() {
        let normalizer = EventNormalizer::new();
        let first = normalizer.normalize(raw_insert(sample_message("m1", "c1"))).unwrap();
        let second = normalizer.normalize(raw_insert(sample_message("m2", "c1"))).unwrap();
        assert!(second.seq > first.seq, "sequence numbers must increase");
    }

    #[test]
    fn redelivered_events_normalize_to_equal_kinds() {
        let normalizer = EventNormalizer::new();
        let a = normalizer.normalize(raw_insert(sample_message("m1", "c1"))).unwrap();
        let b = normalizer.normalize(raw_insert(sample_message("m1", "c1"))).unwrap();
        // Same final state, structurally equal apart from the sequence number.
        assert_eq!(a.kind, b.kind);
        assert_ne!(a.seq, b.seq);
    }

    #[test]
    fn rejects_insert_without_identifier() {
        let normalizer = EventNormalizer::new();
        let mut message = sample_message("", "c1");
        message.id.clear();
        let err = normalizer.normalize(raw_insert(message)).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingMessageId));
    }

    #[test]
    fn rejects_insert_without_chat_reference() {
        let normalizer = EventNormalizer::new();
        let message = sample_message("m1", "");
        let err = normalizer.normalize(raw_insert(message)).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingChatId));
    }

    #[test]
    fn rejects_delete_without_identifiers() {
        let normalizer = EventNormalizer::new();
        let raw = RawEvent::Message(RawMessageEvent {
            kind: RawEventKind::Delete,
            source: EventSource::RemoteFeed,
            message: None,
            message_id: None,
            chat_id: Some("c1".to_string()),
        });
        let err = normalizer.normalize(raw).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingMessageId));
    }

    #[test]
    fn delete_normalizes_with_identifiers_only() {
        let normalizer = EventNormalizer::new();
        let raw = RawEvent::Message(RawMessageEvent {
            kind: RawEventKind::Delete,
            source: EventSource::LocalAction,
            message: None,
            message_id: Some("m9".to_string()),
            chat_id: Some("c1".to_string()),
        });
        let event = normalizer.normalize(raw).unwrap();
        assert_eq!(event.chat_id(), "c1");
        assert!(matches!(
            event.kind,
            EventKind::Delete { ref message_id, .. } if message_id == "m9"
        ));
    }
}
