// Contracts for the external collaborators: the persistent chat store with
// its change-event feed, and the push-notification sender. Also contains
// MemoryStore, a complete in-memory implementation of the store contract
// used by the demo binary and the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{
    now_millis, Chat, ChatKind, DeliveryStatus, Message, Participant, User,
};

/// Errors reported by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or timed out; the caller may retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The referenced chat, message or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store refused the request outright; retrying will not help.
    #[error("rejected by store: {0}")]
    Rejected(String),
}

/// What a raw change-feed event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Insert,
    Update,
    Delete,
}

/// Where a raw event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    RemoteFeed,
    LocalAction,
}

/// A raw message change event as delivered by the store's feed or produced
/// by a local optimistic action. Insert/update carry a full snapshot; delete
/// carries only the identifiers.
#[derive(Debug, Clone)]
pub struct RawMessageEvent {
    pub kind: RawEventKind,
    pub source: EventSource,
    pub message: Option<Message>,
    pub message_id: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipKind {
    Joined,
    Left,
}

/// A raw participant change event from the chat-list feed.
#[derive(Debug, Clone)]
pub struct RawMembershipEvent {
    pub kind: MembershipKind,
    pub chat_id: String,
    pub user_id: String,
    pub user: Option<User>,
    pub joined_at: i64,
}

#[derive(Debug, Clone)]
pub enum RawEvent {
    Message(RawMessageEvent),
    Membership(RawMembershipEvent),
}

/// What a subscription covers: one conversation's messages, or everything
/// relevant to the viewer's chat list (membership changes plus message
/// traffic in all of the viewer's chats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeTarget {
    Conversation(String),
    ChatList(String),
}

/// A live change-feed registration. Dropping the subscription cancels it;
/// the store stops delivering and reclaims the slot on its next emit.
pub struct Subscription {
    pub target: SubscribeTarget,
    pub events: mpsc::UnboundedReceiver<RawEvent>,
}

impl Subscription {
    /// Explicit cancel; equivalent to dropping the handle.
    pub fn cancel(self) {}
}

/// Abstract contract for the persistent chat store and its change feed.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// All chats the viewer participates in, most recently active first.
    async fn fetch_chats(&self, viewer_id: &str) -> Result<Vec<Chat>, StoreError>;

    /// Full details of a single chat.
    async fn get_chat(&self, chat_id: &str) -> Result<Chat, StoreError>;

    /// Create a chat with the given participants.
    async fn create_chat(
        &self,
        kind: ChatKind,
        name: Option<String>,
        avatar_url: Option<String>,
        participant_ids: &[String],
    ) -> Result<Chat, StoreError>;

    /// Add participants to an existing chat.
    async fn add_participants(&self, chat_id: &str, user_ids: &[String]) -> Result<(), StoreError>;

    /// Remove a participant from a chat.
    async fn leave_chat(&self, chat_id: &str, user_id: &str) -> Result<(), StoreError>;

    /// A page of a conversation's history, oldest-first. `offset` counts
    /// back from the newest message.
    async fn fetch_history(
        &self,
        chat_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Persist a message. The store assigns the canonical identifier and
    /// timestamp and returns the confirmed record.
    async fn append_message(&self, message: &Message) -> Result<Message, StoreError>;

    /// Mark every inbound message in the chat as read for the viewer.
    /// Idempotent: marking a chat with nothing unread succeeds silently.
    async fn mark_read(&self, chat_id: &str, viewer_id: &str) -> Result<(), StoreError>;

    /// Remove a message.
    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError>;

    /// Register a change feed. Returns the cancel handle.
    fn subscribe(&self, target: SubscribeTarget) -> Subscription;
}

/// Payload attached to a push notification so the receiving client can route
/// straight to the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub chat_id: String,
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Push-notification collaborator. Fire-and-forget: failures are logged by
/// the caller and never block or fail a send confirmation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient_id: &str,
        title: &str,
        body: &str,
        payload: &NotificationPayload,
    ) -> Result<()>;
}

/// Notifier that drops everything. For callers without push plumbing.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _: &str, _: &str, _: &str, _: &NotificationPayload) -> Result<()> {
        Ok(())
    }
}

/// Notifier that logs instead of delivering. Used by the demo binary.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        recipient_id: &str,
        title: &str,
        body: &str,
        payload: &NotificationPayload,
    ) -> Result<()> {
        info!(
            "notify {}: {} - {} ({})",
            recipient_id,
            title,
            body,
            serde_json::to_string(payload)?
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct Subscriber {
    target: SubscribeTarget,
    tx: mpsc::UnboundedSender<RawEvent>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    chats: HashMap<String, Chat>,
    /// Messages per chat, kept sorted by `(timestamp, id)`.
    messages: HashMap<String, Vec<Message>>,
    subscribers: Vec<Subscriber>,
}

/// In-memory reference implementation of [`ChatStore`].
///
/// Assigns server identifiers and timestamps on append, emits change events
/// on its feeds the way the real backend would, and supports going "offline"
/// so tests can exercise the send retry path.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    mark_read_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore {
            state: Mutex::new(MemoryState::default()),
            offline: AtomicBool::new(false),
            mark_read_calls: AtomicUsize::new(0),
        })
    }

    /// How many `mark_read` calls reached the store. Lets tests verify that
    /// read receipts are batched rather than sent per message.
    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }

    /// Register a user so they can participate in chats.
    pub fn add_user(&self, user: User) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(user.id.clone(), user);
    }

    /// Update a user's display-only presence snapshot.
    pub fn set_presence(&self, user_id: &str, is_online: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.get_mut(user_id) {
            user.is_online = is_online;
            user.last_seen = Some(now_millis());
        }
    }

    /// Simulate losing the backend. While offline, `append_message` and
    /// `mark_read` fail with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Transient("store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Deliver an event to every live subscriber the filter matches,
    /// pruning subscribers whose receiving side has been dropped.
    fn emit(state: &mut MemoryState, event: RawEvent, matches: impl Fn(&SubscribeTarget) -> bool) {
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in state.subscribers.iter() {
            if matches(&sub.target) {
                // A send only fails when the receiver just dropped; skip it.
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    /// Matcher for message traffic in `chat_id`: the conversation's own feed
    /// plus the chat-list feed of every participant.
    fn message_targets(chat: &Chat, chat_id: &str) -> impl Fn(&SubscribeTarget) -> bool {
        let chat_id = chat_id.to_string();
        let participant_ids: Vec<String> =
            chat.participants.iter().map(|p| p.user.id.clone()).collect();
        move |target| match target {
            SubscribeTarget::Conversation(id) => *id == chat_id,
            SubscribeTarget::ChatList(viewer) => participant_ids.contains(viewer),
        }
    }

    fn sort_key(message: &Message) -> (i64, String) {
        (message.timestamp, message.id.clone())
    }

    fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
        let key = Self::sort_key(&message);
        let pos = messages
            .binary_search_by_key(&key, Self::sort_key)
            .unwrap_or_else(|pos| pos);
        messages.insert(pos, message);
    }

    /// Deliver a raw event on the chat's feeds verbatim, without touching
    /// stored state. Lets tests reproduce transport reordering, redelivery
    /// and malformed payloads.
    pub fn emit_raw(&self, chat_id: &str, event: RawEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        Self::emit(&mut state, event, Self::message_targets(&chat, chat_id));
        Ok(())
    }

    /// Inject an inbound message as if another client had sent it. Returns
    /// the confirmed record. Test and demo helper; goes through the same
    /// feed path as a real append.
    pub fn inject_message(&self, message: Message) -> Result<Message, StoreError> {
        let mut state = self.state.lock().unwrap();
        let chat = state
            .chats
            .get(&message.chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", message.chat_id)))?;

        let mut confirmed = message;
        if confirmed.id.is_empty() {
            confirmed.id = Uuid::new_v4().to_string();
        }
        Self::insert_sorted(
            state.messages.entry(confirmed.chat_id.clone()).or_default(),
            confirmed.clone(),
        );

        let event = RawEvent::Message(RawMessageEvent {
            kind: RawEventKind::Insert,
            source: EventSource::RemoteFeed,
            message: Some(confirmed.clone()),
            message_id: None,
            chat_id: Some(confirmed.chat_id.clone()),
        });
        Self::emit(&mut state, event, Self::message_targets(&chat, &confirmed.chat_id));
        Ok(confirmed)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn fetch_chats(&self, viewer_id: &str) -> Result<Vec<Chat>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut chats: Vec<Chat> = state
            .chats
            .values()
            .filter(|chat| chat.participants.iter().any(|p| p.user.id == viewer_id))
            .cloned()
            .collect();
        // Join in the newest message so the list renders previews without
        // opening conversations; sort most recently active first.
        for chat in chats.iter_mut() {
            chat.last_message = state
                .messages
                .get(&chat.id)
                .and_then(|msgs| msgs.last())
                .cloned();
        }
        chats.sort_by_key(|chat| {
            let last = chat
                .last_message
                .as_ref()
                .map(|m| m.timestamp)
                .unwrap_or(chat.created_at);
            std::cmp::Reverse(last)
        });
        Ok(chats)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Chat, StoreError> {
        let state = self.state.lock().unwrap();
        let mut chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        chat.last_message = state
            .messages
            .get(chat_id)
            .and_then(|msgs| msgs.last())
            .cloned();
        Ok(chat)
    }

    async fn create_chat(
        &self,
        kind: ChatKind,
        name: Option<String>,
        avatar_url: Option<String>,
        participant_ids: &[String],
    ) -> Result<Chat, StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();

        let joined_at = now_millis();
        let mut participants = Vec::with_capacity(participant_ids.len());
        for user_id in participant_ids {
            let user = state
                .users
                .get(user_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
            participants.push(Participant { user, joined_at });
        }

        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            kind,
            name,
            avatar_url,
            participants: participants.clone(),
            last_message: None,
            created_at: joined_at,
        };
        state.chats.insert(chat.id.clone(), chat.clone());
        debug!("created chat {} with {} participants", chat.id, participants.len());

        // Everyone in the chat learns about every membership row, the same
        // way the backend feed reports participant inserts.
        let viewer_ids: Vec<String> = participants.iter().map(|p| p.user.id.clone()).collect();
        for participant in &participants {
            let event = RawEvent::Membership(RawMembershipEvent {
                kind: MembershipKind::Joined,
                chat_id: chat.id.clone(),
                user_id: participant.user.id.clone(),
                user: Some(participant.user.clone()),
                joined_at,
            });
            Self::emit(&mut state, event, |target| match target {
                SubscribeTarget::ChatList(viewer) => viewer_ids.contains(viewer),
                _ => false,
            });
        }
        Ok(chat)
    }

    async fn add_participants(&self, chat_id: &str, user_ids: &[String]) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();

        let joined_at = now_millis();
        let mut joined = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let user = state
                .users
                .get(user_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
            joined.push(Participant { user, joined_at });
        }

        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        for participant in &joined {
            if !chat.participants.iter().any(|p| p.user.id == participant.user.id) {
                chat.participants.push(participant.clone());
            }
        }
        let viewer_ids: Vec<String> =
            chat.participants.iter().map(|p| p.user.id.clone()).collect();

        for participant in joined {
            let event = RawEvent::Membership(RawMembershipEvent {
                kind: MembershipKind::Joined,
                chat_id: chat_id.to_string(),
                user_id: participant.user.id.clone(),
                user: Some(participant.user),
                joined_at,
            });
            Self::emit(&mut state, event, |target| match target {
                SubscribeTarget::ChatList(viewer) => viewer_ids.contains(viewer),
                _ => false,
            });
        }
        Ok(())
    }

    async fn leave_chat(&self, chat_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        let before = chat.participants.len();
        chat.participants.retain(|p| p.user.id != user_id);
        if chat.participants.len() == before {
            return Err(StoreError::NotFound(format!("user {} in chat {}", user_id, chat_id)));
        }
        // The leaver still gets the event so their own list can drop the chat.
        let mut viewer_ids: Vec<String> =
            chat.participants.iter().map(|p| p.user.id.clone()).collect();
        viewer_ids.push(user_id.to_string());

        let event = RawEvent::Membership(RawMembershipEvent {
            kind: MembershipKind::Left,
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            user: None,
            joined_at: now_millis(),
        });
        Self::emit(&mut state, event, |target| match target {
            SubscribeTarget::ChatList(viewer) => viewer_ids.contains(viewer),
            _ => false,
        });
        Ok(())
    }

    async fn fetch_history(
        &self,
        chat_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().unwrap();
        if !state.chats.contains_key(chat_id) {
            return Err(StoreError::NotFound(format!("chat {}", chat_id)));
        }
        let messages = state.messages.get(chat_id).map(|m| m.as_slice()).unwrap_or(&[]);
        // Page backwards from the newest message, but return each page
        // oldest-first.
        let end = messages.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(messages[start..end].to_vec())
    }

    async fn append_message(&self, message: &Message) -> Result<Message, StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let chat = state
            .chats
            .get(&message.chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", message.chat_id)))?;

        let mut confirmed = message.clone();
        confirmed.id = Uuid::new_v4().to_string();
        confirmed.timestamp = now_millis();
        confirmed.status = DeliveryStatus::Sent;
        Self::insert_sorted(
            state.messages.entry(confirmed.chat_id.clone()).or_default(),
            confirmed.clone(),
        );

        let event = RawEvent::Message(RawMessageEvent {
            kind: RawEventKind::Insert,
            source: EventSource::RemoteFeed,
            message: Some(confirmed.clone()),
            message_id: None,
            chat_id: Some(confirmed.chat_id.clone()),
        });
        Self::emit(&mut state, event, Self::message_targets(&chat, &confirmed.chat_id));
        Ok(confirmed)
    }

    async fn mark_read(&self, chat_id: &str, viewer_id: &str) -> Result<(), StoreError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;

        let mut updated = Vec::new();
        if let Some(messages) = state.messages.get_mut(chat_id) {
            for message in messages.iter_mut() {
                if message.sender_id != viewer_id && !message.status.is_read() {
                    message.status = DeliveryStatus::Read;
                    updated.push(message.clone());
                }
            }
        }
        debug!("mark_read {}: {} messages updated", chat_id, updated.len());

        for message in updated {
            let event = RawEvent::Message(RawMessageEvent {
                kind: RawEventKind::Update,
                source: EventSource::RemoteFeed,
                message: Some(message),
                message_id: None,
                chat_id: Some(chat_id.to_string()),
            });
            Self::emit(&mut state, event, Self::message_targets(&chat, chat_id));
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();

        let chat_id = state
            .messages
            .iter()
            .find(|(_, msgs)| msgs.iter().any(|m| m.id == message_id))
            .map(|(chat_id, _)| chat_id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))?;
        let chat = state
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        if let Some(messages) = state.messages.get_mut(&chat_id) {
            messages.retain(|m| m.id != message_id);
        }

        let event = RawEvent::Message(RawMessageEvent {
            kind: RawEventKind::Delete,
            source: EventSource::RemoteFeed,
            message: None,
            message_id: Some(message_id.to_string()),
            chat_id: Some(chat_id.clone()),
        });
        Self::emit(&mut state, event, Self::message_targets(&chat, &chat_id));
        Ok(())
    }

    fn subscribe(&self, target: SubscribeTarget) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.subscribers.push(Subscriber { target: target.clone(), tx });
        debug!("feed subscription registered: {:?}", target);
        Subscription { target, events: rx }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("feed subscription cancelled: {:?}", self.target);
    }
}
