// Chat summary aggregator: the viewer's conversation list with last-message
// pointers, unread counts and recency ordering. Pure state machine; the
// engine's aggregator task owns one instance and feeds it canonical events.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;

use crate::models::{Chat, ChatKind, Message, Participant};
use crate::sync::normalizer::{CanonicalEvent, EventKind};
use crate::sync::timeline::merge_status;

/// How many recent messages to keep per chat so the last-message pointer can
/// be recomputed after a delete without refetching.
const RECENT_WINDOW: usize = 32;

/// Placeholder display name when an individual chat has no counterpart
/// participant to derive from.
const UNKNOWN_NAME: &str = "Unknown";

/// One row of the chat list as handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSummary {
    pub chat_id: String,
    pub kind: ChatKind,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message: Option<Message>,
    pub unread_count: usize,
    pub last_activity: i64,
}

struct ChatEntry {
    chat: Chat,
    /// Bounded newest-first window of message snapshots, keyed by
    /// `(timestamp, id)` like the timeline.
    recent: BTreeMap<(i64, String), Message>,
    /// Ids of inbound messages the viewer has not read yet.
    unread: HashSet<String>,
    /// Monotone; never moves backward even when the newest message is
    /// deleted.
    last_activity: i64,
    /// True until the real chat record has been fetched; entries appear in
    /// skeleton form when message traffic precedes chat metadata.
    skeleton: bool,
}

impl ChatEntry {
    fn skeleton(chat_id: &str) -> Self {
        ChatEntry {
            chat: Chat {
                id: chat_id.to_string(),
                kind: ChatKind::Group,
                name: None,
                avatar_url: None,
                participants: Vec::new(),
                last_message: None,
                created_at: 0,
            },
            recent: BTreeMap::new(),
            unread: HashSet::new(),
            last_activity: 0,
            skeleton: true,
        }
    }

    fn from_chat(chat: Chat) -> Self {
        let mut entry = ChatEntry {
            last_activity: chat.created_at,
            chat,
            recent: BTreeMap::new(),
            unread: HashSet::new(),
            skeleton: false,
        };
        if let Some(last) = entry.chat.last_message.take() {
            entry.last_activity = entry.last_activity.max(last.timestamp);
            entry.remember(last);
        }
        entry
    }

    fn remember(&mut self, message: Message) {
        self.recent
            .insert((message.timestamp, message.id.clone()), message);
        while self.recent.len() > RECENT_WINDOW {
            let oldest = self.recent.keys().next().cloned().expect("non-empty");
            self.recent.remove(&oldest);
        }
    }

    fn last_message(&self) -> Option<&Message> {
        self.recent.values().next_back()
    }
}

/// Outcome of applying one event to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutcome {
    Changed,
    Unchanged,
    /// The event referenced a chat the list has no metadata for; the caller
    /// should fetch the chat record and `upsert_chat` it. The event itself
    /// has already been absorbed into a skeleton entry.
    NeedsChat(String),
}

/// The viewer's ordered conversation list.
pub struct ChatList {
    viewer_id: String,
    chats: HashMap<String, ChatEntry>,
}

impl ChatList {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        ChatList { viewer_id: viewer_id.into(), chats: HashMap::new() }
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.chats.contains_key(chat_id)
    }

    /// Seed from the initial `fetch_chats` load.
    pub fn seed(&mut self, chats: Vec<Chat>) {
        for chat in chats {
            self.upsert_chat(chat);
        }
    }

    /// Install or refresh a chat's metadata, keeping any aggregation state
    /// already accumulated in a skeleton entry.
    pub fn upsert_chat(&mut self, chat: Chat) {
        match self.chats.get_mut(&chat.id) {
            Some(entry) => {
                entry.last_activity = entry.last_activity.max(chat.created_at);
                entry.chat = chat;
                entry.skeleton = false;
                if let Some(last) = entry.chat.last_message.take() {
                    entry.last_activity = entry.last_activity.max(last.timestamp);
                    entry.remember(last);
                }
            }
            None => {
                self.chats.insert(chat.id.clone(), ChatEntry::from_chat(chat));
            }
        }
    }

    /// Apply one canonical event.
    pub fn apply(&mut self, event: &CanonicalEvent) -> ListOutcome {
        match &event.kind {
            EventKind::Insert(message) => self.on_insert(message),
            EventKind::Update(message) => self.on_update(message),
            EventKind::Delete { chat_id, message_id } => self.on_delete(chat_id, message_id),
            EventKind::MemberJoined { chat_id, participant } => {
                self.on_member_joined(chat_id, participant.clone())
            }
            EventKind::MemberLeft { chat_id, user_id } => self.on_member_left(chat_id, user_id),
        }
    }

    /// Reconcile an optimistic send: drop the temporary entry from the
    /// recent window and take the server-confirmed record instead.
    pub fn replace_temporary(
        &mut self,
        chat_id: &str,
        temp_id: &str,
        confirmed: Message,
    ) -> ListOutcome {
        let entry = match self.chats.get_mut(chat_id) {
            Some(entry) => entry,
            None => return ListOutcome::Unchanged,
        };
        let temp_key = entry
            .recent
            .iter()
            .find(|(_, m)| m.id == temp_id)
            .map(|(key, _)| key.clone());
        if let Some(key) = temp_key {
            entry.recent.remove(&key);
        }
        entry.last_activity = entry.last_activity.max(confirmed.timestamp);
        entry.remember(confirmed);
        ListOutcome::Changed
    }

    /// The read-state tracker confirmed a read-receipt flush: nothing in
    /// this chat is unread anymore.
    pub fn mark_read_flushed(&mut self, chat_id: &str) -> ListOutcome {
        match self.chats.get_mut(chat_id) {
            Some(entry) => {
                if entry.unread.is_empty() {
                    ListOutcome::Unchanged
                } else {
                    entry.unread.clear();
                    ListOutcome::Changed
                }
            }
            None => ListOutcome::Unchanged,
        }
    }

    /// The list in display order: most recent activity first, ties broken by
    /// chat id for a stable order.
    pub fn summaries(&self) -> Vec<ChatSummary> {
        let mut rows: Vec<ChatSummary> = self.chats.values().map(|e| self.summarize(e)).collect();
        rows.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.chat_id.cmp(&b.chat_id))
        });
        rows
    }

    pub fn summary(&self, chat_id: &str) -> Option<ChatSummary> {
        self.chats.get(chat_id).map(|e| self.summarize(e))
    }

    fn summarize(&self, entry: &ChatEntry) -> ChatSummary {
        let (display_name, avatar_url) = self.derive_display(&entry.chat);
        ChatSummary {
            chat_id: entry.chat.id.clone(),
            kind: entry.chat.kind,
            display_name,
            avatar_url,
            participants: entry.chat.participants.clone(),
            last_message: entry.last_message().cloned(),
            unread_count: entry.unread.len(),
            last_activity: entry.last_activity,
        }
    }

    /// Individual chats display the counterpart participant; group chats
    /// display their stored name. Missing data falls back to a placeholder
    /// rather than failing.
    fn derive_display(&self, chat: &Chat) -> (String, Option<String>) {
        match chat.kind {
            ChatKind::Individual => chat
                .participants
                .iter()
                .find(|p| p.user.id != self.viewer_id)
                .map(|p| (p.user.name.clone(), p.user.avatar_url.clone()))
                .unwrap_or_else(|| (UNKNOWN_NAME.to_string(), None)),
            ChatKind::Group => (
                chat.name.clone().unwrap_or_else(|| UNKNOWN_NAME.to_string()),
                chat.avatar_url.clone(),
            ),
        }
    }

    fn entry_mut(&mut self, chat_id: &str) -> (&mut ChatEntry, bool) {
        let known = self.chats.contains_key(chat_id);
        if !known {
            debug!("chat list: skeleton entry for unknown chat {}", chat_id);
        }
        let entry = self
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatEntry::skeleton(chat_id));
        (entry, known)
    }

    fn on_insert(&mut self, message: &Message) -> ListOutcome {
        let viewer_id = self.viewer_id.clone();
        let (entry, known) = self.entry_mut(&message.chat_id);
        if message.is_unread_for(&viewer_id) {
            entry.unread.insert(message.id.clone());
        }
        entry.remember(message.clone());
        entry.last_activity = entry.last_activity.max(message.timestamp);
        if known {
            ListOutcome::Changed
        } else {
            ListOutcome::NeedsChat(message.chat_id.clone())
        }
    }

    fn on_update(&mut self, message: &Message) -> ListOutcome {
        let entry = match self.chats.get_mut(&message.chat_id) {
            Some(entry) => entry,
            None => return ListOutcome::Unchanged,
        };
        let mut changed = false;
        let key = (message.timestamp, message.id.clone());
        if let Some(existing) = entry.recent.get_mut(&key) {
            let before = existing.clone();
            existing.content = message.content.clone();
            existing.status = merge_status(existing.status, message.status);
            changed = *existing != before;
        }
        if message.status.is_read() && entry.unread.remove(&message.id) {
            changed = true;
        }
        if changed {
            ListOutcome::Changed
        } else {
            ListOutcome::Unchanged
        }
    }

    fn on_delete(&mut self, chat_id: &str, message_id: &str) -> ListOutcome {
        let entry = match self.chats.get_mut(chat_id) {
            Some(entry) => entry,
            None => return ListOutcome::Unchanged,
        };
        let key = entry
            .recent
            .iter()
            .find(|(_, m)| m.id == message_id)
            .map(|(key, _)| key.clone());
        let removed_recent = match key {
            Some(key) => entry.recent.remove(&key).is_some(),
            None => false,
        };
        let removed_unread = entry.unread.remove(message_id);
        // last_activity stays put: it is monotone even when the newest
        // message goes away. The pointer itself recomputes from the window.
        if removed_recent || removed_unread {
            ListOutcome::Changed
        } else {
            ListOutcome::Unchanged
        }
    }

    fn on_member_joined(&mut self, chat_id: &str, participant: Participant) -> ListOutcome {
        let joined_at = participant.joined_at;
        let (entry, known) = self.entry_mut(chat_id);
        if !entry
            .chat
            .participants
            .iter()
            .any(|p| p.user.id == participant.user.id)
        {
            entry.chat.participants.push(participant);
        }
        entry.last_activity = entry.last_activity.max(joined_at);
        if known && !entry.skeleton {
            ListOutcome::Changed
        } else {
            ListOutcome::NeedsChat(chat_id.to_string())
        }
    }

    fn on_member_left(&mut self, chat_id: &str, user_id: &str) -> ListOutcome {
        // The viewer leaving drops the whole conversation from their list.
        if user_id == self.viewer_id {
            return match self.chats.remove(chat_id) {
                Some(_) => ListOutcome::Changed,
                None => ListOutcome::Unchanged,
            };
        }
        match self.chats.get_mut(chat_id) {
            Some(entry) => {
                let before = entry.chat.participants.len();
                entry.chat.participants.retain(|p| p.user.id != user_id);
                if entry.chat.participants.len() != before {
                    ListOutcome::Changed
                } else {
                    ListOutcome::Unchanged
                }
            }
            None => ListOutcome::Unchanged,
        }
    }
}
