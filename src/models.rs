// Core data model shared by the sync engine, the store contract and the tests

use serde::{Deserialize, Serialize};

/// A user as known to the client. Presence fields are display-only and never
/// participate in ordering or aggregation decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<i64>,
}

/// Membership of a user in a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user: User,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Individual,
    Group,
}

/// A conversation as stored by the backend. Display name and avatar are only
/// stored for group chats; individual chats derive them from the counterpart
/// participant (see the chat list aggregator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub participants: Vec<Participant>,
    /// Joined in by the store on fetch so the chat list can show a preview
    /// without opening the conversation. `None` for a fresh chat.
    pub last_message: Option<Message>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
}

/// Kind-specific payload details. Everything is optional; a plain text
/// message carries no metadata at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub duration_secs: Option<u32>, // For audio/video
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending = 1,   // Shown locally, not yet accepted by the store
    Sent = 2,      // Accepted by the store
    Delivered = 3, // Delivered to the recipient's device
    Read = 4,      // Read by the recipient
    Failed = 5,    // Local send gave up; caller may retry or discard
}

impl DeliveryStatus {
    /// Position in the `sending < sent < delivered < read` lattice. `Failed`
    /// sits outside the lattice and is handled explicitly by the merge rules.
    pub fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Delivered => 3,
            DeliveryStatus::Read => 4,
            DeliveryStatus::Failed => 0,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, DeliveryStatus::Read)
    }
}

/// A message in a conversation. `id` is the server-assigned identifier once
/// confirmed, or a locally generated temporary identifier while a send is
/// pending. Within a conversation messages are totally ordered by
/// `(timestamp, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    /// Creation time in epoch milliseconds, assigned by the store on
    /// confirmation (local clock while pending).
    pub timestamp: i64,
    pub status: DeliveryStatus,
    pub reply_to: Option<String>,
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// True when this message counts against the viewer's unread total.
    pub fn is_unread_for(&self, viewer_id: &str) -> bool {
        self.sender_id != viewer_id && self.status.rank() < DeliveryStatus::Read.rank()
    }
}

/// A send the coordinator has issued locally but the store has not yet
/// confirmed. Destroyed on confirmation or terminal failure.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub temp_id: String,
    pub chat_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
    pub submitted_at: i64,
    pub attempts: u32,
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
