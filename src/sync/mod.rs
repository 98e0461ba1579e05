// Message synchronization engine. This module owns the moving parts: one
// actor task per open conversation (single writer for that conversation's
// timeline), one aggregator task for the chat list, and one ingestion task
// per store subscription feeding both through the event normalizer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

pub mod chat_list;
pub mod normalizer;
pub mod outbox;
pub mod read_state;
pub mod timeline;

pub use chat_list::{ChatList, ChatSummary, ListOutcome};
pub use normalizer::{CanonicalEvent, EventKind, EventNormalizer, NormalizeError};
pub use outbox::{SendError, SendHandle, SendStatus};
pub use timeline::Timeline;

use crate::models::{Chat, ChatKind, Message, PendingMessage};
use crate::store::{ChatStore, Notifier, StoreError, SubscribeTarget, Subscription};
use read_state::ReadCommand;

/// Messages fetched per history page, matching the backend's default.
pub const HISTORY_PAGE_SIZE: usize = 50;

/// Hard ceiling on message content; larger submissions are rejected before
/// they reach the network.
pub const MAX_CONTENT_BYTES: usize = 16 * 1024;

/// Command and event channel depth for the internal tasks.
const CHANNEL_BUFFER: usize = 100;

/// Commands consumed by a conversation's actor task. The actor is the only
/// writer of that conversation's timeline.
#[derive(Debug)]
pub(crate) enum ConversationCommand {
    Apply(CanonicalEvent),
    Replace { temp_id: String, confirmed: Message },
}

/// Commands consumed by the chat-list aggregator task.
#[derive(Debug)]
pub(crate) enum ChatListCommand {
    Apply(CanonicalEvent),
    Upsert(Chat),
    Replace { chat_id: String, temp_id: String, confirmed: Message },
    ReadFlushed(String),
    /// Internal: a chat-metadata fetch failed; clear the in-progress guard
    /// so a later event can trigger another attempt.
    FetchFailed(String),
}

struct ConversationHandle {
    cmd_tx: mpsc::Sender<ConversationCommand>,
    view: watch::Receiver<Vec<Message>>,
    visible: Arc<AtomicBool>,
    ingest_task: JoinHandle<()>,
    actor_task: JoinHandle<()>,
}

/// A read-only, continuously updated view of one open conversation.
/// `messages.borrow()` is the current ordered timeline; `changed().await`
/// wakes on every mutation.
pub struct ConversationView {
    pub chat_id: String,
    pub messages: watch::Receiver<Vec<Message>>,
}

/// The synchronization engine: the single entry point the presentation
/// layer talks to.
pub struct SyncEngine {
    viewer_id: String,
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn Notifier>,
    normalizer: Arc<EventNormalizer>,
    conversations: Arc<TokioMutex<HashMap<String, ConversationHandle>>>,
    /// Sends issued but not yet confirmed, by temporary id.
    pending_sends: Arc<TokioMutex<HashMap<String, PendingMessage>>>,
    /// Sends that exhausted their retries, kept so the caller can retry or
    /// discard them.
    failed_sends: Arc<TokioMutex<HashMap<String, PendingMessage>>>,
    /// Outstanding submission per conversation, chat id -> temp id.
    in_flight: Arc<TokioMutex<HashMap<String, String>>>,
    list_tx: mpsc::Sender<ChatListCommand>,
    chat_list_view: watch::Receiver<Vec<ChatSummary>>,
    read_tx: mpsc::Sender<ReadCommand>,
    list_task: JoinHandle<()>,
    list_ingest_task: JoinHandle<()>,
    read_task: JoinHandle<()>,
}

impl SyncEngine {
    /// Boot the engine for one viewer: seed the chat list from the store,
    /// subscribe to the viewer's chat-list feed and start the background
    /// tasks.
    pub async fn start(
        store: Arc<dyn ChatStore>,
        notifier: Arc<dyn Notifier>,
        viewer_id: impl Into<String>,
    ) -> Result<Self> {
        let viewer_id = viewer_id.into();
        let normalizer = Arc::new(EventNormalizer::new());

        let mut list = ChatList::new(viewer_id.clone());
        match store.fetch_chats(&viewer_id).await {
            Ok(chats) => {
                info!("loaded {} chats for {}", chats.len(), viewer_id);
                list.seed(chats);
            }
            Err(e) => {
                // The list starts empty and fills in from the feed.
                error!("initial chat load failed for {}: {}", viewer_id, e);
            }
        }

        let (list_tx, list_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (summaries_tx, chat_list_view) = watch::channel(list.summaries());
        let list_task = tokio::spawn(run_chat_list(
            store.clone(),
            list,
            list_rx,
            list_tx.clone(),
            summaries_tx,
        ));

        let subscription = store.subscribe(SubscribeTarget::ChatList(viewer_id.clone()));
        let list_ingest_task = tokio::spawn(run_list_ingest(
            subscription,
            normalizer.clone(),
            list_tx.clone(),
        ));

        let (read_tx, read_rx) = mpsc::channel(CHANNEL_BUFFER);
        let read_task = tokio::spawn(read_state::run_tracker(
            store.clone(),
            viewer_id.clone(),
            read_rx,
            list_tx.clone(),
        ));

        Ok(SyncEngine {
            viewer_id,
            store,
            notifier,
            normalizer,
            conversations: Arc::new(TokioMutex::new(HashMap::new())),
            pending_sends: Arc::new(TokioMutex::new(HashMap::new())),
            failed_sends: Arc::new(TokioMutex::new(HashMap::new())),
            in_flight: Arc::new(TokioMutex::new(HashMap::new())),
            list_tx,
            chat_list_view,
            read_tx,
            list_task,
            list_ingest_task,
            read_task,
        })
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// The live chat list. `borrow()` for the current ordered summaries,
    /// `changed().await` to wake on updates.
    pub fn chat_list(&self) -> watch::Receiver<Vec<ChatSummary>> {
        self.chat_list_view.clone()
    }

    /// Open a conversation: subscribe to its feed, load the first history
    /// page and start its actor. Reopening an already open conversation
    /// returns the existing view and re-flushes read state.
    pub async fn open_conversation(&self, chat_id: &str) -> Result<ConversationView> {
        let mut conversations = self.conversations.lock().await;
        if let Some(handle) = conversations.get(chat_id) {
            handle.visible.store(true, Ordering::SeqCst);
            let _ = self.read_tx.send(ReadCommand::Flush(chat_id.to_string())).await;
            return Ok(ConversationView {
                chat_id: chat_id.to_string(),
                messages: handle.view.clone(),
            });
        }

        info!("opening conversation {}", chat_id);
        let subscription = self
            .store
            .subscribe(SubscribeTarget::Conversation(chat_id.to_string()));
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (view_tx, view_rx) = watch::channel(Vec::new());
        let visible = Arc::new(AtomicBool::new(true));

        // Register with the read tracker before the actor can request its
        // first flush.
        let _ = self
            .read_tx
            .send(ReadCommand::Track { chat_id: chat_id.to_string(), view: view_rx.clone() })
            .await;

        let actor_task = tokio::spawn(run_conversation(
            chat_id.to_string(),
            self.store.clone(),
            self.viewer_id.clone(),
            visible.clone(),
            cmd_rx,
            view_tx,
            self.read_tx.clone(),
        ));
        let ingest_task = tokio::spawn(run_conversation_ingest(
            subscription,
            self.normalizer.clone(),
            cmd_tx.clone(),
        ));

        conversations.insert(
            chat_id.to_string(),
            ConversationHandle {
                cmd_tx,
                view: view_rx.clone(),
                visible,
                ingest_task,
                actor_task,
            },
        );
        Ok(ConversationView { chat_id: chat_id.to_string(), messages: view_rx })
    }

    /// Close a conversation view: cancel its feed subscription and discard
    /// any in-flight history load. A pending send is NOT cancelled; it
    /// completes or fails against the store independently.
    pub async fn close_conversation(&self, chat_id: &str) {
        let mut conversations = self.conversations.lock().await;
        if let Some(handle) = conversations.remove(chat_id) {
            info!("closing conversation {}", chat_id);
            handle.visible.store(false, Ordering::SeqCst);
            // Aborting the ingest task drops the Subscription, which is the
            // feed's cancel handle.
            handle.ingest_task.abort();
            handle.actor_task.abort();
            let _ = self.read_tx.send(ReadCommand::Forget(chat_id.to_string())).await;
        }
    }

    /// Explicitly flush read state for a conversation the viewer is looking
    /// at. Idempotent; a no-op when nothing is unread.
    pub async fn mark_conversation_read(&self, chat_id: &str) {
        let _ = self.read_tx.send(ReadCommand::Flush(chat_id.to_string())).await;
    }

    /// Create a chat through the store. The viewer is always included in
    /// the participant set.
    pub async fn create_chat(
        &self,
        kind: ChatKind,
        name: Option<String>,
        avatar_url: Option<String>,
        participant_ids: &[String],
    ) -> Result<Chat, StoreError> {
        let mut ids: Vec<String> = participant_ids.to_vec();
        if !ids.iter().any(|id| *id == self.viewer_id) {
            ids.push(self.viewer_id.clone());
        }
        let chat = self.store.create_chat(kind, name, avatar_url, &ids).await?;
        // The membership feed will announce it too; upserting here just
        // makes the new chat visible without waiting on the feed.
        let _ = self.list_tx.send(ChatListCommand::Upsert(chat.clone())).await;
        Ok(chat)
    }

    /// Leave a chat: close any open view, then drop the membership. The
    /// feed's member-left event removes the chat from the local list.
    pub async fn leave_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        self.close_conversation(chat_id).await;
        self.store.leave_chat(chat_id, &self.viewer_id).await
    }

    /// Delete a message. A missing message is logged and treated as a
    /// no-op; the feed's delete event handles local state.
    pub async fn delete_message(&self, message_id: &str) -> Result<(), StoreError> {
        match self.store.delete_message(message_id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(what)) => {
                warn!("delete of missing {} ignored", what);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the background tasks. Conversations should be closed first;
    /// any remaining ones are torn down.
    pub async fn shutdown(self) {
        let mut conversations = self.conversations.lock().await;
        for (_, handle) in conversations.drain() {
            handle.ingest_task.abort();
            handle.actor_task.abort();
        }
        drop(conversations);
        self.list_ingest_task.abort();
        self.list_task.abort();
        self.read_task.abort();
    }

    /// Look up the command channel of an open conversation.
    pub(crate) async fn conversation_tx(
        &self,
        chat_id: &str,
    ) -> Option<mpsc::Sender<ConversationCommand>> {
        self.conversations
            .lock()
            .await
            .get(chat_id)
            .map(|handle| handle.cmd_tx.clone())
    }
}

/// Ingestion for one conversation's feed: normalize and hand off to the
/// actor, in arrival order. Malformed events are logged and dropped; the
/// stream keeps flowing.
async fn run_conversation_ingest(
    mut subscription: Subscription,
    normalizer: Arc<EventNormalizer>,
    cmd_tx: mpsc::Sender<ConversationCommand>,
) {
    while let Some(raw) = subscription.events.recv().await {
        match normalizer.normalize(raw) {
            Ok(event) => {
                if cmd_tx.send(ConversationCommand::Apply(event)).await.is_err() {
                    // Actor gone; the view was closed.
                    break;
                }
            }
            Err(e) => warn!("dropping malformed feed event: {}", e),
        }
    }
    debug!("conversation ingest finished");
}

/// Ingestion for the viewer's chat-list feed.
async fn run_list_ingest(
    mut subscription: Subscription,
    normalizer: Arc<EventNormalizer>,
    list_tx: mpsc::Sender<ChatListCommand>,
) {
    while let Some(raw) = subscription.events.recv().await {
        match normalizer.normalize(raw) {
            Ok(event) => {
                if list_tx.send(ChatListCommand::Apply(event)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("dropping malformed feed event: {}", e),
        }
    }
    debug!("chat-list ingest finished");
}

/// Actor for one open conversation. Exclusive owner of the timeline: loads
/// the first history page, then applies commands in order and publishes a
/// snapshot after every change.
async fn run_conversation(
    chat_id: String,
    store: Arc<dyn ChatStore>,
    viewer_id: String,
    visible: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<ConversationCommand>,
    view_tx: watch::Sender<Vec<Message>>,
    read_tx: mpsc::Sender<ReadCommand>,
) {
    let mut timeline = Timeline::new(chat_id.clone());

    // Initial bulk load. Live events queue up in the command channel while
    // this suspends and are applied afterwards; the merge rules make any
    // overlap harmless.
    match store.fetch_history(&chat_id, HISTORY_PAGE_SIZE, 0).await {
        Ok(history) => {
            debug!("loaded {} messages for {}", history.len(), chat_id);
            timeline.load(history);
        }
        Err(StoreError::NotFound(what)) => warn!("history load: {} does not exist", what),
        Err(e) => error!("history load for {} failed: {}", chat_id, e),
    }
    let _ = view_tx.send(timeline.snapshot());
    // The viewer just opened this conversation; whatever loaded unread gets
    // flushed in one batch.
    let _ = read_tx.send(ReadCommand::Flush(chat_id.clone())).await;

    let mut commands = ReceiverStream::new(cmd_rx);
    while let Some(command) = commands.next().await {
        match command {
            ConversationCommand::Apply(event) => {
                let inbound_insert = matches!(
                    &event.kind,
                    EventKind::Insert(m) if m.sender_id != viewer_id
                );
                if timeline.apply(&event) {
                    let _ = view_tx.send(timeline.snapshot());
                }
                // New inbound traffic while the view is on screen gets
                // batched into a read-receipt flush.
                if inbound_insert && visible.load(Ordering::SeqCst) {
                    let _ = read_tx.send(ReadCommand::Flush(chat_id.clone())).await;
                }
            }
            ConversationCommand::Replace { temp_id, confirmed } => {
                timeline.replace_temporary(&temp_id, confirmed);
                let _ = view_tx.send(timeline.snapshot());
            }
        }
    }
    debug!("conversation actor for {} finished", chat_id);
}

/// The chat-list aggregator task: sole owner of the `ChatList`, publishing
/// summary snapshots after every change. Chats referenced by traffic before
/// their metadata is known are fetched asynchronously and upserted.
async fn run_chat_list(
    store: Arc<dyn ChatStore>,
    mut list: ChatList,
    mut rx: mpsc::Receiver<ChatListCommand>,
    self_tx: mpsc::Sender<ChatListCommand>,
    summaries_tx: watch::Sender<Vec<ChatSummary>>,
) {
    let mut fetching: HashSet<String> = HashSet::new();

    while let Some(command) = rx.recv().await {
        let outcome = match command {
            ChatListCommand::Apply(event) => list.apply(&event),
            ChatListCommand::Upsert(chat) => {
                fetching.remove(&chat.id);
                list.upsert_chat(chat);
                ListOutcome::Changed
            }
            ChatListCommand::Replace { chat_id, temp_id, confirmed } => {
                list.replace_temporary(&chat_id, &temp_id, confirmed)
            }
            ChatListCommand::ReadFlushed(chat_id) => list.mark_read_flushed(&chat_id),
            ChatListCommand::FetchFailed(chat_id) => {
                fetching.remove(&chat_id);
                ListOutcome::Unchanged
            }
        };

        match outcome {
            ListOutcome::Unchanged => {}
            ListOutcome::Changed => {
                let _ = summaries_tx.send(list.summaries());
            }
            ListOutcome::NeedsChat(chat_id) => {
                // The skeleton entry already changed; publish, then fill in
                // the metadata off the hot path.
                let _ = summaries_tx.send(list.summaries());
                if fetching.insert(chat_id.clone()) {
                    let store = store.clone();
                    let self_tx = self_tx.clone();
                    tokio::spawn(async move {
                        match store.get_chat(&chat_id).await {
                            Ok(chat) => {
                                let _ = self_tx.send(ChatListCommand::Upsert(chat)).await;
                            }
                            Err(e) => {
                                warn!("chat {} lookup failed: {}", chat_id, e);
                                let _ = self_tx.send(ChatListCommand::FetchFailed(chat_id)).await;
                            }
                        }
                    });
                }
            }
        }
    }
    debug!("chat-list aggregator finished");
}
