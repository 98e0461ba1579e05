// Optimistic send coordinator: shows a message locally the moment the
// caller submits it, confirms it against the store in the background with a
// bounded retry, and reconciles the temporary entry with the
// server-confirmed record (or marks it failed so the caller can retry).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::timeout;
use uuid::Uuid;

use crate::models::{now_millis, DeliveryStatus, Message, MessageKind, PendingMessage};
use crate::store::{
    ChatStore, EventSource, NotificationPayload, Notifier, RawEvent, RawEventKind,
    RawMessageEvent, StoreError,
};
use crate::sync::chat_list::ChatSummary;
use crate::sync::normalizer::EventNormalizer;
use crate::sync::{ChatListCommand, ConversationCommand, SyncEngine, MAX_CONTENT_BYTES};

/// Total attempts per submission: the initial try plus one automatic retry.
const MAX_SEND_ATTEMPTS: u32 = 2;
/// Fixed delay before the automatic retry, plus a little jitter.
const RETRY_DELAY_MS: u64 = 500;
const RETRY_JITTER_MS: u64 = 250;
/// Per-attempt ceiling on the store round-trip.
const ATTEMPT_TIMEOUT_SECS: u64 = 5;
/// Notification bodies carry at most this much of the message.
const NOTIFY_PREVIEW_CHARS: usize = 140;

/// Why a submission was rejected or gave up.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("message content exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("a send is already outstanding for chat {0}")]
    InFlight(String),

    #[error("conversation {0} is not open")]
    NotOpen(String),

    #[error("no failed send {0} to retry or discard")]
    UnknownPending(String),
}

/// Progress of one submission, delivered on the handle's status stream.
#[derive(Debug, Clone)]
pub enum SendStatus {
    /// An attempt failed transiently; another is coming.
    Retrying { attempt: u32 },
    /// The store accepted the message.
    Confirmed { message_id: String, timestamp: i64 },
    /// All attempts exhausted. The timeline entry is marked failed, not
    /// removed; retry or discard it by temp id.
    Failed { temp_id: String, reason: String },
}

/// Returned by `submit` as soon as the local entry is visible; the network
/// outcome arrives on `status` asynchronously.
pub struct SendHandle {
    pub temp_id: String,
    pub chat_id: String,
    pub status: mpsc::Receiver<SendStatus>,
}

/// Everything the background send task needs, detached from the engine so a
/// pending send survives the conversation view closing.
struct SendContext {
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn Notifier>,
    normalizer: Arc<EventNormalizer>,
    cmd_tx: mpsc::Sender<ConversationCommand>,
    list_tx: mpsc::Sender<ChatListCommand>,
    pending_sends: Arc<TokioMutex<HashMap<String, PendingMessage>>>,
    failed_sends: Arc<TokioMutex<HashMap<String, PendingMessage>>>,
    in_flight: Arc<TokioMutex<HashMap<String, String>>>,
    chat_list: watch::Receiver<Vec<ChatSummary>>,
    viewer_id: String,
}

impl SyncEngine {
    /// Submit a message. The entry appears in the timeline immediately with
    /// status `Sending`; the returned handle reports confirmation or
    /// failure. At most one submission may be outstanding per conversation.
    pub async fn submit(
        &self,
        chat_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<SendHandle, SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }
        if content.len() > MAX_CONTENT_BYTES {
            return Err(SendError::Oversized { limit: MAX_CONTENT_BYTES });
        }
        let cmd_tx = self
            .conversation_tx(chat_id)
            .await
            .ok_or_else(|| SendError::NotOpen(chat_id.to_string()))?;

        let temp_id = Uuid::new_v4().to_string();
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(chat_id) {
                return Err(SendError::InFlight(chat_id.to_string()));
            }
            in_flight.insert(chat_id.to_string(), temp_id.clone());
        }

        let message = Message {
            id: temp_id.clone(),
            chat_id: chat_id.to_string(),
            sender_id: self.viewer_id.clone(),
            content: content.to_string(),
            kind,
            timestamp: now_millis(),
            status: DeliveryStatus::Sending,
            reply_to: None,
            metadata: None,
        };
        let pending = PendingMessage {
            temp_id: temp_id.clone(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            kind,
            reply_to: None,
            submitted_at: message.timestamp,
            attempts: 0,
        };
        self.pending_sends.lock().await.insert(temp_id.clone(), pending);

        // The optimistic insert: visible before any network round-trip.
        info!("submitting {} to {} as {}", kind_label(kind), chat_id, temp_id);
        self.dispatch_local(
            RawMessageEvent {
                kind: RawEventKind::Insert,
                source: EventSource::LocalAction,
                message: Some(message.clone()),
                message_id: None,
                chat_id: None,
            },
            Some(&cmd_tx),
        )
        .await;

        Ok(self.launch(cmd_tx, message))
    }

    /// Re-submit a failed send under its original temporary id. The entry
    /// flips back to `Sending` and goes through the same attempt policy.
    pub async fn retry_send(&self, chat_id: &str, temp_id: &str) -> Result<SendHandle, SendError> {
        let pending = self
            .failed_sends
            .lock()
            .await
            .remove(temp_id)
            .ok_or_else(|| SendError::UnknownPending(temp_id.to_string()))?;

        let cmd_tx = match self.conversation_tx(chat_id).await {
            Some(cmd_tx) => cmd_tx,
            None => {
                // Put it back; the caller can retry once the view reopens.
                self.failed_sends
                    .lock()
                    .await
                    .insert(temp_id.to_string(), pending);
                return Err(SendError::NotOpen(chat_id.to_string()));
            }
        };
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(chat_id) {
                self.failed_sends
                    .lock()
                    .await
                    .insert(temp_id.to_string(), pending);
                return Err(SendError::InFlight(chat_id.to_string()));
            }
            in_flight.insert(chat_id.to_string(), temp_id.to_string());
        }

        let message = Message {
            id: pending.temp_id.clone(),
            chat_id: pending.chat_id.clone(),
            sender_id: self.viewer_id.clone(),
            content: pending.content.clone(),
            kind: pending.kind,
            timestamp: pending.submitted_at,
            status: DeliveryStatus::Sending,
            reply_to: pending.reply_to.clone(),
            metadata: None,
        };
        self.pending_sends
            .lock()
            .await
            .insert(temp_id.to_string(), pending);

        info!("retrying failed send {} in {}", temp_id, chat_id);
        // A replace, not an update: the failed marker is terminal under the
        // merge rules, so the entry is swapped back to a pending one.
        let _ = cmd_tx
            .send(ConversationCommand::Replace {
                temp_id: temp_id.to_string(),
                confirmed: message.clone(),
            })
            .await;
        let _ = self
            .list_tx
            .send(ChatListCommand::Replace {
                chat_id: chat_id.to_string(),
                temp_id: temp_id.to_string(),
                confirmed: message.clone(),
            })
            .await;

        Ok(self.launch(cmd_tx, message))
    }

    /// Drop a failed send: the pending record dies and the local entry is
    /// deleted from the timeline and chat list.
    pub async fn discard_failed(&self, chat_id: &str, temp_id: &str) -> Result<(), SendError> {
        self.failed_sends
            .lock()
            .await
            .remove(temp_id)
            .ok_or_else(|| SendError::UnknownPending(temp_id.to_string()))?;

        info!("discarding failed send {} in {}", temp_id, chat_id);
        let cmd_tx = self.conversation_tx(chat_id).await;
        self.dispatch_local(
            RawMessageEvent {
                kind: RawEventKind::Delete,
                source: EventSource::LocalAction,
                message: None,
                message_id: Some(temp_id.to_string()),
                chat_id: Some(chat_id.to_string()),
            },
            cmd_tx.as_ref(),
        )
        .await;
        Ok(())
    }

    /// Normalize a local action and fan it out like any other event: to the
    /// conversation actor (when open) and to the chat-list aggregator.
    pub(crate) async fn dispatch_local(
        &self,
        raw: RawMessageEvent,
        cmd_tx: Option<&mpsc::Sender<ConversationCommand>>,
    ) {
        match self.normalizer.normalize(RawEvent::Message(raw)) {
            Ok(event) => {
                if let Some(cmd_tx) = cmd_tx {
                    let _ = cmd_tx.send(ConversationCommand::Apply(event.clone())).await;
                }
                let _ = self.list_tx.send(ChatListCommand::Apply(event)).await;
            }
            Err(e) => error!("local event failed to normalize: {}", e),
        }
    }

    fn launch(&self, cmd_tx: mpsc::Sender<ConversationCommand>, message: Message) -> SendHandle {
        let (status_tx, status_rx) = mpsc::channel(8);
        let context = SendContext {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            normalizer: self.normalizer.clone(),
            cmd_tx,
            list_tx: self.list_tx.clone(),
            pending_sends: self.pending_sends.clone(),
            failed_sends: self.failed_sends.clone(),
            in_flight: self.in_flight.clone(),
            chat_list: self.chat_list_view.clone(),
            viewer_id: self.viewer_id.clone(),
        };
        let handle = SendHandle {
            temp_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            status: status_rx,
        };
        tokio::spawn(drive_send(context, message, status_tx));
        handle
    }
}

/// The background half of a submission: attempt, maybe retry once, then
/// confirm or mark failed. Runs detached from the conversation view.
async fn drive_send(ctx: SendContext, message: Message, status_tx: mpsc::Sender<SendStatus>) {
    let temp_id = message.id.clone();
    let chat_id = message.chat_id.clone();
    let mut reason = String::from("send failed");

    for attempt in 1..=MAX_SEND_ATTEMPTS {
        if let Some(pending) = ctx.pending_sends.lock().await.get_mut(&temp_id) {
            pending.attempts += 1;
        }

        match timeout(
            Duration::from_secs(ATTEMPT_TIMEOUT_SECS),
            ctx.store.append_message(&message),
        )
        .await
        {
            Ok(Ok(confirmed)) => {
                info!(
                    "send {} confirmed as {} on attempt {}",
                    temp_id, confirmed.id, attempt
                );
                let _ = ctx
                    .cmd_tx
                    .send(ConversationCommand::Replace {
                        temp_id: temp_id.clone(),
                        confirmed: confirmed.clone(),
                    })
                    .await;
                let _ = ctx
                    .list_tx
                    .send(ChatListCommand::Replace {
                        chat_id: chat_id.clone(),
                        temp_id: temp_id.clone(),
                        confirmed: confirmed.clone(),
                    })
                    .await;
                ctx.pending_sends.lock().await.remove(&temp_id);
                clear_in_flight(&ctx.in_flight, &chat_id, &temp_id).await;
                let _ = status_tx
                    .send(SendStatus::Confirmed {
                        message_id: confirmed.id.clone(),
                        timestamp: confirmed.timestamp,
                    })
                    .await;
                notify_recipients(&ctx, &confirmed).await;
                return;
            }
            Ok(Err(e @ StoreError::Transient(_))) => {
                warn!("send attempt {} for {} failed: {}", attempt, temp_id, e);
                reason = e.to_string();
            }
            Ok(Err(e)) => {
                // Rejections and missing chats will not improve with retry.
                error!("send {} rejected: {}", temp_id, e);
                reason = e.to_string();
                break;
            }
            Err(_) => {
                warn!("send attempt {} for {} timed out", attempt, temp_id);
                reason = "timed out waiting for the store".to_string();
            }
        }

        if attempt < MAX_SEND_ATTEMPTS {
            let _ = status_tx.send(SendStatus::Retrying { attempt }).await;
            let backoff = RETRY_DELAY_MS + rand::random::<u64>() % RETRY_JITTER_MS;
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    error!(
        "giving up on send {} after {} attempts: {}",
        temp_id, MAX_SEND_ATTEMPTS, reason
    );
    if let Some(pending) = ctx.pending_sends.lock().await.remove(&temp_id) {
        ctx.failed_sends.lock().await.insert(temp_id.clone(), pending);
    }
    clear_in_flight(&ctx.in_flight, &chat_id, &temp_id).await;

    // The entry flips to a distinguishable failed marker instead of
    // vanishing, so the caller can offer retry.
    let mut failed = message;
    failed.status = DeliveryStatus::Failed;
    match ctx.normalizer.normalize(RawEvent::Message(RawMessageEvent {
        kind: RawEventKind::Update,
        source: EventSource::LocalAction,
        message: Some(failed),
        message_id: None,
        chat_id: None,
    })) {
        Ok(event) => {
            let _ = ctx.cmd_tx.send(ConversationCommand::Apply(event.clone())).await;
            let _ = ctx.list_tx.send(ChatListCommand::Apply(event)).await;
        }
        Err(e) => error!("failed-send marker did not normalize: {}", e),
    }
    let _ = status_tx.send(SendStatus::Failed { temp_id, reason }).await;
}

/// Only the submission that registered the in-flight slot may clear it.
async fn clear_in_flight(
    in_flight: &TokioMutex<HashMap<String, String>>,
    chat_id: &str,
    temp_id: &str,
) {
    let mut map = in_flight.lock().await;
    if map.get(chat_id).map(|t| t == temp_id).unwrap_or(false) {
        map.remove(chat_id);
    }
}

/// Tell the other participants. Fire-and-forget: failures are logged and
/// never affect the already-confirmed send.
async fn notify_recipients(ctx: &SendContext, confirmed: &Message) {
    let summary = ctx
        .chat_list
        .borrow()
        .iter()
        .find(|s| s.chat_id == confirmed.chat_id)
        .cloned();
    let summary = match summary {
        Some(summary) => summary,
        None => {
            debug!("no chat summary for {}; skipping notifications", confirmed.chat_id);
            return;
        }
    };

    let title = summary
        .participants
        .iter()
        .find(|p| p.user.id == ctx.viewer_id)
        .map(|p| p.user.name.clone())
        .unwrap_or_else(|| ctx.viewer_id.clone());
    let body: String = confirmed.content.chars().take(NOTIFY_PREVIEW_CHARS).collect();
    let payload = NotificationPayload {
        chat_id: confirmed.chat_id.clone(),
        message_id: confirmed.id.clone(),
        kind: "message".to_string(),
    };

    let recipients: Vec<String> = summary
        .participants
        .iter()
        .map(|p| p.user.id.clone())
        .filter(|id| *id != ctx.viewer_id)
        .collect();
    let sends = recipients
        .iter()
        .map(|recipient| ctx.notifier.notify(recipient, &title, &body, &payload));
    for (recipient, result) in recipients.iter().zip(join_all(sends).await) {
        if let Err(e) = result {
            warn!("push notification to {} failed: {}", recipient, e);
        }
    }
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text message",
        MessageKind::Image => "image",
        MessageKind::Video => "video",
        MessageKind::Audio => "audio clip",
        MessageKind::Document => "document",
    }
}
