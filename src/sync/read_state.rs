// Read-state tracker: turns "the viewer is looking at this conversation"
// into batched, idempotent read-receipt commands against the store, and
// confirms each flush to the chat-list aggregator so unread counts drop.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::models::Message;
use crate::store::{ChatStore, StoreError};
use crate::sync::ChatListCommand;

/// Commands consumed by the tracker task.
#[derive(Debug)]
pub(crate) enum ReadCommand {
    /// Register a conversation's timeline view so flushes can check what is
    /// actually unread.
    Track { chat_id: String, view: watch::Receiver<Vec<Message>> },
    /// The viewer saw the conversation; flush read state if needed.
    Flush(String),
    /// The conversation view closed; stop tracking it.
    Forget(String),
}

struct TrackedChat {
    view: watch::Receiver<Vec<Message>>,
    /// A mark-read call is currently on the wire.
    in_flight: bool,
    /// A flush was requested while one was in flight; re-check afterwards.
    dirty: bool,
}

/// Tracker task. Flush requests for a conversation coalesce: no matter how
/// many inbound messages arrive while the view is open, at most one
/// `mark_read` is outstanding per conversation, and a flush with nothing
/// unread never leaves the process.
pub(crate) async fn run_tracker(
    store: Arc<dyn ChatStore>,
    viewer_id: String,
    mut rx: mpsc::Receiver<ReadCommand>,
    list_tx: mpsc::Sender<ChatListCommand>,
) {
    let mut chats: HashMap<String, TrackedChat> = HashMap::new();
    // Flush tasks report completion here so coalesced requests can re-run.
    let (done_tx, mut done_rx) = mpsc::channel::<String>(16);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let command = match command {
                    Some(command) => command,
                    None => break,
                };
                match command {
                    ReadCommand::Track { chat_id, view } => {
                        chats.insert(
                            chat_id,
                            TrackedChat { view, in_flight: false, dirty: false },
                        );
                    }
                    ReadCommand::Forget(chat_id) => {
                        chats.remove(&chat_id);
                    }
                    ReadCommand::Flush(chat_id) => {
                        flush(&store, &viewer_id, &list_tx, &done_tx, &mut chats, &chat_id);
                    }
                }
            }
            finished = done_rx.recv() => {
                let chat_id = match finished {
                    Some(chat_id) => chat_id,
                    None => break,
                };
                let rerun = match chats.get_mut(&chat_id) {
                    Some(tracked) => {
                        tracked.in_flight = false;
                        std::mem::take(&mut tracked.dirty)
                    }
                    None => false,
                };
                if rerun {
                    flush(&store, &viewer_id, &list_tx, &done_tx, &mut chats, &chat_id);
                }
            }
        }
    }
    debug!("read tracker finished");
}

fn flush(
    store: &Arc<dyn ChatStore>,
    viewer_id: &str,
    list_tx: &mpsc::Sender<ChatListCommand>,
    done_tx: &mpsc::Sender<String>,
    chats: &mut HashMap<String, TrackedChat>,
    chat_id: &str,
) {
    let tracked = match chats.get_mut(chat_id) {
        Some(tracked) => tracked,
        None => {
            debug!("flush for untracked conversation {} ignored", chat_id);
            return;
        }
    };
    if tracked.in_flight {
        tracked.dirty = true;
        return;
    }
    // Idempotence: nothing unread means nothing to do, never an error.
    let has_unread = tracked
        .view
        .borrow()
        .iter()
        .any(|m| m.is_unread_for(viewer_id));
    if !has_unread {
        return;
    }

    tracked.in_flight = true;
    let store = store.clone();
    let viewer_id = viewer_id.to_string();
    let list_tx = list_tx.clone();
    let done_tx = done_tx.clone();
    let chat_id = chat_id.to_string();
    tokio::spawn(async move {
        match store.mark_read(&chat_id, &viewer_id).await {
            Ok(()) => {
                debug!("read receipts flushed for {}", chat_id);
                let _ = list_tx
                    .send(ChatListCommand::ReadFlushed(chat_id.clone()))
                    .await;
            }
            // A vanished conversation is a no-op, not a failure.
            Err(StoreError::NotFound(what)) => debug!("read flush: {} is gone", what),
            Err(e) => warn!("read flush for {} failed: {}", chat_id, e),
        }
        let _ = done_tx.send(chat_id).await;
    });
}
