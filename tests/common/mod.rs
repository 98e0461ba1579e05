// Common test utilities for the integration tests

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::LevelFilter;
use tokio::sync::watch;
use tokio::time::timeout;

use parley::models::{
    now_millis, Chat, ChatKind, DeliveryStatus, Message, MessageKind, User,
};
use parley::store::{ChatStore, MemoryStore, NotificationPayload, Notifier};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

pub fn test_user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        name: name.to_string(),
        avatar_url: None,
        is_online: true,
        last_seen: Some(now_millis()),
    }
}

/// An inbound message the store will assign an id to.
pub fn inbound_message(chat_id: &str, sender_id: &str, content: &str) -> Message {
    Message {
        id: String::new(),
        chat_id: chat_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        kind: MessageKind::Text,
        timestamp: now_millis(),
        status: DeliveryStatus::Sent,
        reply_to: None,
        metadata: None,
    }
}

/// Register two users and create an individual chat between them.
pub async fn individual_chat(store: &Arc<MemoryStore>, a: &str, b: &str) -> Result<Chat> {
    store.add_user(test_user(a, &capitalize(a)));
    store.add_user(test_user(b, &capitalize(b)));
    let chat = store
        .create_chat(ChatKind::Individual, None, None, &[a.to_string(), b.to_string()])
        .await?;
    Ok(chat)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Wait until a watch view satisfies the predicate, or time out.
pub async fn wait_for_view<T, F>(
    view: &mut watch::Receiver<T>,
    predicate: F,
    timeout_secs: u64,
) -> Result<T>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        {
            let current = view.borrow_and_update();
            if predicate(&current) {
                return Ok(current.clone());
            }
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("timed out waiting for view condition"));
        }
        match timeout(remaining, view.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(anyhow!("view channel closed")),
            Err(_) => return Err(anyhow!("timed out waiting for view condition")),
        }
    }
}

/// Notifier that records every delivery for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub delivered: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        recipient_id: &str,
        title: &str,
        body: &str,
        _payload: &NotificationPayload,
    ) -> Result<()> {
        self.delivered.lock().unwrap().push((
            recipient_id.to_string(),
            title.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}
