// Headless demo of the sync engine: drives a scripted conversation against
// the in-memory store and prints the chat list and timeline as they evolve.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use clap::Parser;
use log::LevelFilter;

use parley::models::{now_millis, ChatKind, DeliveryStatus, Message, MessageKind, User};
use parley::store::{ChatStore, LogNotifier, MemoryStore};
use parley::sync::{ChatSummary, SendStatus, SyncEngine};
use parley::utils;

/// Command line arguments for the demo binary
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Parley: message synchronization core, demoed against the in-memory store."
)]
struct Args {
    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn demo_user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        name: name.to_string(),
        avatar_url: None,
        is_online: true,
        last_seen: Some(now_millis()),
    }
}

fn inbound(chat_id: &str, sender_id: &str, content: &str) -> Message {
    Message {
        id: String::new(), // the store assigns one
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

fn clock(timestamp: i64) -> String {
    NaiveDateTime::from_timestamp_millis(timestamp)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

fn print_chat_list(summaries: &[ChatSummary]) {
    println!("chat list:");
    for summary in summaries {
        let preview = summary
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("(no messages)");
        println!(
            "  {:<10} {:>2} unread | {}",
            summary.display_name, summary.unread_count, preview
        );
    }
}

fn print_timeline(messages: &[Message]) {
    for message in messages {
        println!(
            "  [{}] {:<6} {:?}: {}",
            clock(message.timestamp),
            message.sender_id,
            message.status,
            message.content
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.as_ref().and_then(|p| p.to_str()), level)?;

    // A tiny backend: two users, one conversation, some history.
    let store = MemoryStore::new();
    store.add_user(demo_user("alice", "Alice"));
    store.add_user(demo_user("bob", "Bob"));
    let chat = store
        .create_chat(
            ChatKind::Individual,
            None,
            None,
            &["alice".to_string(), "bob".to_string()],
        )
        .await?;
    store.inject_message(inbound(&chat.id, "bob", "Hey Alice, got a minute?"))?;
    store.inject_message(inbound(&chat.id, "bob", "I found the tickets."))?;

    // Alice's client comes up.
    let engine = SyncEngine::start(store.clone(), Arc::new(LogNotifier), "alice").await?;
    print_chat_list(&engine.chat_list().borrow());

    // She opens the conversation; history loads and the two inbound
    // messages get flushed as read.
    let view = engine.open_conversation(&chat.id).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("\nconversation after opening:");
    print_timeline(&view.messages.borrow());

    // An optimistic send: visible immediately, confirmed in the background.
    let mut handle = engine
        .submit(&chat.id, "Great - see you at eight?", MessageKind::Text)
        .await?;
    println!("\nright after submit:");
    print_timeline(&view.messages.borrow());

    while let Some(status) = handle.status.recv().await {
        match status {
            SendStatus::Retrying { attempt } => println!("(attempt {} failed, retrying)", attempt),
            SendStatus::Confirmed { message_id, .. } => {
                println!("\nsend confirmed as {}", message_id);
                break;
            }
            SendStatus::Failed { reason, .. } => {
                println!("\nsend failed: {}", reason);
                break;
            }
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Bob replies while the view is open; the read tracker flushes it.
    store.inject_message(inbound(&chat.id, "bob", "Eight works. See you!"))?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("\nconversation after the reply:");
    print_timeline(&view.messages.borrow());
    print_chat_list(&engine.chat_list().borrow());

    engine.close_conversation(&chat.id).await;
    engine.shutdown().await;
    Ok(())
}
