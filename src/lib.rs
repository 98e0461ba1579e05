// Message synchronization core for a chat client: ordered per-conversation
// timelines, a live chat-list summary, optimistic sends and read-state
// tracking, fed by a store change feed.

pub mod models;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export the main types for convenience
pub use models::*;
pub use sync::SyncEngine;
