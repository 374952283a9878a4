#![forbid(unsafe_code)]

// Chat & Reaction Coordinator - validates, persists, and fans out chat
// messages and emoji reactions.

pub mod profanity;
pub mod store;

pub use profanity::{ProfanityFilter, ProfanityVerdict, WordListFilter};
pub use store::{ChatStore, JsonStore, PgStore, StoreError, StoreResult};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};
use uuid::Uuid;

/// How many messages a joiner receives as history.
pub const HISTORY_LIMIT: usize = 50;

/// Emoji reaction on a message: which users picked this emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_ids: Vec<String>,
}

/// A persisted chat message. `id` and `timestamp` are minted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    /// Server wall-clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub room_id: String,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

pub struct ChatCoordinator {
    store: Arc<dyn ChatStore>,
    filter: Arc<dyn ProfanityFilter>,
}

impl ChatCoordinator {
    pub fn new(store: Arc<dyn ChatStore>, filter: Arc<dyn ProfanityFilter>) -> Self {
        Self { store, filter }
    }

    /// Builds the canonical message: censors the text if needed and mints a
    /// fresh id and timestamp.
    pub fn compose(
        &self,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        raw_message: &str,
    ) -> ChatMessage {
        let verdict = self.filter.validate(raw_message);
        let message = if verdict.contains_profanity {
            verdict.cleaned_text
        } else {
            raw_message.to_string()
        };
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            message,
            timestamp: now_millis(),
            room_id: room_id.to_string(),
            reactions: Vec::new(),
        }
    }

    /// Persists a message. Best-effort: delivery beats durability, so a
    /// storage failure is logged and the broadcast proceeds.
    pub async fn save(&self, message: &ChatMessage) {
        if let Err(e) = self.store.save_message(message).await {
            error!("Failed to persist chat message {}: {}", message.id, e);
        }
    }

    /// History for a joiner, ascending by timestamp. Best-effort: a storage
    /// failure yields an empty history.
    pub async fn history(&self, room_id: &str) -> Vec<ChatMessage> {
        match self.store.get_messages(room_id, HISTORY_LIMIT).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to load chat history for room {}: {}", room_id, e);
                Vec::new()
            }
        }
    }

    /// Reaction toggle. Authoritative: errors surface to the caller.
    pub async fn toggle_reaction(
        &self,
        room_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<Vec<Reaction>> {
        self.store
            .add_reaction(room_id, message_id, user_id, emoji)
            .await
    }

    /// Drops a room's history when the room is destroyed. Best-effort.
    pub async fn purge_room(&self, room_id: &str) {
        if let Err(e) = self.store.delete_room_messages(room_id).await {
            warn!("Failed to delete chat history for room {}: {}", room_id, e);
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn coordinator() -> (ChatCoordinator, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("castroom-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = JsonStore::open(dir.join("chat.json")).await.unwrap();
        (
            ChatCoordinator::new(Arc::new(store), Arc::new(WordListFilter::default())),
            dir,
        )
    }

    #[tokio::test]
    async fn compose_mints_id_and_censors() {
        let (chat, dir) = coordinator().await;
        let msg = chat.compose("room-a", "u1", "Alice", "what the hell");
        assert_eq!(msg.message, "what the ****");
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp > 0);

        let clean = chat.compose("room-a", "u1", "Alice", "hi there");
        assert_eq!(clean.message, "hi there");
        assert_ne!(clean.id, msg.id);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn history_is_best_effort_and_ordered() {
        let (chat, dir) = coordinator().await;
        assert!(chat.history("room-a").await.is_empty());

        let mut first = chat.compose("room-a", "u1", "Alice", "first");
        first.timestamp = 1;
        let mut second = chat.compose("room-a", "u1", "Alice", "second");
        second.timestamp = 2;
        chat.save(&second).await;
        chat.save(&first).await;

        let history = chat.history("room-a").await;
        assert_eq!(
            history.iter().map(|m| m.message.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
