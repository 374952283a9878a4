#![forbid(unsafe_code)]

// Chat storage capability and its two backends: PostgreSQL (flat messages
// table, equality filter + timestamp order + limit) and a local JSON file
// snapshot for development.

use super::{ChatMessage, Reaction};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage collaborator the chat coordinator talks to. The reaction toggle
/// lives here: the store is the source of truth for reaction state.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save_message(&self, message: &ChatMessage) -> StoreResult<()>;

    /// Messages for a room in ascending timestamp order, at most `limit`.
    async fn get_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    /// Batch-deletes a room's history.
    async fn delete_room_messages(&self, room_id: &str) -> StoreResult<()>;

    /// Toggles a user's emoji reaction on a message and returns the updated
    /// reaction set.
    async fn add_reaction(
        &self,
        room_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<Vec<Reaction>>;
}

/// Shared toggle semantics: reacting twice with the same emoji removes the
/// user; a reaction with no users left disappears entirely.
pub(crate) fn toggle_reaction(reactions: &mut Vec<Reaction>, user_id: &str, emoji: &str) {
    match reactions.iter_mut().find(|r| r.emoji == emoji) {
        Some(reaction) => {
            if let Some(pos) = reaction.user_ids.iter().position(|u| u == user_id) {
                reaction.user_ids.remove(pos);
            } else {
                reaction.user_ids.push(user_id.to_string());
            }
        }
        None => reactions.push(Reaction {
            emoji: emoji.to_string(),
            user_ids: vec![user_id.to_string()],
        }),
    }
    reactions.retain(|r| !r.user_ids.is_empty());
}

// ---------------------------------------------------------------------------
// JSON file snapshot backend
// ---------------------------------------------------------------------------

/// Local JSON snapshot: the whole history lives in memory and is rewritten
/// to disk after each mutation.
pub struct JsonStore {
    path: PathBuf,
    rooms: TokioMutex<HashMap<String, Vec<ChatMessage>>>,
}

impl JsonStore {
    pub async fn open(path: PathBuf) -> StoreResult<Self> {
        let rooms = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Chat history snapshot at {}", path.display());
        Ok(Self {
            path,
            rooms: TokioMutex::new(rooms),
        })
    }

    async fn flush(&self, rooms: &HashMap<String, Vec<ChatMessage>>) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(rooms)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for JsonStore {
    async fn save_message(&self, message: &ChatMessage) -> StoreResult<()> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        self.flush(&rooms).await
    }

    async fn get_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let rooms = self.rooms.lock().await;
        let mut messages = rooms.get(room_id).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        messages.truncate(limit);
        Ok(messages)
    }

    async fn delete_room_messages(&self, room_id: &str) -> StoreResult<()> {
        let mut rooms = self.rooms.lock().await;
        if rooms.remove(room_id).is_some() {
            debug!("Deleted chat history for room {}", room_id);
            self.flush(&rooms).await?;
        }
        Ok(())
    }

    async fn add_reaction(
        &self,
        room_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<Vec<Reaction>> {
        let mut rooms = self.rooms.lock().await;
        let messages = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        toggle_reaction(&mut message.reactions, user_id, emoji);
        let reactions = message.reactions.clone();
        self.flush(&rooms).await?;
        Ok(reactions)
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL backend
// ---------------------------------------------------------------------------

/// Flat `messages` table; reactions live in a JSONB column and the toggle
/// runs read-modify-write inside a transaction.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Connected to PostgreSQL chat store");
        Ok(Self { pool })
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> StoreResult<ChatMessage> {
    let reactions: serde_json::Value = row.try_get("reactions")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        message: row.try_get("message")?,
        timestamp: row.try_get("timestamp")?,
        room_id: row.try_get("room_id")?,
        reactions: serde_json::from_value(reactions)?,
    })
}

#[async_trait]
impl ChatStore for PgStore {
    async fn save_message(&self, message: &ChatMessage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, room_id, user_id, user_name, message, timestamp, reactions) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&message.id)
        .bind(&message.room_id)
        .bind(&message.user_id)
        .bind(&message.user_name)
        .bind(&message.message)
        .bind(message.timestamp)
        .bind(serde_json::to_value(&message.reactions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, room_id, user_id, user_name, message, timestamp, reactions \
             FROM messages WHERE room_id = $1 ORDER BY timestamp ASC LIMIT $2",
        )
        .bind(room_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn delete_room_messages(&self, room_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM messages WHERE room_id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        room_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<Vec<Reaction>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT reactions FROM messages WHERE room_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(room_id)
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        let mut reactions: Vec<Reaction> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("reactions")?)?;
        toggle_reaction(&mut reactions, user_id, emoji);

        sqlx::query("UPDATE messages SET reactions = $1 WHERE room_id = $2 AND id = $3")
            .bind(serde_json::to_value(&reactions)?)
            .bind(room_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(reactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, room: &str, ts: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            user_id: "u1".to_string(),
            user_name: "Alice".to_string(),
            message: "hi".to_string(),
            timestamp: ts,
            room_id: room.to_string(),
            reactions: Vec::new(),
        }
    }

    #[test]
    fn reaction_toggle_adds_then_removes() {
        let mut reactions = Vec::new();
        toggle_reaction(&mut reactions, "v1", "👍");
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].user_ids, vec!["v1"]);

        toggle_reaction(&mut reactions, "v2", "👍");
        assert_eq!(reactions[0].user_ids, vec!["v1", "v2"]);

        toggle_reaction(&mut reactions, "v1", "👍");
        assert_eq!(reactions[0].user_ids, vec!["v2"]);

        toggle_reaction(&mut reactions, "v2", "👍");
        assert!(reactions.is_empty());
    }

    #[tokio::test]
    async fn json_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("castroom-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("chat.json");

        let store = JsonStore::open(path.clone()).await.unwrap();
        store.save_message(&message("m2", "room-a", 20)).await.unwrap();
        store.save_message(&message("m1", "room-a", 10)).await.unwrap();
        store.save_message(&message("m3", "room-b", 30)).await.unwrap();

        let history = store.get_messages("room-a", 50).await.unwrap();
        assert_eq!(
            history.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );

        // Reload from disk
        let reopened = JsonStore::open(path).await.unwrap();
        let history = reopened.get_messages("room-a", 50).await.unwrap();
        assert_eq!(history.len(), 2);

        reopened.delete_room_messages("room-a").await.unwrap();
        assert!(reopened.get_messages("room-a", 50).await.unwrap().is_empty());
        assert_eq!(reopened.get_messages("room-b", 50).await.unwrap().len(), 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn json_store_reaction_toggle_is_authoritative() {
        let dir = std::env::temp_dir().join(format!("castroom-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = JsonStore::open(dir.join("chat.json")).await.unwrap();
        store.save_message(&message("m1", "room-a", 10)).await.unwrap();

        let first = store.add_reaction("room-a", "m1", "viewer", "👍").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].emoji, "👍");
        assert_eq!(first[0].user_ids, vec!["viewer"]);

        let second = store.add_reaction("room-a", "m1", "viewer", "👍").await.unwrap();
        assert!(second.is_empty());

        let missing = store.add_reaction("room-a", "nope", "viewer", "👍").await;
        assert!(matches!(missing, Err(StoreError::MessageNotFound(_))));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
