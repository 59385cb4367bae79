//! SQLite conversation store.
//!
//! Implements `ConversationStore` from `chatrelay-core`. Messages are kept in
//! insertion order per `(user_id, conversation_id)`.

use chatrelay_core::pipeline::collaborators::ConversationStore;
use chatrelay_types::error::RepositoryError;
use chatrelay_types::llm::{ChatMessage, MessageRole};
use chrono::Utc;
use sqlx::Row;

use super::pool::DatabasePool;

pub struct SqliteConversationStore {
    pool: DatabasePool,
}

impl SqliteConversationStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Create the conversation if it does not exist yet.
    pub async fn ensure_conversation(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO conversations (user_id, id, title, created_at) VALUES (?, ?, '', ?)",
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn append_message(
        &self,
        user_id: i64,
        conversation_id: i64,
        message: &ChatMessage,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO conversation_messages (user_id, conversation_id, role, content, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(RepositoryError::NotFound)
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    /// Every message of the conversation, oldest first.
    pub async fn messages(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT role, content FROM conversation_messages WHERE user_id = ? AND conversation_id = ? ORDER BY id",
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn exists(&self, user_id: i64, conversation_id: i64) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(conversation_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(row.is_some())
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage, RepositoryError> {
    let role: String = row
        .try_get("role")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let content: String = row
        .try_get("content")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let role: MessageRole = role
        .parse()
        .map_err(|e: String| RepositoryError::Query(format!("invalid role: {e}")))?;
    Ok(ChatMessage::new(role, content))
}

impl ConversationStore for SqliteConversationStore {
    async fn latest_message(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<Option<ChatMessage>, RepositoryError> {
        if !self.exists(user_id, conversation_id).await? {
            return Err(RepositoryError::NotFound);
        }

        let row = sqlx::query(
            "SELECT role, content FROM conversation_messages WHERE user_id = ? AND conversation_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn record_prompt(
        &self,
        user_id: i64,
        conversation_id: i64,
        message: &ChatMessage,
    ) -> Result<(), RepositoryError> {
        self.ensure_conversation(user_id, conversation_id).await?;
        self.append_message(user_id, conversation_id, message).await
    }

    async fn append_assistant_message(
        &self,
        user_id: i64,
        conversation_id: i64,
        content: &str,
    ) -> Result<(), RepositoryError> {
        self.append_message(user_id, conversation_id, &ChatMessage::assistant(content))
            .await
    }
}
