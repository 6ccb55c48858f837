//! Inbox persistence operations.
//!
//! The inbox makes consumption idempotent under at-least-once delivery: the
//! primary key on the sender-assigned message id is the sole dedup check. A
//! consumer inserts the row, applies its side effects and marks the row
//! processed inside one transaction; a duplicate delivery trips the unique
//! constraint and is treated as already processed.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::Error;
use crate::message::{bounded_error, InboxMessage, InboxStatus};

impl InboxMessage {
    /// Pure existence check for an inbound message id.
    pub async fn exists_by_message_id(db: &mut SqliteConnection, id: Uuid) -> Result<bool, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inbox_messages WHERE id = $1")
            .bind(id)
            .fetch_one(db)
            .await?;

        Ok(count > 0)
    }

    /// Buffers the dedup marker into the caller's transaction.
    ///
    /// A duplicate id fails with a unique-constraint violation
    /// (see [`Error::is_unique_violation`]).
    pub async fn insert(
        db: &mut SqliteConnection,
        id: Uuid,
        message_type: &str,
        content: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO inbox_messages (id, message_type, content, created_at, status)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(message_type)
        .bind(content)
        .bind(Utc::now())
        .bind(InboxStatus::Received)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn mark_processed(db: &mut SqliteConnection, id: Uuid) -> Result<(), Error> {
        sqlx::query("UPDATE inbox_messages SET status = $2, processed_at = $3 WHERE id = $1")
            .bind(id)
            .bind(InboxStatus::Processed)
            .bind(Utc::now())
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn record_failure(
        db: &mut SqliteConnection,
        id: Uuid,
        error: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE inbox_messages
             SET status = $2, retry_count = retry_count + 1, error_message = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(InboxStatus::Failed)
        .bind(bounded_error(error))
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, id: Uuid) -> Result<Option<InboxMessage>, Error> {
        Ok(sqlx::query_as("SELECT * FROM inbox_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }
}
