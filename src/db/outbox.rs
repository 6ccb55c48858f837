//! Outbox persistence operations.
//!
//! Everything here is a single statement (or a single caller-owned
//! transaction), so multiple dispatcher instances can run the same operations
//! concurrently against one store without client-side read-modify-write
//! races. Claim exclusivity in particular relies on the claim being one
//! atomic `UPDATE ... RETURNING`.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use sqlx::types::Json;
use sqlx::SqliteConnection;

use crate::error::Error;
use crate::message::{bounded_error, NewOutboxMessage, OutboxMessage, OutboxStatus};

impl OutboxMessage {
    /// Inserts flushed buffer rows into the caller's transaction.
    ///
    /// No commit happens here; the rows become durable together with the
    /// caller's business writes, or not at all. Returns the assigned ids in
    /// input order.
    pub async fn insert_batch(
        db: &mut SqliteConnection,
        tenant_id: i64,
        rows: Vec<NewOutboxMessage>,
    ) -> Result<Vec<i64>, Error> {
        let now = Utc::now();
        let mut ids = Vec::with_capacity(rows.len());

        for row in rows {
            let (trace_id, span_id) = match &row.trace {
                Some(trace) => (
                    Some(trace.trace_id().to_owned()),
                    Some(trace.span_id().to_owned()),
                ),
                None => (None, None),
            };

            let id: i64 = sqlx::query_scalar(
                "INSERT INTO outbox_messages
                    (tenant, kind, payload_type, payload, destination, headers,
                     created_at, status, trace_id, span_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 RETURNING id",
            )
            .bind(tenant_id)
            .bind(row.kind)
            .bind(&row.payload_type)
            .bind(&row.payload)
            .bind(&row.destination)
            .bind(Json(&row.headers))
            .bind(now)
            .bind(OutboxStatus::Pending)
            .bind(trace_id)
            .bind(span_id)
            .fetch_one(&mut *db)
            .await?;

            ids.push(id);
        }

        Ok(ids)
    }

    /// Atomically leases up to `batch_size` eligible rows for `instance`.
    ///
    /// Eligible means pending, under the retry ceiling, and either unclaimed
    /// or holding an expired lease. Selection and lease assignment happen in
    /// one statement, so two concurrent claimants can never receive the same
    /// row. Rows come back oldest first.
    pub async fn claim_pending(
        db: &mut SqliteConnection,
        tenant_id: i64,
        instance: &str,
        batch_size: u32,
        claim_timeout: chrono::Duration,
        max_retry_count: u32,
    ) -> Result<Vec<OutboxMessage>, Error> {
        let now = Utc::now();
        let expires_at = now + claim_timeout;

        Ok(sqlx::query_as(
            "UPDATE outbox_messages
             SET claimed_by = $1, claim_expires_at = $2
             WHERE id IN (
                 SELECT id FROM outbox_messages
                 WHERE tenant = $3
                   AND status = $4
                   AND retry_count < $5
                   AND (claimed_by IS NULL OR claim_expires_at < $6)
                 ORDER BY created_at ASC, id ASC
                 LIMIT $7
             )
             RETURNING *",
        )
        .bind(instance)
        .bind(expires_at)
        .bind(tenant_id)
        .bind(OutboxStatus::Pending)
        .bind(max_retry_count as i64)
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(db)
        .await?)
    }

    /// Bulk transition to `Sent`. Idempotent: rows already sent are skipped.
    pub async fn mark_sent(db: &mut SqliteConnection, ids: &[i64]) -> Result<u64, Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = (0..ids.len()).map(|i| format!("${}", i + 3)).join(", ");
        let sql = format!(
            "UPDATE outbox_messages
             SET status = $1, sent_at = $2
             WHERE id IN ({placeholders}) AND status != $1"
        );

        let mut query = sqlx::query(&sql).bind(OutboxStatus::Sent).bind(Utc::now());
        for id in ids {
            query = query.bind(id);
        }

        Ok(query.execute(db).await?.rows_affected())
    }

    /// Records one failed delivery attempt.
    ///
    /// Increments the retry count and releases the lease. At the retry
    /// ceiling the row becomes permanently `Failed`; below it the row returns
    /// to `Pending` and is claimable again. Rows already sent or failed are
    /// left untouched.
    pub async fn record_delivery_failure(
        db: &mut SqliteConnection,
        id: i64,
        error: &str,
        max_retry_count: u32,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE outbox_messages
             SET retry_count = retry_count + 1,
                 error_message = $2,
                 claimed_by = NULL,
                 claim_expires_at = NULL,
                 status = CASE WHEN retry_count + 1 >= $3 THEN $4 ELSE $5 END,
                 failed_at = CASE WHEN retry_count + 1 >= $3 THEN $6 ELSE failed_at END
             WHERE id = $1 AND status = $5",
        )
        .bind(id)
        .bind(bounded_error(error))
        .bind(max_retry_count as i64)
        .bind(OutboxStatus::Failed)
        .bind(OutboxStatus::Pending)
        .bind(Utc::now())
        .execute(db)
        .await?;

        Ok(())
    }

    /// Records a non-retryable failure: unknown payload type, undecodable
    /// body. The row goes straight to `Failed`; the retry count is bumped to
    /// the ceiling so the row can never be claimed again.
    pub async fn record_permanent_failure(
        db: &mut SqliteConnection,
        id: i64,
        error: &str,
        max_retry_count: u32,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE outbox_messages
             SET retry_count = MAX(retry_count + 1, $3),
                 error_message = $2,
                 claimed_by = NULL,
                 claim_expires_at = NULL,
                 status = $4,
                 failed_at = $5
             WHERE id = $1 AND status = $6",
        )
        .bind(id)
        .bind(bounded_error(error))
        .bind(max_retry_count as i64)
        .bind(OutboxStatus::Failed)
        .bind(Utc::now())
        .bind(OutboxStatus::Pending)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Retention sweep: deletes `Sent` rows older than the cutoff.
    ///
    /// Pending and failed rows are never touched here.
    pub async fn cleanup_sent(
        db: &mut SqliteConnection,
        older_than: DateTime<Utc>,
    ) -> Result<u64, Error> {
        Ok(
            sqlx::query("DELETE FROM outbox_messages WHERE status = $1 AND sent_at < $2")
                .bind(OutboxStatus::Sent)
                .bind(older_than)
                .execute(db)
                .await?
                .rows_affected(),
        )
    }

    /// Deletes the pending backlog of deactivated tenants (purge policy).
    pub async fn purge_inactive_tenant_backlog(db: &mut SqliteConnection) -> Result<u64, Error> {
        Ok(sqlx::query(
            "DELETE FROM outbox_messages
             WHERE status = $1
               AND tenant IN (SELECT id FROM tenants WHERE active = FALSE)",
        )
        .bind(OutboxStatus::Pending)
        .execute(db)
        .await?
        .rows_affected())
    }

    /// Pending backlog sizes per deactivated tenant (flag policy, operators).
    pub async fn inactive_tenant_backlog(
        db: &mut SqliteConnection,
    ) -> Result<Vec<(String, i64)>, Error> {
        Ok(sqlx::query_as(
            "SELECT t.name, COUNT(*) FROM outbox_messages m
             JOIN tenants t ON m.tenant = t.id
             WHERE m.status = $1 AND t.active = FALSE
             GROUP BY t.name
             ORDER BY t.name",
        )
        .bind(OutboxStatus::Pending)
        .fetch_all(db)
        .await?)
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<OutboxMessage>, Error> {
        Ok(sqlx::query_as("SELECT * FROM outbox_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }

    pub async fn count_by_status(
        db: &mut SqliteConnection,
        tenant_id: i64,
        status: OutboxStatus,
    ) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_messages WHERE tenant = $1 AND status = $2",
        )
        .bind(tenant_id)
        .bind(status)
        .fetch_one(db)
        .await?)
    }
}
