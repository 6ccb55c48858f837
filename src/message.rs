//! Message types and status management for the outbox/inbox engine.
//!
//! This module defines the rows persisted by the engine and their lifecycle
//! states. Outbox rows are written in the same transaction as the business
//! mutation that produced them, then delivered asynchronously by the
//! dispatcher. Inbox rows mark inbound message ids as seen so consumers stay
//! idempotent under at-least-once delivery.
//!
//! # Outbox Lifecycle
//!
//! 1. Rows are created in `Pending` status with `retry_count = 0`
//! 2. A dispatcher instance leases a batch (`claimed_by`/`claim_expires_at`)
//! 3. On successful delivery the row moves to `Sent` and becomes immutable
//!    except for retention cleanup
//! 4. On failed delivery the retry count is incremented and the lease is
//!    released; once the retry ceiling is reached the row moves to `Failed`
//!    permanently

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use crate::trace::TraceContext;

/// Discriminates how an outbox row is handed to the transport layer.
///
/// Commands are sent to a single destination endpoint; notifications are
/// published to whoever subscribed. Any other value found in storage is a
/// non-retryable delivery failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(type_name = "text")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    #[serde(rename = "command")]
    #[sqlx(rename = "command")]
    Command,
    #[serde(rename = "notification")]
    #[sqlx(rename = "notification")]
    Notification,
}

/// Current status of an outbox row.
///
/// Transitions:
/// `Pending` -> `Sent`   (delivery succeeded)
/// `Pending` -> `Failed` (retry ceiling reached, permanent)
///
/// A `Pending` row with a live lease is invisible to other claimants until
/// the lease expires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(type_name = "text")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for delivery, possibly leased by a dispatcher instance
    #[serde(rename = "pending")]
    #[sqlx(rename = "pending")]
    Pending,
    /// Delivered to the transport; retained until the cleanup sweep
    #[serde(rename = "sent")]
    #[sqlx(rename = "sent")]
    Sent,
    /// Delivery failed permanently after exhausting all retries
    #[serde(rename = "failed")]
    #[sqlx(rename = "failed")]
    Failed,
}

/// Current status of an inbox row.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(type_name = "text")]
#[strum(serialize_all = "snake_case")]
pub enum InboxStatus {
    /// Recorded but the consumer's side effects have not completed yet
    #[serde(rename = "received")]
    #[sqlx(rename = "received")]
    Received,
    /// Consumer side effects completed
    #[serde(rename = "processed")]
    #[sqlx(rename = "processed")]
    Processed,
    /// Consumer side effects failed; the row still blocks duplicates
    #[serde(rename = "failed")]
    #[sqlx(rename = "failed")]
    Failed,
}

/// A durable unit of outbound work.
///
/// The payload is opaque to the dispatcher: a stable string tag plus the
/// serialized body. Headers carry tenant, correlation and tracing ids across
/// the asynchronous gap between "intent recorded" and "message delivered".
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct OutboxMessage {
    /// Monotone identifier assigned by the store at insert time
    pub id: i64,
    /// Owning tenant
    pub tenant: i64,
    /// Command or notification
    pub kind: MessageKind,
    /// Stable tag resolved through the payload registry at dispatch time
    pub payload_type: String,
    /// Serialized body
    pub payload: String,
    /// Explicit destination endpoint; `None` means derived from the payload type
    pub destination: Option<String>,
    /// Key/value headers recorded when the message was buffered
    pub headers: Json<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Last delivery failure, truncated to [`ERROR_MESSAGE_MAX_LEN`]
    pub error_message: Option<String>,
    /// Number of failed delivery attempts so far; never decreases
    pub retry_count: i64,
    /// Instance currently holding the lease, if any
    pub claimed_by: Option<String>,
    /// Lease expiry; a past value makes the row claimable again
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    /// Trace id captured when the message was buffered
    pub trace_id: Option<String>,
    /// Span id captured when the message was buffered
    pub span_id: Option<String>,
}

impl OutboxMessage {
    /// Tracing context captured at creation time, if any was recorded.
    pub fn trace_context(&self) -> Option<TraceContext> {
        match (&self.trace_id, &self.span_id) {
            (Some(trace_id), Some(span_id)) => {
                Some(TraceContext::new(trace_id.clone(), span_id.clone()))
            }
            _ => None,
        }
    }
}

/// An outbox row before it has been assigned an id by the store.
///
/// Produced by flushing an [`OutboxBuffer`](crate::buffer::OutboxBuffer) and
/// inserted in the same transaction as the caller's business writes.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub kind: MessageKind,
    pub payload_type: String,
    pub payload: String,
    pub destination: Option<String>,
    pub headers: HashMap<String, String>,
    pub trace: Option<TraceContext>,
}

/// Dedup marker for a consumed inbound message.
///
/// The id is the sender-assigned message id, not a local sequence; its
/// uniqueness in storage is the sole idempotency check.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct InboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: InboxStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
}

/// Upper bound on stored delivery failure reasons.
pub const ERROR_MESSAGE_MAX_LEN: usize = 2048;

/// Truncates a failure reason to the storable bound, on a char boundary.
pub(crate) fn bounded_error(reason: &str) -> String {
    if reason.len() <= ERROR_MESSAGE_MAX_LEN {
        return reason.to_owned();
    }

    let mut cut = ERROR_MESSAGE_MAX_LEN;
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    reason[..cut].to_owned()
}
