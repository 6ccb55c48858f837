//! Transactional outbox/inbox delivery engine backed by SQLite.
//!
//! A service using this crate commits its business writes and the messages
//! those writes imply in one transaction, then lets the background
//! [`Dispatcher`](dispatcher::Dispatcher) deliver the messages to a transport
//! later: at-least-once on the wire, deduplicated on receipt through the
//! inbox. Multiple service instances can run the same dispatcher against one
//! store; lease-based claiming keeps them from double-delivering.
//!
//! # Producing
//!
//! ```ignore
//! let mut buffer = OutboxBuffer::new();
//! buffer.add_command(&ShipOrder { order_id }, None)?;
//!
//! let mut tx = service.db().begin().await?;
//! // ... business writes on `tx` ...
//! OutboxMessage::insert_batch(&mut tx, tenant_id, buffer.flush("acme")).await?;
//! tx.commit().await?;
//! ```
//!
//! # Consuming
//!
//! ```ignore
//! let disposition = service
//!     .process_inbound(message_id, "order.shipped.v1", body, |conn| {
//!         Box::pin(async move {
//!             // side effects, same transaction as the dedup marker
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod service;
pub mod telemetry;
pub mod tenant;
pub mod trace;
pub mod transport;

pub use error::Error;
