//! Deferred message buffer.
//!
//! Handlers express "send this command" / "publish this notification" without
//! doing I/O. The buffer is an explicit per-unit-of-work value carried through
//! the handler call chain; it is never shared between concurrent logical
//! invocations and there is no task-local or process-global instance.
//!
//! Flushing converts the buffered items into outbox rows which the caller
//! inserts in the *same* transaction as its business writes. Anything else
//! breaks the outbox guarantee.

use std::collections::HashMap;

use crate::codec::OutboundPayload;
use crate::error::Error;
use crate::message::{MessageKind, NewOutboxMessage};
use crate::trace::TraceContext;

/// Header key carrying the owning tenant's name.
pub const TENANT_HEADER: &str = "tenant-id";

/// Execution-scoped collector for outbound messages.
#[derive(Default)]
pub struct OutboxBuffer {
    trace: Option<TraceContext>,
    headers: HashMap<String, String>,
    buffered: Vec<Buffered>,
}

struct Buffered {
    kind: MessageKind,
    payload_type: &'static str,
    payload: String,
    destination: Option<String>,
}

impl OutboxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer that will stamp rows with the caller's trace context
    /// instead of generating a fresh one at flush time.
    pub fn with_trace(trace: TraceContext) -> Self {
        Self {
            trace: Some(trace),
            ..Self::default()
        }
    }

    /// Adds a header propagated onto every row flushed from this buffer,
    /// e.g. a correlation id.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Buffers a command bound for `destination`, or for the endpoint derived
    /// from the payload type when `None`.
    pub fn add_command<T: OutboundPayload>(
        &mut self,
        command: &T,
        destination: Option<&str>,
    ) -> Result<(), Error> {
        self.buffered.push(Buffered {
            kind: MessageKind::Command,
            payload_type: T::payload_type(),
            payload: serde_json::to_string(command)?,
            destination: destination.map(ToOwned::to_owned),
        });
        Ok(())
    }

    /// Buffers a notification.
    pub fn add_notification<T: OutboundPayload>(&mut self, notification: &T) -> Result<(), Error> {
        self.buffered.push(Buffered {
            kind: MessageKind::Notification,
            payload_type: T::payload_type(),
            payload: serde_json::to_string(notification)?,
            destination: None,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    /// Converts the buffered items into insertable outbox rows and clears the
    /// buffer.
    ///
    /// Stamps the tenant header and the trace context (the one provided at
    /// construction, or a freshly generated root). The returned rows must be
    /// written in the same transaction as the unit of work's business
    /// changes.
    pub fn flush(&mut self, tenant: &str) -> Vec<NewOutboxMessage> {
        let trace = self
            .trace
            .clone()
            .unwrap_or_else(TraceContext::generate);

        let mut headers = self.headers.clone();
        headers.insert(TENANT_HEADER.to_owned(), tenant.to_owned());

        self.buffered
            .drain(..)
            .map(|item| NewOutboxMessage {
                kind: item.kind,
                payload_type: item.payload_type.to_owned(),
                payload: item.payload,
                destination: item.destination,
                headers: headers.clone(),
                trace: Some(trace.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl OutboundPayload for Ping {
        fn payload_type() -> &'static str {
            "ping.v1"
        }
    }

    #[test]
    fn buffers_without_io_and_flushes_rows() {
        let mut buffer = OutboxBuffer::new();
        buffer.add_command(&Ping { seq: 1 }, Some("pinger")).unwrap();
        buffer.add_notification(&Ping { seq: 2 }).unwrap();
        assert_eq!(buffer.len(), 2);

        let rows = buffer.flush("acme");
        assert!(buffer.is_empty());
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].kind, MessageKind::Command);
        assert_eq!(rows[0].destination.as_deref(), Some("pinger"));
        assert_eq!(rows[1].kind, MessageKind::Notification);
        assert_eq!(rows[1].destination, None);

        for row in &rows {
            assert_eq!(row.payload_type, "ping.v1");
            assert_eq!(row.headers[TENANT_HEADER], "acme");
            assert!(row.trace.is_some());
        }
    }

    #[test]
    fn flush_reuses_provided_trace_context() {
        let trace = TraceContext::new("t", "s");
        let mut buffer = OutboxBuffer::with_trace(trace.clone());
        buffer.add_notification(&Ping { seq: 0 }).unwrap();

        let rows = buffer.flush("acme");
        assert_eq!(rows[0].trace.as_ref(), Some(&trace));
    }

    #[test]
    fn extra_headers_are_stamped_on_every_row() {
        let mut buffer = OutboxBuffer::new();
        buffer.set_header("correlation-id", "abc-123");
        buffer.add_notification(&Ping { seq: 0 }).unwrap();
        buffer.add_notification(&Ping { seq: 1 }).unwrap();

        for row in buffer.flush("acme") {
            assert_eq!(row.headers["correlation-id"], "abc-123");
        }
    }
}
