//! Distributed-tracing context carried across the outbox gap.
//!
//! A message is produced inside one traced operation and delivered later by
//! the dispatcher, inside another. Capturing the trace/span ids on the row and
//! rebuilding them at dispatch time lets the delivery span parent onto the
//! producing operation instead of showing up as an orphan.
//!
//! The context is an explicit value object passed through the call chain, not
//! ambient "current activity" state.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Header key under which the trace id travels on the wire.
pub const TRACE_ID_HEADER: &str = "trace-id";
/// Header key under which the parent span id travels on the wire.
pub const SPAN_ID_HEADER: &str = "parent-span-id";

/// Parent trace context reconstructed from stored trace/span ids.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    /// Generates a fresh root context, W3C-sized (16-byte trace id, 8-byte
    /// span id, lowercase hex).
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();

        let trace: [u8; 16] = rng.gen();
        let span: [u8; 8] = rng.gen();

        Self {
            trace_id: hex_encode(&trace),
            span_id: hex_encode(&span),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Writes the context into an outbound header map.
    pub fn apply(&self, headers: &mut std::collections::HashMap<String, String>) {
        headers.insert(TRACE_ID_HEADER.to_owned(), self.trace_id.clone());
        headers.insert(SPAN_ID_HEADER.to_owned(), self.span_id.clone());
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
