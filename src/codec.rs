//! Payload tagging and decoding.
//!
//! Outbox rows store a stable string tag next to the serialized body. The
//! dispatcher resolves the tag through a [`PayloadRegistry`] built at startup,
//! so a payload whose type is unknown (or was removed from the codebase) fails
//! predictably instead of being retried forever against an un-fixable row.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// A value that can be buffered into the outbox.
///
/// The tag must be stable across deployments: it is written to storage and
/// resolved again, possibly much later, by whichever instance dispatches the
/// row.
pub trait OutboundPayload: Serialize {
    /// Stable string tag identifying this payload type, e.g. `"order.placed.v1"`.
    fn payload_type() -> &'static str;
}

/// A payload reconstructed from its stored tag and body.
///
/// The concrete type is erased; transports downcast to the types they know.
pub struct DecodedPayload {
    payload_type: String,
    value: Box<dyn Any + Send>,
}

impl DecodedPayload {
    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self {
                payload_type: self.payload_type,
                value,
            }),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

type Decoder = Arc<dyn Fn(&str) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync>;

/// Dispatch table from payload tag to decoder, resolved at startup.
#[derive(Default, Clone)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a payload type under its stable tag.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: OutboundPayload + DeserializeOwned + Send + 'static,
    {
        self.decoders.insert(
            T::payload_type(),
            Arc::new(|raw| {
                serde_json::from_str::<T>(raw).map(|value| Box::new(value) as Box<dyn Any + Send>)
            }),
        );
        self
    }

    pub fn contains(&self, payload_type: &str) -> bool {
        self.decoders.contains_key(payload_type)
    }

    /// Reconstructs a payload from its stored tag and serialized body.
    ///
    /// Fails with [`Error::UnknownPayloadType`] for unregistered tags and
    /// [`Error::UndecodablePayload`] for bodies the registered decoder
    /// rejects. Both are permanent failures from the dispatcher's point of
    /// view.
    pub fn decode(&self, payload_type: &str, raw: &str) -> Result<DecodedPayload, Error> {
        let decoder =
            self.decoders
                .get(payload_type)
                .ok_or_else(|| Error::UnknownPayloadType {
                    payload_type: payload_type.to_owned(),
                })?;

        let value = decoder(raw).map_err(|e| Error::UndecodablePayload {
            payload_type: payload_type.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(DecodedPayload {
            payload_type: payload_type.to_owned(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct ShipOrder {
        order_id: u64,
    }

    impl OutboundPayload for ShipOrder {
        fn payload_type() -> &'static str {
            "order.ship.v1"
        }
    }

    #[test]
    fn decodes_registered_payloads() {
        let mut registry = PayloadRegistry::new();
        registry.register::<ShipOrder>();

        let decoded = registry
            .decode("order.ship.v1", r#"{"order_id":42}"#)
            .unwrap();

        assert_eq!(
            decoded.downcast::<ShipOrder>().ok(),
            Some(ShipOrder { order_id: 42 })
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = PayloadRegistry::new();
        assert!(matches!(
            registry.decode("order.ship.v1", "{}"),
            Err(Error::UnknownPayloadType { .. })
        ));
    }

    #[test]
    fn malformed_body_is_an_error() {
        let mut registry = PayloadRegistry::new();
        registry.register::<ShipOrder>();

        assert!(matches!(
            registry.decode("order.ship.v1", "not json"),
            Err(Error::UndecodablePayload { .. })
        ));
    }
}
