//! Subscription identifiers: a channel name plus typed parameter fields,
//! encoded on the wire as a JSON object (snake_case keys) serialized to a
//! string and used verbatim as the `identifier` in subscribe/message frames.

use serde_json::{Map, Value};

use crate::naming::to_snake_case;

/// A structured identifier for one Cable subscription.
///
/// Two identifiers with the same channel and the same parameter keys/values
/// are the same subscription regardless of the order parameters were added
/// (`PartialEq` is structural); [`SubscriptionIdentifier::encode`] always
/// produces the same wire string for the same construction order, which is
/// all the deduplication in `CableClient` needs.
#[derive(Debug, Clone)]
pub struct SubscriptionIdentifier {
    channel: String,
    params: Map<String, Value>,
}

impl SubscriptionIdentifier {
    /// Start building an identifier for `channel` (e.g. `"ClientChannel"`).
    pub fn new(channel: impl Into<String>) -> Self {
        SubscriptionIdentifier {
            channel: channel.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter. `field_name` is the source field's PascalCase/camelCase
    /// name (e.g. `"ClientId"`); it is snake_cased before being placed on the
    /// wire, matching the client's general JSON key policy.
    pub fn param(mut self, field_name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(to_snake_case(field_name), value.into());
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Encode as the canonical wire string: a JSON object with `channel`
    /// first, then parameters in the order they were added.
    pub fn encode(&self) -> String {
        let mut map = Map::new();
        map.insert("channel".to_owned(), Value::String(self.channel.clone()));
        for (k, v) in &self.params {
            map.insert(k.clone(), v.clone());
        }
        // A `Map` with `preserve_order` serializes in insertion order.
        serde_json::to_string(&map).expect("identifier map is always valid JSON")
    }

    /// Parse a previously-encoded identifier string back into its channel
    /// and parameters, used when the server echoes an identifier we didn't
    /// originate from (e.g. matching incoming frames against subscriptions).
    pub fn decode(encoded: &str) -> Result<Self, serde_json::Error> {
        let mut map: Map<String, Value> = serde_json::from_str(encoded)?;
        let channel = map
            .remove("channel")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        Ok(SubscriptionIdentifier {
            channel,
            params: map,
        })
    }
}

impl PartialEq for SubscriptionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel && self.params == other.params
    }
}
impl Eq for SubscriptionIdentifier {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_channel_and_params_as_snake_case_json_object() {
        let id = SubscriptionIdentifier::new("ClientChannel")
            .param("ClientId", "abc-123")
            .param("Secret", "shh");
        assert_eq!(
            id.encode(),
            r#"{"channel":"ClientChannel","client_id":"abc-123","secret":"shh"}"#
        );
    }

    #[test]
    fn equal_identifiers_are_equal_regardless_of_encoded_string_identity() {
        let a = SubscriptionIdentifier::new("ClientChannel").param("ClientId", "abc");
        let b = SubscriptionIdentifier::new("ClientChannel").param("ClientId", "abc");
        assert_eq!(a, b);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn differing_params_are_not_equal() {
        let a = SubscriptionIdentifier::new("ClientChannel").param("ClientId", "abc");
        let b = SubscriptionIdentifier::new("ClientChannel").param("ClientId", "xyz");
        assert_ne!(a, b);
    }

    #[test]
    fn decode_round_trips_through_encode() {
        let original = SubscriptionIdentifier::new("PrintChannel").param("PrinterId", "p1");
        let decoded = SubscriptionIdentifier::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }
}
