//! Event records
//!
//! An [`EventRecord`] is an ordered mapping from string keys to scalar values.
//! Records carry a handful of reserved `om_`-prefixed keys alongside caller
//! parameters, persist losslessly as JSON while queued, and are flattened to
//! a percent-encoded query string at delivery time.
//!
//! ## Timestamp semantics
//!
//! A record stores `om_creation_time` (epoch milliseconds, set at enqueue).
//! The wire format replaces it with `om_delta`, the whole seconds elapsed
//! between creation and transmission. The server reconstructs the creation
//! time from its own receive clock, which removes client/server clock skew
//! from the stored timeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Reserved key: the event type name.
pub const KEY_EVENT_TYPE: &str = "om_event_type";
/// Reserved key: API key(s) the event is tracked against.
pub const KEY_API_KEY: &str = "api_key";
/// Reserved key: user id(s) the event is tracked against.
pub const KEY_UID: &str = "uid";
/// Reserved key: creation time in epoch milliseconds (queued form only).
pub const KEY_CREATION_TIME: &str = "om_creation_time";
/// Reserved key: seconds since creation (wire form only).
pub const KEY_DELTA: &str = "om_delta";

/// A single trackable occurrence, queued for delivery.
///
/// Field order is insertion order and round-trips through the persisted JSON
/// form unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRecord {
    fields: Map<String, Value>,
}

impl EventRecord {
    /// Build a record from caller parameters plus the reserved fields.
    ///
    /// Caller parameters come first; reserved fields overwrite any caller
    /// parameter using the same key.
    pub fn new(
        event_type: &str,
        parameters: Option<Map<String, Value>>,
        api_key: &str,
        uid: &str,
        creation_time_ms: i64,
    ) -> Self {
        let mut fields = parameters.unwrap_or_default();
        fields.insert(KEY_EVENT_TYPE.to_string(), Value::from(event_type));
        fields.insert(KEY_API_KEY.to_string(), Value::from(api_key));
        fields.insert(KEY_UID.to_string(), Value::from(uid));
        fields.insert(KEY_CREATION_TIME.to_string(), Value::from(creation_time_ms));
        Self { fields }
    }

    /// The event type name, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.fields.get(KEY_EVENT_TYPE).and_then(Value::as_str)
    }

    /// Creation time in epoch milliseconds, if present.
    pub fn creation_time_ms(&self) -> Option<i64> {
        self.fields.get(KEY_CREATION_TIME).and_then(Value::as_i64)
    }

    /// Field lookup by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize to the persisted textual form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    /// Deserialize from the persisted textual form.
    pub fn from_json(text: &str) -> Result<Self> {
        let fields: Map<String, Value> = serde_json::from_str(text)?;
        Ok(Self { fields })
    }

    /// Produce the wire form: `om_creation_time` is replaced by `om_delta`,
    /// the whole seconds elapsed between creation and `now_ms`.
    ///
    /// A record without a creation time is passed through unchanged.
    pub fn for_transmission(&self, now_ms: i64) -> EventRecord {
        let mut out = self.clone();
        if let Some(creation) = out.creation_time_ms() {
            out.fields.remove(KEY_CREATION_TIME);
            let delta = (now_ms - creation).div_euclid(1000);
            out.fields.insert(KEY_DELTA.to_string(), Value::from(delta));
        }
        out
    }

    /// Encode every field as `key=value` pairs with standard percent
    /// encoding, joined by `&`, with no trailing separator.
    pub fn query_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.fields.len());
        for (key, value) in &self.fields {
            parts.push(format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&render_value(value))
            ));
        }
        parts.join("&")
    }
}

/// Render a JSON scalar the way it should appear in a query string.
///
/// Strings are used verbatim (no surrounding quotes); everything else uses
/// its JSON rendering.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge two parameter maps: `base` first, `overlay` wins on key conflicts.
pub(crate) fn merge_parameters(
    base: Map<String, Value>,
    overlay: Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = base;
    for (key, value) in overlay {
        merged.insert(key, value);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventRecord {
        let mut params = Map::new();
        params.insert("level".to_string(), Value::from(7));
        params.insert("name".to_string(), Value::from("first visit"));
        EventRecord::new("om_load", Some(params), "key-1", "user-1", 1_700_000_000_000)
    }

    #[test]
    fn test_reserved_fields_present() {
        let record = sample();
        assert_eq!(record.event_type(), Some("om_load"));
        assert_eq!(record.get(KEY_API_KEY), Some(&Value::from("key-1")));
        assert_eq!(record.get(KEY_UID), Some(&Value::from("user-1")));
        assert_eq!(record.creation_time_ms(), Some(1_700_000_000_000));
    }

    #[test]
    fn test_reserved_fields_overwrite_caller_parameters() {
        let mut params = Map::new();
        params.insert(KEY_API_KEY.to_string(), Value::from("spoofed"));
        let record = EventRecord::new("e", Some(params), "real", "u", 0);
        assert_eq!(record.get(KEY_API_KEY), Some(&Value::from("real")));
    }

    #[test]
    fn test_json_round_trip_preserves_order_and_values() {
        let record = sample();
        let text = record.to_json().unwrap();
        let back = EventRecord::from_json(&text).unwrap();
        assert_eq!(back, record);
        // Insertion order survives the round trip
        let keys: Vec<_> = back.fields.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "level",
                "name",
                KEY_EVENT_TYPE,
                KEY_API_KEY,
                KEY_UID,
                KEY_CREATION_TIME
            ]
        );
    }

    #[test]
    fn test_query_string_encoding() {
        let mut params = Map::new();
        params.insert("q".to_string(), Value::from("a b&c"));
        let record = EventRecord::new("e", Some(params), "k", "u", 5);
        let qs = record.query_string();
        assert_eq!(
            qs,
            "q=a%20b%26c&om_event_type=e&api_key=k&uid=u&om_creation_time=5"
        );
        assert!(!qs.ends_with('&'));
    }

    #[test]
    fn test_for_transmission_replaces_creation_with_delta() {
        let record = sample();
        let creation = record.creation_time_ms().unwrap();
        // 90.5 seconds later; delta is floored to whole seconds
        let sent = record.for_transmission(creation + 90_500);
        assert_eq!(sent.get(KEY_DELTA), Some(&Value::from(90)));
        assert!(sent.get(KEY_CREATION_TIME).is_none());
        // Original record is untouched
        assert_eq!(record.creation_time_ms(), Some(creation));
    }

    #[test]
    fn test_for_transmission_without_creation_time() {
        let record = EventRecord::from_json(r#"{"om_event_type":"e"}"#).unwrap();
        let sent = record.for_transmission(1_000);
        assert!(sent.get(KEY_DELTA).is_none());
        assert_eq!(sent, record);
    }

    #[test]
    fn test_merge_parameters_overlay_wins() {
        let mut base = Map::new();
        base.insert("a".to_string(), Value::from(1));
        base.insert("b".to_string(), Value::from(2));
        let mut overlay = Map::new();
        overlay.insert("b".to_string(), Value::from(3));
        let merged = merge_parameters(base, overlay);
        assert_eq!(merged.get("a"), Some(&Value::from(1)));
        assert_eq!(merged.get("b"), Some(&Value::from(3)));
    }
}
