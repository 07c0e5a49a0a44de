//! Message envelope
//!
//! The wire-independent unit every transport carries:
//!
//! ```text
//! { to: [string] | "all", from: string, timestamp: ISO-8601, data: { type: string, ... } }
//! ```
//!
//! `from`, `timestamp` and `data.type` are filled in by the [`Messenger`](super::Messenger)
//! at send time; callers only choose the recipients, the type and the payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Sentinel meaning "every peer on the other side of the transport"
pub const BROADCAST: &str = "all";

/// Key under which the routing type is stored inside `data`
pub const TYPE_KEY: &str = "type";

/// Envelope recipients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every peer
    Broadcast,
    /// Only the listed identities
    Only(Vec<String>),
}

impl Recipients {
    pub fn all() -> Self {
        Self::Broadcast
    }

    pub fn to<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(ids.into_iter().map(Into::into).collect())
    }

    /// Whether an endpoint with `identity` should receive the envelope
    ///
    /// A list that itself contains the broadcast sentinel counts as broadcast.
    pub fn includes(&self, identity: &str) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Only(ids) => ids.iter().any(|id| id == identity || id == BROADCAST),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Only(ids) => ids.iter().any(|id| id == BROADCAST),
        }
    }
}

impl Serialize for Recipients {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Broadcast => serializer.serialize_str(BROADCAST),
            Self::Only(ids) => ids.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Recipients {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<String>),
            Sentinel(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::List(ids) => Ok(Self::Only(ids)),
            Repr::Sentinel(s) if s == BROADCAST => Ok(Self::Broadcast),
            Repr::Sentinel(other) => Err(serde::de::Error::custom(format!(
                "expected recipient list or \"{}\", got \"{}\"",
                BROADCAST, other
            ))),
        }
    }
}

/// Open payload of an envelope
///
/// A JSON object that carries a `type` entry once it has been sent. Handlers get
/// their own copy, so nothing they do is visible to other handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageData(Map<String, Value>);

impl MessageData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Routing type copied in by the messenger, if any
    pub fn message_type(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(Value::as_str)
    }

    /// Builder-style field insertion
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Overwrite `type` with the routing type. Only the messenger calls this.
    pub(crate) fn stamp_type(&mut self, message_type: &str) {
        self.0
            .insert(TYPE_KEY.to_string(), Value::String(message_type.to_string()));
    }
}

impl From<Map<String, Value>> for MessageData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Addressed, timestamped, typed unit of communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: Recipients,
    pub from: String,
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    pub data: MessageData,
}

impl Envelope {
    pub fn message_type(&self) -> Option<&str> {
        self.data.message_type()
    }

    pub fn is_addressed_to(&self, identity: &str) -> bool {
        self.to.includes(identity)
    }
}

/// Render a timestamp the way envelopes carry it: millisecond precision, `Z` suffix
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod iso8601 {
    use super::format_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_recipients_serialization() {
        assert_eq!(serde_json::to_value(Recipients::all()).unwrap(), json!("all"));
        assert_eq!(
            serde_json::to_value(Recipients::to(["w1", "w2"])).unwrap(),
            json!(["w1", "w2"])
        );

        let parsed: Recipients = serde_json::from_value(json!("all")).unwrap();
        assert_eq!(parsed, Recipients::Broadcast);
        let parsed: Recipients = serde_json::from_value(json!(["w1"])).unwrap();
        assert_eq!(parsed, Recipients::to(["w1"]));

        assert!(serde_json::from_value::<Recipients>(json!("w1")).is_err());
    }

    #[test]
    fn test_recipients_includes() {
        assert!(Recipients::all().includes("anyone"));
        assert!(Recipients::to(["w1", "w2"]).includes("w2"));
        assert!(!Recipients::to(["w1"]).includes("w2"));
        assert!(!Recipients::to(Vec::<String>::new()).includes("w1"));

        // Legacy convention: a list holding the sentinel
        let legacy = Recipients::to(["all"]);
        assert!(legacy.includes("w9"));
        assert!(legacy.is_broadcast());
    }

    #[test]
    fn test_stamp_type_overwrites_caller_value() {
        let mut data = MessageData::new().with("type", "spoofed").with("round", 3);
        data.stamp_type("prepare");
        assert_eq!(data.message_type(), Some("prepare"));
        assert_eq!(data.get("round"), Some(&json!(3)));
    }

    #[test]
    fn test_envelope_json_shape() {
        let mut data = MessageData::new().with("round", 1);
        data.stamp_type("test");
        let envelope = Envelope {
            to: Recipients::to(["w1"]),
            from: "master-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            data,
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "to": ["w1"],
                "from": "master-1",
                "timestamp": "2024-05-01T12:00:00.000Z",
                "data": { "type": "test", "round": 1 }
            })
        );

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(back.message_type(), Some("test"));
        assert!(back.is_addressed_to("w1"));
    }
}
