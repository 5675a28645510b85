//! Decoded device messages

use serde_json::{Map, Value};

/// Key carrying the query identifier in requests and responses
pub const QID_KEY: &str = "qid";

/// Key carrying the command path in requests
pub const TASK_KEY: &str = "task";

/// How a message was recovered from the byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Frame body parsed as a JSON object
    Genuine,
    /// Frame body was malformed; only the `qid` field was recovered
    Salvaged,
}

/// A JSON object received from the device
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    fields: Map<String, Value>,
    origin: Origin,
}

impl Message {
    /// Wrap a fully parsed JSON object
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            origin: Origin::Genuine,
        }
    }

    /// Build a salvaged message holding nothing but `qid`
    pub fn salvaged(qid: i64) -> Self {
        let mut fields = Map::new();
        fields.insert(QID_KEY.to_string(), Value::from(qid));
        Self {
            fields,
            origin: Origin::Salvaged,
        }
    }

    /// Query identifier, if the message carries an integer `qid`
    pub fn qid(&self) -> Option<i64> {
        self.fields.get(QID_KEY).and_then(Value::as_i64)
    }

    /// Look up a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True if `key` is present in the message
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// All fields of the message
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Where the message came from
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// True if only the `qid` could be recovered
    pub fn is_salvaged(&self) -> bool {
        self.origin == Origin::Salvaged
    }

    /// Convert into a plain JSON value
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_qid_accessor() {
        let Value::Object(map) = json!({"qid": 12, "task": "/state_get"}) else {
            unreachable!()
        };
        let msg = Message::new(map);
        assert_eq!(msg.qid(), Some(12));
        assert!(msg.contains_key("task"));
        assert!(!msg.is_salvaged());
    }

    #[test]
    fn test_non_integer_qid_is_ignored() {
        let Value::Object(map) = json!({"qid": "12"}) else {
            unreachable!()
        };
        assert_eq!(Message::new(map).qid(), None);
    }

    #[test]
    fn test_salvaged_has_only_qid() {
        let msg = Message::salvaged(-4);
        assert_eq!(msg.qid(), Some(-4));
        assert_eq!(msg.fields().len(), 1);
        assert_eq!(msg.origin(), Origin::Salvaged);
        assert_eq!(msg.into_value(), json!({"qid": -4}));
    }
}
