use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Property key holding the message id.
pub const MSGID: &str = "_msgid";
/// Property key holding the grouping descriptor.
pub const PARTS: &str = "parts";

/// Generate a fresh message / group id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The message envelope passed along the wires.
///
/// A message is a key-ordered JSON object. `_msgid` is assigned once when the
/// message enters a flow and travels unchanged through every node that
/// transforms it; `parts` describes the message's place inside a sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

/// Grouping descriptor carried in `parts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parts {
    pub id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl Message {
    /// An empty message with a fresh `_msgid`.
    pub fn new() -> Self {
        let mut map = Map::new();
        map.insert(MSGID.to_string(), Value::String(generate_id()));
        Self(map)
    }

    pub fn with_payload(payload: Value) -> Self {
        let mut msg = Self::new();
        msg.set_payload(payload);
        msg
    }

    /// Wrap an existing property map; no `_msgid` is added.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a message from a JSON value. Only objects are messages.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn msgid(&self) -> Option<&str> {
        self.0.get(MSGID).and_then(Value::as_str)
    }

    pub fn set_msgid(&mut self, id: impl Into<String>) {
        self.0.insert(MSGID.to_string(), Value::String(id.into()));
    }

    /// Return the message id, assigning one first if missing.
    pub fn ensure_msgid(&mut self) -> String {
        match self.msgid() {
            Some(id) => id.to_string(),
            None => {
                let id = generate_id();
                self.set_msgid(id.clone());
                id
            }
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.get("payload")
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.0.insert("payload".to_string(), payload);
    }

    pub fn topic(&self) -> Option<&str> {
        self.0.get("topic").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Read `parts` when it carries a string id and an index.
    pub fn parts(&self) -> Option<Parts> {
        let parts = self.0.get(PARTS)?.as_object()?;
        Some(Parts {
            id: parts.get("id")?.as_str()?.to_string(),
            index: parts.get("index")?.as_u64()? as usize,
            count: parts.get("count").and_then(Value::as_u64).map(|c| c as usize),
        })
    }

    /// Overwrite the `id`/`index`/`count` of `parts`, keeping any other
    /// properties already present in the descriptor.
    pub fn set_parts(&mut self, id: &str, index: usize, count: usize) {
        let entry = self
            .0
            .entry(PARTS.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(parts) = entry {
            parts.insert("id".into(), json!(id));
            parts.insert("index".into(), json!(index));
            parts.insert("count".into(), json!(count));
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_has_msgid() {
        let msg = Message::new();
        assert!(msg.msgid().is_some());
        assert_ne!(msg.msgid(), Message::new().msgid());
    }

    #[test]
    fn test_keys_keep_insertion_order() {
        let mut msg = Message::from_map(Map::new());
        msg.set("zeta", json!(1));
        msg.set("alpha", json!(2));
        msg.set("mid", json!(3));
        let keys: Vec<&String> = msg.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_clone_is_a_value_copy() {
        let mut msg = Message::with_payload(json!({"a": 1}));
        let copy = msg.clone();
        msg.set_payload(json!({"a": 2}));
        assert_eq!(copy.payload(), Some(&json!({"a": 1})));
        assert_eq!(copy.msgid(), msg.msgid());
    }

    #[test]
    fn test_set_parts_keeps_extra_fields() {
        let mut msg = Message::from_value(json!({
            "payload": 1,
            "parts": {"id": "old", "index": 4, "type": "array"}
        }))
        .unwrap();
        msg.set_parts("g1", 0, 3);
        assert_eq!(
            msg.get("parts"),
            Some(&json!({"id": "g1", "index": 0, "type": "array", "count": 3}))
        );
        assert_eq!(
            msg.parts(),
            Some(Parts { id: "g1".into(), index: 0, count: Some(3) })
        );
    }

    #[test]
    fn test_parts_requires_id_and_index() {
        let msg = Message::from_value(json!({"parts": {"index": 1}})).unwrap();
        assert!(msg.parts().is_none());
        assert!(Message::from_value(json!("text")).is_none());
    }

    #[test]
    fn test_ensure_msgid_assigns_once() {
        let mut msg = Message::from_map(Map::new());
        let id = msg.ensure_msgid();
        assert_eq!(msg.ensure_msgid(), id);
    }
}
