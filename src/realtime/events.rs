//! Change events delivered by the backend's change feed.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::domain::entities::{Category, ContentItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One committed row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub operation: Operation,
    pub new_row: Option<Value>,
    pub old_row: Option<Value>,
    pub timestamp: OffsetDateTime,
}

/// `data` object of a `postgres_changes` broadcast.
#[derive(Debug, Deserialize)]
struct WireChange {
    table: String,
    #[serde(rename = "type")]
    operation: Operation,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    commit_timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    data: WireChange,
}

impl ChangeEvent {
    pub fn new(
        table: impl Into<String>,
        operation: Operation,
        new_row: Option<Value>,
        old_row: Option<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            operation,
            new_row: new_row.filter(non_empty),
            old_row: old_row.filter(non_empty),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Decode the payload of a `postgres_changes` channel message.
    pub fn from_wire(payload: &Value) -> Result<Self, serde_json::Error> {
        let WirePayload { data } = WirePayload::deserialize(payload)?;
        Ok(Self {
            table: data.table,
            operation: data.operation,
            new_row: data.record.filter(non_empty),
            old_row: data.old_record.filter(non_empty),
            timestamp: data
                .commit_timestamp
                .unwrap_or_else(OffsetDateTime::now_utc),
        })
    }

    pub fn new_item(&self) -> Option<ContentItem> {
        decode_row(self.new_row.as_ref())
    }

    pub fn old_item(&self) -> Option<ContentItem> {
        decode_row(self.old_row.as_ref())
    }

    pub fn new_category(&self) -> Option<Category> {
        decode_row(self.new_row.as_ref())
    }

    /// Primary key of the affected item, from whichever image carries it.
    pub fn item_id(&self) -> Option<i64> {
        [self.new_row.as_ref(), self.old_row.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get("id").and_then(Value::as_i64))
    }
}

fn non_empty(row: &Value) -> bool {
    row.as_object().is_some_and(|fields| !fields.is_empty())
}

fn decode_row<T: serde::de::DeserializeOwned>(row: Option<&Value>) -> Option<T> {
    row.and_then(|row| T::deserialize(row).ok())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_payload_decodes() {
        let payload = json!({
            "ids": [1],
            "data": {
                "schema": "public",
                "table": "posts",
                "type": "UPDATE",
                "commit_timestamp": "2024-05-26T13:00:00Z",
                "record": {"id": 1, "title": "Pole at Monaco", "published": true},
                "old_record": {"id": 1}
            }
        });
        let event = ChangeEvent::from_wire(&payload).expect("decode");
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.table, "posts");
        assert_eq!(event.new_item().map(|item| item.title), Some("Pole at Monaco".into()));
        assert_eq!(event.item_id(), Some(1));
        assert_eq!(event.timestamp.year(), 2024);
    }

    #[test]
    fn empty_images_are_dropped() {
        let event = ChangeEvent::new("posts", Operation::Delete, Some(json!({})), Some(json!({"id": 4})));
        assert!(event.new_row.is_none());
        assert!(event.new_item().is_none());
        assert_eq!(event.item_id(), Some(4));
    }

    #[test]
    fn unknown_operations_are_rejected() {
        let payload = json!({"data": {"table": "posts", "type": "TRUNCATE"}});
        assert!(ChangeEvent::from_wire(&payload).is_err());
    }
}
