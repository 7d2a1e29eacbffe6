//! Records, identifiers, and conversation turns.
//!
//! A [`Record`] is a JSON object with a stable identifier field. Stages only
//! ever add fields to it; the original JSON value of the identifier is kept so
//! integer ids round-trip as integers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Default identifier field.
pub const DEFAULT_ID_FIELD: &str = "post_id";

/// Canonical text form of a record identifier.
///
/// `"17"` and `17` compare equal: ids are matched by their text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Canonicalize a JSON identifier value. Only strings and integers qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(Self(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One unit of work: an identified JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: RecordId,
    id_field: String,
    fields: Map<String, Value>,
}

impl Record {
    /// Build a record from a JSON value, reading the identifier from `id_field`.
    pub fn from_value(value: Value, id_field: &str, location: &str) -> Result<Self, StoreError> {
        let Value::Object(fields) = value else {
            return Err(StoreError::MalformedRecord {
                location: location.to_string(),
                message: "entry is not a JSON object".into(),
            });
        };
        let id = fields
            .get(id_field)
            .and_then(RecordId::from_value)
            .ok_or_else(|| StoreError::MalformedRecord {
                location: location.to_string(),
                message: format!("missing or invalid \"{id_field}\""),
            })?;
        Ok(Self {
            id,
            id_field: id_field.to_string(),
            fields,
        })
    }

    /// Build a record with a string identifier and no other fields.
    pub fn with_id(id_field: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        let mut fields = Map::new();
        fields.insert(id_field.to_string(), Value::String(id.clone()));
        Self {
            id: RecordId(id),
            id_field: id_field.to_string(),
            fields,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether `key` is present and not null.
    pub fn has(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    /// Set a payload field. The identifier field is never overwritten.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key != self.id_field {
            self.fields.insert(key, value);
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Decode the `conversation` field, if present.
    pub fn conversation(&self) -> Option<Result<Vec<Turn>, serde_json::Error>> {
        self.fields
            .get("conversation")
            .map(|v| serde_json::from_value(v.clone()))
    }

    pub fn set_conversation(&mut self, turns: &[Turn]) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(turns)?;
        self.fields.insert("conversation".into(), value);
        Ok(())
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// One round of a conversation: the patient's message and the counselor's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    /// Absent on counselor-only rounds such as a closing remark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<String>,
    /// Draft counselor line written while scaffolding the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counselor: Option<String>,
    /// Final visible counselor reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counselor_content: Option<String>,
    /// Reasoning behind the reply, kept apart from the visible text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counselor_think: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Turn {
    pub fn is_answered(&self) -> bool {
        self.counselor_content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// Patient text, if the turn has any that is not blank.
    pub fn patient_text(&self) -> Option<&str> {
        self.patient.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// A turn needs a reply when it has patient text and no answer yet.
    pub fn needs_reply(&self) -> bool {
        self.patient_text().is_some() && !self.is_answered()
    }
}
