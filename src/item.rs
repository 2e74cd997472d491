//! Items: the unit of work carried through every stage.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::stages::StageGraph;

/// Prefix of the older flat layout, which kept each result as a top-level
/// `analysis_<slot>` field.
const LEGACY_RESULT_PREFIX: &str = "analysis_";

static KNOWN_SLOTS: Lazy<Vec<&'static str>> = Lazy::new(|| StageGraph::standard().slots().collect());

/// One unit of work (e.g. one verse).
///
/// `results` maps a result slot to an opaque value; a missing or `null` slot is
/// pending. `meta` carries every other field of the on-disk record so
/// collaborator-owned data round-trips untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredItem")]
pub struct Item {
    pub id: String,
    pub text: String,
    pub results: BTreeMap<String, Value>,
    pub conversations: BTreeMap<String, ConversationState>,
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

/// On-disk shape, current or legacy.
#[derive(Deserialize)]
struct StoredItem {
    #[serde(alias = "verse_id")]
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    results: BTreeMap<String, Value>,
    #[serde(default, alias = "state_ids")]
    conversations: BTreeMap<String, ConversationState>,
    #[serde(flatten)]
    meta: Map<String, Value>,
}

impl From<StoredItem> for Item {
    fn from(stored: StoredItem) -> Self {
        let StoredItem {
            id,
            text,
            mut results,
            conversations,
            mut meta,
        } = stored;

        for slot in KNOWN_SLOTS.iter() {
            let Some(legacy) = meta.remove(&format!("{LEGACY_RESULT_PREFIX}{slot}")) else {
                continue;
            };
            // A non-null nested result is newer than the flat field.
            let current = results.get(*slot).filter(|v| !v.is_null());
            if current.is_none() {
                results.insert(slot.to_string(), legacy);
            }
        }

        Self {
            id,
            text,
            results,
            conversations,
            meta,
        }
    }
}

impl Item {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            results: BTreeMap::new(),
            conversations: BTreeMap::new(),
            meta: Map::new(),
        }
    }

    pub fn with_result(mut self, slot: &str, value: Value) -> Self {
        self.results.insert(slot.to_string(), value);
        self
    }

    /// Result in `slot`, if present and non-null.
    pub fn result(&self, slot: &str) -> Option<&Value> {
        self.results.get(slot).filter(|v| !v.is_null())
    }

    pub fn is_pending(&self, slot: &str) -> bool {
        self.result(slot).is_none()
    }

    pub fn set_result(&mut self, slot: &str, value: Value) {
        self.results.insert(slot.to_string(), value);
    }

    /// Remove a result. Returns whether anything was set.
    pub fn clear_result(&mut self, slot: &str) -> bool {
        self.results
            .remove(slot)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// Conversation handle recorded for `stage`, if one exists.
    pub fn handle(&self, stage: &str) -> Option<&ConversationHandle> {
        match self.conversations.get(stage) {
            Some(ConversationState::Handle(h)) => Some(h),
            _ => None,
        }
    }

    pub fn set_conversation(&mut self, stage: &str, state: ConversationState) {
        self.conversations.insert(stage.to_string(), state);
    }

    pub fn clear_conversation(&mut self, stage: &str) -> bool {
        matches!(
            self.conversations.remove(stage),
            Some(ConversationState::Handle(_))
        )
    }

    /// Whether a stored result marks a failure rather than a real output.
    pub fn is_error_marker(value: &Value) -> bool {
        match value {
            Value::Object(obj) => obj.contains_key("error") || obj.contains_key("parse_error"),
            Value::String(s) => s.trim_start().to_lowercase().starts_with("error"),
            _ => false,
        }
    }
}

/// An external session owned by one item for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHandle {
    /// Session id returned by the backend.
    pub session: String,
    /// Resource (model) that owns the session.
    pub resource: String,
}

/// Conversation state of one item for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConversationState {
    #[default]
    None,
    Handle(ConversationHandle),
}

impl ConversationState {
    pub fn handle(session: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::Handle(ConversationHandle {
            session: session.into(),
            resource: resource.into(),
        })
    }

    /// Read any on-disk form. Only records naming both a session and its
    /// resource become a handle; everything else is `None`.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::None;
        };
        let session = ["session", "id", "response_id"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty());
        let resource = ["resource", "model"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty());
        match (session, resource) {
            (Some(session), Some(resource)) => Self::handle(session, resource),
            _ => Self::None,
        }
    }
}

impl Serialize for ConversationState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_none(),
            Self::Handle(h) => h.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ConversationState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}
