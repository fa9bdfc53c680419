//! Event model
//!
//! Every call the application makes (track/identify/screen/group/alias) becomes
//! an [`Event`]: a set of common envelope fields plus a closed [`EventKind`]
//! carrying the per-verb payload. Events are plain values; once the pipeline
//! serializes one to storage the in-memory copy is discardable.
//!
//! ## Wire format
//!
//! ```json
//! {"type":"track","event":"Signed Up","properties":{},"messageId":"...",
//!  "anonymousId":"...","timestamp":"2026-01-01T00:00:00.000Z",
//!  "context":{},"integrations":{},"_metadata":{...}}
//! ```
//!
//! `userId` is omitted when blank and `traits` is omitted when empty, to keep
//! batches small.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Untyped JSON object used for context, integrations, properties and traits.
pub type JsonMap = Map<String, Value>;

/// Integrations key that toggles every cloud destination at once.
pub const ALL_INTEGRATIONS_KEY: &str = "All";

/// Discriminant of an [`EventKind`], handy for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Track,
    Identify,
    Screen,
    Group,
    Alias,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Track => "track",
            EventType::Identify => "identify",
            EventType::Screen => "screen",
            EventType::Group => "group",
            EventType::Alias => "alias",
        }
    }
}

/// Per-verb payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Track {
        event: String,
        #[serde(default)]
        properties: JsonMap,
    },
    Identify {
        #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
        traits: JsonMap,
    },
    Screen {
        name: String,
        #[serde(default)]
        category: String,
        #[serde(default)]
        properties: JsonMap,
    },
    Group {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
        traits: JsonMap,
    },
    Alias {
        #[serde(rename = "previousId")]
        previous_id: String,
    },
}

/// Delivery metadata the server uses to decide cloud vs on-device delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationMetadata {
    #[serde(default)]
    pub bundled: Vec<String>,
    #[serde(default)]
    pub unbundled: Vec<String>,
    #[serde(default)]
    pub bundled_ids: Vec<String>,
}

/// A single analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique id for this message (uuid v4)
    pub message_id: String,
    /// Device-scoped identity, filled in by the host before the timeline runs
    #[serde(default)]
    pub anonymous_id: String,
    /// Known user identity; blank when unidentified
    #[serde(default, skip_serializing_if = "is_blank")]
    pub user_id: String,
    /// ISO-8601 creation time
    pub timestamp: String,
    /// Free-form context (library, device, app...)
    #[serde(default)]
    pub context: JsonMap,
    /// Per-destination enablement or settings for this event
    #[serde(default)]
    pub integrations: JsonMap,
    #[serde(rename = "_metadata", default)]
    pub metadata: DestinationMetadata,
    #[serde(flatten)]
    pub kind: EventKind,
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Current time formatted the way events and envelopes carry it.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Event {
    /// Build an event with fresh base data (message id, timestamp, empty maps).
    pub fn new(kind: EventKind) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            anonymous_id: String::new(),
            user_id: String::new(),
            timestamp: iso_now(),
            context: JsonMap::new(),
            integrations: JsonMap::new(),
            metadata: DestinationMetadata::default(),
            kind,
        }
    }

    pub fn track(event: impl Into<String>, properties: JsonMap) -> Self {
        Self::new(EventKind::Track {
            event: event.into(),
            properties,
        })
    }

    pub fn identify(user_id: impl Into<String>, traits: JsonMap) -> Self {
        let mut event = Self::new(EventKind::Identify { traits });
        event.user_id = user_id.into();
        event
    }

    pub fn screen(name: impl Into<String>, category: impl Into<String>, properties: JsonMap) -> Self {
        Self::new(EventKind::Screen {
            name: name.into(),
            category: category.into(),
            properties,
        })
    }

    pub fn group(group_id: impl Into<String>, traits: JsonMap) -> Self {
        Self::new(EventKind::Group {
            group_id: group_id.into(),
            traits,
        })
    }

    /// `user_id` is the new identity; `previous_id` the one being merged into it.
    pub fn alias(user_id: impl Into<String>, previous_id: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Alias {
            previous_id: previous_id.into(),
        });
        event.user_id = user_id.into();
        event
    }

    pub fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::Track { .. } => EventType::Track,
            EventKind::Identify { .. } => EventType::Identify,
            EventKind::Screen { .. } => EventType::Screen,
            EventKind::Group { .. } => EventType::Group,
            EventKind::Alias { .. } => EventType::Alias,
        }
    }

    /// Serialize to the compact JSON stored in batch files.
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    // ============================================
    // Context manipulation
    // ============================================

    pub fn put_in_context(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Insert `key: value` inside the `parent_key` object of the context,
    /// creating (or replacing a non-object) parent as needed.
    pub fn put_in_context_under_key(
        &mut self,
        parent_key: &str,
        key: impl Into<String>,
        value: Value,
    ) -> &mut Self {
        let parent = self
            .context
            .entry(parent_key.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !parent.is_object() {
            *parent = Value::Object(JsonMap::new());
        }
        if let Value::Object(map) = parent {
            map.insert(key.into(), value);
        }
        self
    }

    pub fn remove_from_context(&mut self, key: &str) -> &mut Self {
        self.context.remove(key);
        self
    }

    // ============================================
    // Integrations manipulation
    // ============================================

    pub fn put_integration(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.integrations.insert(key.into(), value);
        self
    }

    /// Mark an integration enabled for this event.
    ///
    /// An object value already counts as enabled and is left untouched.
    pub fn enable_integration(&mut self, key: &str) -> &mut Self {
        match self.integrations.get(key) {
            Some(Value::Object(_)) | Some(Value::Bool(true)) => self,
            _ => self.put_integration(key, Value::Bool(true)),
        }
    }

    pub fn disable_integration(&mut self, key: &str) -> &mut Self {
        self.put_integration(key, Value::Bool(false))
    }

    /// Turn off all cloud destinations, keeping the listed keys that were
    /// already present.
    pub fn disable_cloud_integrations(&mut self, except_keys: &[&str]) -> &mut Self {
        let mut integrations = JsonMap::new();
        integrations.insert(ALL_INTEGRATIONS_KEY.to_string(), Value::Bool(false));
        for key in except_keys {
            match self.integrations.get(*key) {
                Some(Value::Bool(_)) => {
                    integrations.insert(key.to_string(), Value::Bool(true));
                }
                Some(other) => {
                    integrations.insert(key.to_string(), other.clone());
                }
                None => {}
            }
        }
        self.integrations = integrations;
        self
    }

    /// Turn on all cloud destinations except the listed keys.
    pub fn enable_cloud_integrations(&mut self, except_keys: &[&str]) -> &mut Self {
        let mut integrations = JsonMap::new();
        integrations.insert(ALL_INTEGRATIONS_KEY.to_string(), Value::Bool(true));
        for key in except_keys {
            integrations.insert(key.to_string(), Value::Bool(false));
        }
        self.integrations = integrations;
        self
    }

    /// Customer override for a destination carried by this event.
    ///
    /// `Some(false)` for an explicit `false`, `Some(true)` for `true` or a
    /// settings object, `None` when the event says nothing about `key`.
    pub fn integration_override(&self, key: &str) -> Option<bool> {
        match self.integrations.get(key)? {
            Value::Bool(enabled) => Some(*enabled),
            Value::Object(_) => Some(true),
            _ => None,
        }
    }
}
