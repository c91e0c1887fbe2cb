//! Core event model.
//!
//! An [`Event`] is the unit of work moving through the pipeline: created by
//! ingestion, partitioned by session key, grouped into [`DeliveryUnit`]s by
//! the consumer, and handed to the processing layer. The source system kept
//! events as untyped JSON maps; here the core fields are typed and only
//! genuinely open-ended per-platform hints live in the `metadata` side-map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use courier_channel_protocol::{FileRef, Location};

// ============================================================================
// Event
// ============================================================================

/// Free-form message content carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
    /// Per-source payload fields with no cross-channel meaning.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A prompt asking the user to share their location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRequest {
    pub prompt: String,
}

/// The unit of user activity moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "generate_event_id")]
    pub id: String,
    /// Owning user. Absent for system events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Origin channel tag: "telegram", "gmail", "scheduled", "triggered", ...
    pub source: String,
    /// Destination channel override. Defaults to `source` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    /// Delivery hints: `output_chat_id`, `output_phone_number`, `forwarded`,
    /// `original_source`, request/response correlation tokens.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_location: Option<LocationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_location: Option<Location>,
}

impl Event {
    /// Create a bare event from a source tag.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: generate_event_id(),
            user_id: None,
            source: source.into(),
            output_type: None,
            payload: Payload::default(),
            metadata: BTreeMap::new(),
            request_location: None,
            send_location: None,
        }
    }

    /// Convenience constructor for a user text message.
    pub fn message(
        source: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(source);
        event.user_id = Some(user_id.into());
        event.payload.text = Some(text.into());
        event
    }

    /// Session key for ordered, exclusive delivery.
    ///
    /// `"{source}_{user_id}"` for user events, `"system_{source}"` otherwise.
    /// Events sharing a key reach the same consumer partition FIFO.
    pub fn session_key(&self) -> String {
        match &self.user_id {
            Some(user_id) => format!("{}_{}", self.source, user_id),
            None => format!("system_{}", self.source),
        }
    }

    /// Session key on the suspended queue: all suspended traffic for a user
    /// groups together regardless of source.
    pub fn suspended_session_key(&self) -> String {
        self.user_id.clone().unwrap_or_else(|| "system".to_string())
    }

    /// Look up a metadata hint, accepting string or numeric values
    /// (chat ids arrive as numbers from some webhooks).
    pub fn metadata_hint(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether the message was forwarded from another conversation.
    pub fn is_forwarded(&self) -> bool {
        self.metadata
            .get("forwarded")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn has_files(&self) -> bool {
        !self.payload.files.is_empty()
    }
}

/// Generate a unique event ID.
pub fn generate_event_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

// ============================================================================
// ScheduledEvent
// ============================================================================

/// An event plus the instant it becomes visible.
///
/// Dormant until `deliver_at`, then an ordinary [`Event`] in the target
/// queue. Never mutated after creation; consumed exactly once by the
/// backend's delay mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub event: Event,
    pub deliver_at: DateTime<Utc>,
}

// ============================================================================
// DeliveryUnit
// ============================================================================

/// One or more raw events yielded together by the consumer after grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryUnit {
    pub session_id: String,
    pub events: Vec<Event>,
    pub is_grouped: bool,
}

impl DeliveryUnit {
    pub fn new(session_id: impl Into<String>, events: Vec<Event>) -> Self {
        let is_grouped = events.len() > 1;
        Self {
            session_id: session_id.into(),
            events,
            is_grouped,
        }
    }

    pub fn single(event: Event) -> Self {
        Self {
            session_id: event.session_key(),
            events: vec![event],
            is_grouped: false,
        }
    }
}

// ============================================================================
// SuspendedEnvelope
// ============================================================================

/// Wrapper stored on the suspended queue for entitlement-gated users.
///
/// Acked when replay succeeds; a replay failure is logged for operator
/// recovery rather than redelivered (poison-envelope policy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuspendedEnvelope {
    Normal { event: Event },
    Schedule(ScheduledEvent),
}

// ============================================================================
// ProcessResult
// ============================================================================

/// Output of the external processing/agent layer for one delivery unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_links: Vec<FileRef>,
}

impl ProcessResult {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            file_links: Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
