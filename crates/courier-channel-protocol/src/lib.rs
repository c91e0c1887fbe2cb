//! Channel sender contract for Courier.
//!
//! A *channel* is a user-facing messaging surface (Telegram, WhatsApp, email,
//! a websocket bridge, ...). The Courier core never speaks platform wire
//! formats itself; it routes final responses and liveness pings through the
//! [`ChannelSender`] trait defined here. Platform crates implement the trait
//! and register themselves with the runtime's channel registry.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default refresh interval for liveness ("typing") pings.
///
/// Most platforms expire a typing indicator after ~10 seconds, so a ping
/// every 10s keeps it alive. Channels with a shorter expiry window
/// (Telegram's is ~5s) override [`ChannelSender::typing_interval`].
pub const DEFAULT_TYPING_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Wire types
// ============================================================================

/// A normalized file descriptor attached to a message.
///
/// `blob_path` points into the runtime's object store; channels resolve it
/// to whatever upload/link mechanism the platform offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    /// Coarse media kind: "voice", "video", "audio", "image", "file", "document".
    #[serde(rename = "type")]
    pub kind: String,
    pub blob_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// A geographic point shared with (or by) the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by channel implementations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The platform rejected the message (bad target, rate limit, ...).
    #[error("send rejected by platform: {0}")]
    Rejected(String),

    /// The channel does not implement this operation (e.g. email has no
    /// location sharing).
    #[error("operation not supported by channel")]
    Unsupported,

    /// Transport-level failure talking to the platform.
    #[error("channel transport error: {0}")]
    Transport(String),
}

// ============================================================================
// ChannelSender
// ============================================================================

/// Outbound contract every channel integration implements.
///
/// `target` is the channel-specific destination identifier the core resolved
/// for the event (chat id, phone number, routing token, user id). Senders
/// must not panic on a malformed target; return [`ChannelError::Rejected`].
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Canonical lowercase channel name ("telegram", "whatsapp", ...).
    fn name(&self) -> &str;

    /// Deliver the final response text plus any file links.
    async fn send(&self, target: &str, text: &str, files: &[FileRef]) -> Result<(), ChannelError>;

    /// Ask the user to share their location.
    async fn send_location_request(&self, target: &str, prompt: &str) -> Result<(), ChannelError> {
        let _ = (target, prompt);
        Err(ChannelError::Unsupported)
    }

    /// Share a location with the user.
    async fn send_location(&self, target: &str, location: &Location) -> Result<(), ChannelError> {
        let _ = (target, location);
        Err(ChannelError::Unsupported)
    }

    /// Send one "still processing" liveness ping (e.g. a typing indicator).
    ///
    /// Channels without a liveness concept keep the default no-op; the
    /// watchdog loop treats errors as non-fatal either way.
    async fn send_typing(&self, target: &str) -> Result<(), ChannelError> {
        let _ = target;
        Ok(())
    }

    /// How often the liveness ping must be refreshed to stay visible.
    fn typing_interval(&self) -> Duration {
        DEFAULT_TYPING_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ref_serde_uses_type_tag() {
        let file = FileRef {
            kind: "voice".to_string(),
            blob_path: "u1/telegram/a.ogg".to_string(),
            mime_type: Some("audio/ogg".to_string()),
            caption: None,
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["type"], "voice");
        assert!(json.get("caption").is_none());

        let parsed: FileRef = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn location_roundtrip() {
        let loc = Location {
            latitude: 41.01,
            longitude: 28.97,
            name: Some("Istanbul".to_string()),
        };
        let json = serde_json::to_string(&loc).unwrap();
        let parsed: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, loc);
    }
}
