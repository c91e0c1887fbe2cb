//! Egress routing.
//!
//! Decides which channel a finished response goes out on and which
//! platform-level target it addresses, then hands off to the registered
//! [`ChannelSender`]. Routing never fails the pipeline: an unroutable
//! response is logged and dropped, the worker moves on.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};

use courier_channel_protocol::ChannelSender;

use crate::event::{Event, ProcessResult};

/// Channels a response can legitimately leave on. A destination outside this
/// set (e.g. "scheduled", "triggered", an internal tag) is not addressable.
pub const LIVE_CHANNELS: [&str; 4] = ["email", "websocket", "telegram", "whatsapp"];

// ============================================================================
// ChannelRegistry
// ============================================================================

/// Registered channel senders, keyed by lowercase channel name.
#[derive(Default)]
pub struct ChannelRegistry {
    senders: DashMap<String, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn register(&self, sender: Arc<dyn ChannelSender>) {
        let name = sender.name().to_lowercase();
        info!(channel = %name, "channel registered");
        self.senders.insert(name, sender);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelSender>> {
        self.senders
            .get(&name.to_lowercase())
            .map(|entry| entry.value().clone())
    }
}

// ============================================================================
// Routing decisions
// ============================================================================

/// Destination channel for an event's response.
///
/// `output_type` wins over `source`, except for schedule-born events:
/// responses to `scheduled`/`recurring` jobs go back to the conversation
/// the schedule was created from (`metadata.original_source`) whenever that
/// hint exists, since their `output_type` reflects where the job was set up,
/// not where the user is reachable.
pub fn resolve_destination(event: &Event) -> String {
    let mut destination = event
        .output_type
        .clone()
        .unwrap_or_else(|| event.source.clone())
        .to_lowercase();

    if matches!(event.source.as_str(), "scheduled" | "recurring") {
        if let Some(original) = event.metadata_hint("original_source") {
            info!(event = %event.id, from = %destination, to = %original, "redirecting scheduled response to originating channel");
            destination = original.to_lowercase();
        }
    }
    destination
}

/// Platform-level recipient for a response: explicit metadata hints first,
/// then the user id as the channel-native fallback.
pub fn resolve_target(event: &Event) -> Option<String> {
    event
        .metadata_hint("output_chat_id")
        .or_else(|| event.metadata_hint("output_phone_number"))
        .or_else(|| event.metadata_hint("token"))
        .or_else(|| event.user_id.clone())
}

// ============================================================================
// EgressRouter
// ============================================================================

pub struct EgressRouter {
    channels: Arc<ChannelRegistry>,
}

impl EgressRouter {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Self { channels }
    }

    /// Deliver a processing result back to the user.
    ///
    /// Location interactions take precedence over plain text: a pending
    /// location request sends the prompt (falling back to text on channels
    /// without location support), an outgoing location sends text first and
    /// the pin after.
    pub async fn send_response(&self, event: &Event, result: &ProcessResult) {
        let destination = resolve_destination(event);
        let Some(sender) = self.channels.get(&destination) else {
            warn!(event = %event.id, destination = %destination, source = %event.source, "no channel for destination, dropping response");
            return;
        };
        let Some(target) = resolve_target(event) else {
            error!(event = %event.id, destination = %destination, "no recipient resolvable, dropping response");
            return;
        };

        if let Some(request) = &event.request_location {
            match sender.send_location_request(&target, &request.prompt).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(event = %event.id, destination = %destination, error = %e, "location request failed, sending as text");
                }
            }
        } else if let Some(location) = &event.send_location {
            if !result.response.is_empty() {
                if let Err(e) = sender.send(&target, &result.response, &result.file_links).await {
                    error!(event = %event.id, destination = %destination, error = %e, "failed to send response text");
                }
            }
            if let Err(e) = sender.send_location(&target, location).await {
                error!(event = %event.id, destination = %destination, error = %e, "failed to send location");
            }
            return;
        }

        if let Err(e) = sender.send(&target, &result.response, &result.file_links).await {
            error!(event = %event.id, destination = %destination, error = %e, "failed to send response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_channel_protocol::{ChannelError, FileRef, Location};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(String, String),
        LocationRequest(String, String),
        Location(String),
    }

    struct RecordingSender {
        name: &'static str,
        sent: Mutex<Vec<Sent>>,
        locations_supported: bool,
    }

    impl RecordingSender {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                sent: Mutex::new(Vec::new()),
                locations_supported: true,
            })
        }

        fn without_locations(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                sent: Mutex::new(Vec::new()),
                locations_supported: false,
            })
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(
            &self,
            target: &str,
            text: &str,
            _files: &[FileRef],
        ) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Text(target.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_location_request(
            &self,
            target: &str,
            prompt: &str,
        ) -> Result<(), ChannelError> {
            if !self.locations_supported {
                return Err(ChannelError::Unsupported);
            }
            self.sent
                .lock()
                .unwrap()
                .push(Sent::LocationRequest(target.to_string(), prompt.to_string()));
            Ok(())
        }

        async fn send_location(
            &self,
            target: &str,
            _location: &Location,
        ) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Location(target.to_string()));
            Ok(())
        }
    }

    fn router_with(senders: &[Arc<RecordingSender>]) -> EgressRouter {
        let registry = Arc::new(ChannelRegistry::default());
        for sender in senders {
            registry.register(sender.clone());
        }
        EgressRouter::new(registry)
    }

    #[tokio::test]
    async fn routes_to_source_channel_by_default() {
        let telegram = RecordingSender::new("telegram");
        let router = router_with(&[telegram.clone()]);
        let mut event = Event::message("telegram", "u1", "hi");
        event
            .metadata
            .insert("output_chat_id".to_string(), Value::from(42));

        router.send_response(&event, &ProcessResult::text("hello")).await;
        assert_eq!(
            telegram.sent(),
            [Sent::Text("42".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn output_type_overrides_source() {
        let email = RecordingSender::new("email");
        let router = router_with(&[email.clone()]);
        let mut event = Event::message("telegram", "u1", "hi");
        event.output_type = Some("Email".to_string());

        router.send_response(&event, &ProcessResult::text("report")).await;
        assert_eq!(
            email.sent(),
            [Sent::Text("u1".to_string(), "report".to_string())]
        );
    }

    #[tokio::test]
    async fn scheduled_event_redirects_to_original_source() {
        let whatsapp = RecordingSender::new("whatsapp");
        let router = router_with(&[whatsapp.clone()]);
        let mut event = Event::message("scheduled", "u1", "reminder body");
        event.metadata.insert(
            "original_source".to_string(),
            Value::String("whatsapp".to_string()),
        );
        event.metadata.insert(
            "output_phone_number".to_string(),
            Value::String("+490001".to_string()),
        );

        router.send_response(&event, &ProcessResult::text("time!")).await;
        assert_eq!(
            whatsapp.sent(),
            [Sent::Text("+490001".to_string(), "time!".to_string())]
        );
    }

    #[test]
    fn original_source_beats_output_type_for_recurring_jobs() {
        let mut event = Event::message("recurring", "u1", "digest");
        event.output_type = Some("websocket".to_string());
        event.metadata.insert(
            "original_source".to_string(),
            Value::String("telegram".to_string()),
        );
        assert_eq!(resolve_destination(&event), "telegram");

        // Ordinary events keep their explicit output_type.
        let mut direct = Event::message("telegram", "u1", "hi");
        direct.output_type = Some("websocket".to_string());
        direct.metadata.insert(
            "original_source".to_string(),
            Value::String("telegram".to_string()),
        );
        assert_eq!(resolve_destination(&direct), "websocket");
    }

    #[tokio::test]
    async fn unknown_destination_drops_silently() {
        let telegram = RecordingSender::new("telegram");
        let router = router_with(&[telegram.clone()]);
        // No original_source hint: destination stays "scheduled", which no
        // channel serves.
        let event = Event::message("scheduled", "u1", "orphan");

        router.send_response(&event, &ProcessResult::text("lost")).await;
        assert!(telegram.sent().is_empty());
    }

    #[tokio::test]
    async fn location_request_takes_precedence() {
        let telegram = RecordingSender::new("telegram");
        let router = router_with(&[telegram.clone()]);
        let mut event = Event::message("telegram", "u1", "where");
        event.request_location = Some(crate::event::LocationRequest {
            prompt: "Share your location".to_string(),
        });

        router.send_response(&event, &ProcessResult::text("ignored")).await;
        assert_eq!(
            telegram.sent(),
            [Sent::LocationRequest(
                "u1".to_string(),
                "Share your location".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn unsupported_location_request_falls_back_to_text() {
        let email = RecordingSender::without_locations("email");
        let router = router_with(&[email.clone()]);
        let mut event = Event::message("email", "u1", "where");
        event.request_location = Some(crate::event::LocationRequest {
            prompt: "Share your location".to_string(),
        });

        router
            .send_response(&event, &ProcessResult::text("please reply with an address"))
            .await;
        assert_eq!(
            email.sent(),
            [Sent::Text(
                "u1".to_string(),
                "please reply with an address".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn send_location_sends_text_then_pin() {
        let telegram = RecordingSender::new("telegram");
        let router = router_with(&[telegram.clone()]);
        let mut event = Event::message("telegram", "u1", "meet");
        event.send_location = Some(Location {
            latitude: 52.52,
            longitude: 13.40,
            name: Some("Berlin".to_string()),
        });

        router.send_response(&event, &ProcessResult::text("see you here")).await;
        assert_eq!(
            telegram.sent(),
            [
                Sent::Text("u1".to_string(), "see you here".to_string()),
                Sent::Location("u1".to_string()),
            ]
        );
    }

    #[test]
    fn target_resolution_precedence() {
        let mut event = Event::message("whatsapp", "u1", "hi");
        assert_eq!(resolve_target(&event).as_deref(), Some("u1"));
        event.metadata.insert(
            "output_phone_number".to_string(),
            Value::String("+49123".to_string()),
        );
        assert_eq!(resolve_target(&event).as_deref(), Some("+49123"));
        event
            .metadata
            .insert("output_chat_id".to_string(), Value::from(7));
        assert_eq!(resolve_target(&event).as_deref(), Some("7"));
    }

    #[test]
    fn no_recipient_resolves_to_none() {
        let event = Event::new("websocket");
        assert_eq!(resolve_target(&event), None);
    }
}
