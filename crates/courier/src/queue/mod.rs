//! Queue backends.
//!
//! Everything upstream publishes through the [`QueueBackend`] trait; the
//! concrete backend is chosen once at startup from config and never swapped
//! at runtime. [`LocalQueue`] is the zero-infrastructure dev backend,
//! [`BrokerQueue`] drives a session-capable message broker through the
//! [`BrokerTransport`] seam.

pub mod broker;
pub mod local;
pub mod memory;
pub mod suspended;

pub use broker::{
    BrokerMessage, BrokerQueue, BrokerTransport, ConsumerTuning, ReceivedMessage, SessionReceiver,
};
pub use local::LocalQueue;
pub use memory::InMemoryBroker;
pub use suspended::{ReplayTuning, SuspendedQueue};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::config::QueueSettings;
use crate::event::{DeliveryUnit, Event};

/// Stream of delivery units produced by a backend's consumer.
pub type DeliveryStream = BoxStream<'static, DeliveryUnit>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Retryable broker hiccup (lock lost, receive fault).
    #[error("transient queue error: {0}")]
    Transient(String),

    /// Broker link is down; callers back off and reconnect.
    #[error("queue connection error: {0}")]
    Connection(String),

    /// Backend shut down; no further publishes possible.
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    pub fn is_connection(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

// ============================================================================
// QueueBackend
// ============================================================================

/// Strategy interface over the event queue.
///
/// Publish failures propagate to the caller so ingestion can report them;
/// consume-side failures are handled inside the stream (log, back off,
/// resume) and never tear the stream down.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue an event for immediate delivery.
    async fn publish(&self, event: Event) -> Result<(), QueueError>;

    /// Enqueue an event that stays invisible until `deliver_at`.
    async fn publish_scheduled(
        &self,
        event: Event,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Open the consume stream. Intended to be called once per process.
    fn consume(&self) -> DeliveryStream;
}

// ============================================================================
// QueueMode & factory
// ============================================================================

/// Which backend the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Local,
    Broker,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Local => f.write_str("local"),
            QueueMode::Broker => f.write_str("broker"),
        }
    }
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(QueueMode::Local),
            "broker" => Ok(QueueMode::Broker),
            other => Err(format!("unknown queue mode '{other}' (expected local or broker)")),
        }
    }
}

/// Build the main-queue backend for the configured mode.
///
/// Broker mode drives whatever [`BrokerTransport`] the caller supplies; the
/// bundled [`InMemoryBroker`] keeps broker semantics (sessions, scheduling,
/// at-least-once) without external infrastructure.
pub fn build_backend(
    settings: &QueueSettings,
    transport: Arc<dyn BrokerTransport>,
) -> Arc<dyn QueueBackend> {
    match settings.mode {
        QueueMode::Local => Arc::new(LocalQueue::new()),
        QueueMode::Broker => Arc::new(BrokerQueue::new(
            transport,
            settings.queue_name.clone(),
            settings.consumer.tuning(),
        )),
    }
}

// ============================================================================
// Grouping delay
// ============================================================================

const GROUPING_DELAY_BASE: Duration = Duration::from_millis(100);
const GROUPING_DELAY_CEILING: Duration = Duration::from_millis(500);
const FORWARDED_BONUS: Duration = Duration::from_millis(200);
const FILES_BONUS: Duration = Duration::from_millis(100);
const PER_EVENT_BONUS: Duration = Duration::from_millis(20);
const BURST_BONUS_CAP: Duration = Duration::from_millis(100);

/// Coalescing window for the non-session consumer path.
///
/// Grows with signals that more of the burst is still in flight: a forwarded
/// message usually precedes commentary, attachments arrive split from their
/// captions, and a burst already underway tends to continue. Always within
/// [100, 500] ms so latency stays bounded.
pub fn grouping_delay(batch: &[Event]) -> Duration {
    let mut delay = GROUPING_DELAY_BASE;
    if batch.last().is_some_and(Event::is_forwarded) {
        delay += FORWARDED_BONUS;
    }
    if batch.iter().any(Event::has_files) {
        delay += FILES_BONUS;
    }
    if batch.len() > 1 {
        delay += BURST_BONUS_CAP.min(PER_EVENT_BONUS * batch.len() as u32);
    }
    delay.min(GROUPING_DELAY_CEILING)
}
