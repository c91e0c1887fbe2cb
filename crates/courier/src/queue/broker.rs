//! Broker-backed queue.
//!
//! [`BrokerQueue`] publishes events to a message broker and runs the
//! session-grouping consumer. The broker itself sits behind the
//! [`BrokerTransport`] trait: session-aware receive, scheduled enqueue, and
//! at-least-once ack/abandon. The bundled [`super::InMemoryBroker`]
//! implements it for dev and tests; production deployments plug in a
//! transport for their broker of choice.
//!
//! Consumer shape: accept the session that has pending messages, wait up to
//! `first_message_wait` for its first message, then keep draining with the
//! short `batch_wait` until the session goes quiet, and yield everything
//! collected as one [`DeliveryUnit`]. Transient receive errors retry after
//! `receive_retry`; connection errors drop the receiver and re-enter the
//! accept loop after `reconnect_delay`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::event::{DeliveryUnit, Event};

use super::{DeliveryStream, QueueBackend, QueueError, grouping_delay};

/// Max messages pulled per receive call while draining a session.
const RECEIVE_BATCH_SIZE: usize = 10;

// ============================================================================
// Transport contract
// ============================================================================

/// A message handed to the transport for enqueueing.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub body: Value,
    /// Partition key. Ignored by transports without session support.
    pub session_id: Option<String>,
    /// When set, the message stays invisible until this instant.
    pub scheduled_enqueue_at: Option<DateTime<Utc>>,
}

/// A message pulled from the broker, awaiting ack or abandon.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Transport-scoped delivery tag for ack/abandon.
    pub tag: u64,
    pub session_id: String,
    pub body: Value,
    pub delivery_count: u32,
}

/// Exclusive receiver over one session's FIFO.
///
/// Dropping the receiver releases the session lock; unacked messages return
/// to the queue (at-least-once).
#[async_trait]
pub trait SessionReceiver: Send {
    fn session_id(&self) -> &str;

    /// Pull up to `max` available messages, waiting at most `wait` for the
    /// first one. An empty vec means the wait elapsed.
    async fn receive(&mut self, max: usize, wait: Duration)
    -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn ack(&mut self, tag: u64) -> Result<(), QueueError>;

    async fn abandon(&mut self, tag: u64) -> Result<(), QueueError>;
}

/// Minimal broker surface the queue layer needs.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Whether session-partitioned receive is available. Checked once at
    /// consumer startup; a `false` here pins the non-session fallback path
    /// for the process lifetime.
    fn supports_sessions(&self) -> bool;

    async fn send(&self, queue: &str, message: BrokerMessage) -> Result<(), QueueError>;

    /// Lock the next session with pending messages, waiting up to `wait`.
    /// `Ok(None)` means nothing became available.
    async fn accept_next_session(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, QueueError>;

    /// Lock one specific session (used by suspended replay).
    async fn accept_session(
        &self,
        queue: &str,
        session_id: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, QueueError>;

    /// Session-less receive for transports without session support.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Ack a message obtained through session-less [`BrokerTransport::receive`].
    async fn ack(&self, queue: &str, tag: u64) -> Result<(), QueueError>;

    async fn abandon(&self, queue: &str, tag: u64) -> Result<(), QueueError>;
}

// ============================================================================
// ConsumerTuning
// ============================================================================

/// Wait and backoff knobs for the consumer loops.
#[derive(Debug, Clone)]
pub struct ConsumerTuning {
    /// Wait for a session's first message before releasing it.
    pub first_message_wait: Duration,
    /// Wait for follow-up messages once a batch has started.
    pub batch_wait: Duration,
    /// Pause after a transient receive error.
    pub receive_retry: Duration,
    /// Pause after a connection error before re-accepting sessions.
    pub reconnect_delay: Duration,
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            first_message_wait: Duration::from_secs(30),
            batch_wait: Duration::from_secs(2),
            receive_retry: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// BrokerQueue
// ============================================================================

pub struct BrokerQueue {
    transport: Arc<dyn BrokerTransport>,
    queue_name: String,
    tuning: ConsumerTuning,
}

impl BrokerQueue {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        queue_name: impl Into<String>,
        tuning: ConsumerTuning,
    ) -> Self {
        Self {
            transport,
            queue_name: queue_name.into(),
            tuning,
        }
    }
}

#[async_trait]
impl QueueBackend for BrokerQueue {
    async fn publish(&self, event: Event) -> Result<(), QueueError> {
        let session_id = event.session_key();
        let event_id = event.id.clone();
        let message = BrokerMessage {
            body: serde_json::to_value(&event)?,
            session_id: Some(session_id.clone()),
            scheduled_enqueue_at: None,
        };
        self.transport.send(&self.queue_name, message).await?;
        info!(event = %event_id, session = %session_id, queue = %self.queue_name, "event published");
        Ok(())
    }

    async fn publish_scheduled(
        &self,
        event: Event,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let session_id = event.session_key();
        let event_id = event.id.clone();
        let message = BrokerMessage {
            body: serde_json::to_value(&event)?,
            session_id: Some(session_id.clone()),
            scheduled_enqueue_at: Some(deliver_at),
        };
        self.transport.send(&self.queue_name, message).await?;
        info!(event = %event_id, session = %session_id, deliver_at = %deliver_at, "event scheduled");
        Ok(())
    }

    fn consume(&self) -> DeliveryStream {
        let (tx, rx) = mpsc::channel(8);
        let transport = self.transport.clone();
        let queue = self.queue_name.clone();
        let tuning = self.tuning.clone();
        tokio::spawn(async move {
            if transport.supports_sessions() {
                run_session_consumer(transport, queue, tuning, tx).await;
            } else {
                warn!(queue = %queue, "broker has no session support, using non-grouped consumption");
                run_fallback_consumer(transport, queue, tuning, tx).await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }
}

// ============================================================================
// Session consumer
// ============================================================================

/// The downstream stream was dropped; the consumer task exits.
struct ConsumerStopped;

enum DrainOutcome {
    /// Session went quiet; accept the next one.
    SessionDone,
    /// Connection-level failure; pause and rebuild from the accept loop.
    Reconnect,
}

async fn run_session_consumer(
    transport: Arc<dyn BrokerTransport>,
    queue: String,
    tuning: ConsumerTuning,
    tx: mpsc::Sender<DeliveryUnit>,
) {
    info!(queue = %queue, "session consumer started");
    loop {
        let receiver = match transport
            .accept_next_session(&queue, tuning.first_message_wait)
            .await
        {
            Ok(Some(receiver)) => receiver,
            Ok(None) => continue,
            Err(e) => {
                let pause = if e.is_connection() {
                    tuning.reconnect_delay
                } else {
                    tuning.receive_retry
                };
                error!(queue = %queue, error = %e, "failed to accept session, backing off");
                tokio::time::sleep(pause).await;
                continue;
            }
        };

        match drain_session(receiver, &tuning, &tx).await {
            Ok(DrainOutcome::SessionDone) => {}
            Ok(DrainOutcome::Reconnect) => {
                tokio::time::sleep(tuning.reconnect_delay).await;
            }
            Err(ConsumerStopped) => {
                info!(queue = %queue, "session consumer stopped");
                return;
            }
        }
    }
}

/// Collect one delivery unit from a locked session.
///
/// Messages are acked as they are consumed; a malformed body is acked and
/// dropped with an error log so it cannot wedge the session.
async fn drain_session(
    mut receiver: Box<dyn SessionReceiver>,
    tuning: &ConsumerTuning,
    tx: &mpsc::Sender<DeliveryUnit>,
) -> Result<DrainOutcome, ConsumerStopped> {
    let session_id = receiver.session_id().to_string();
    let mut events: Vec<Event> = Vec::new();
    let mut outcome = DrainOutcome::SessionDone;

    loop {
        let wait = if events.is_empty() {
            tuning.first_message_wait
        } else {
            tuning.batch_wait
        };
        match receiver.receive(RECEIVE_BATCH_SIZE, wait).await {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => {
                for msg in batch {
                    if let Err(e) = receiver.ack(msg.tag).await {
                        warn!(session = %session_id, error = %e, "failed to ack message");
                    }
                    match serde_json::from_value::<Event>(msg.body) {
                        Ok(event) => events.push(event),
                        Err(e) => {
                            error!(session = %session_id, error = %e, "dropping malformed event body");
                        }
                    }
                }
            }
            Err(e) if e.is_connection() => {
                error!(session = %session_id, error = %e, "connection lost while draining session");
                outcome = DrainOutcome::Reconnect;
                break;
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "transient receive error, retrying");
                tokio::time::sleep(tuning.receive_retry).await;
            }
        }
    }

    if !events.is_empty() {
        debug!(session = %session_id, events = events.len(), "session drained");
        let unit = DeliveryUnit::new(session_id, events);
        tx.send(unit).await.map_err(|_| ConsumerStopped)?;
    }
    Ok(outcome)
}

// ============================================================================
// Non-session fallback consumer
// ============================================================================

/// Per-message consumption for transports without sessions, with a small
/// adaptive coalescing window (see [`grouping_delay`]) so same-conversation
/// bursts still arrive as one unit.
async fn run_fallback_consumer(
    transport: Arc<dyn BrokerTransport>,
    queue: String,
    tuning: ConsumerTuning,
    tx: mpsc::Sender<DeliveryUnit>,
) {
    // An event that arrived inside the window but belongs to another
    // conversation; it seeds the next batch.
    let mut carry: Option<Event> = None;

    loop {
        let first = match carry.take() {
            Some(event) => event,
            None => match receive_one(&transport, &queue, tuning.first_message_wait).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    let pause = if e.is_connection() {
                        tuning.reconnect_delay
                    } else {
                        tuning.receive_retry
                    };
                    error!(queue = %queue, error = %e, "fallback receive failed, backing off");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            },
        };

        let session_id = first.session_key();
        let mut events = vec![first];
        let window_start = Instant::now();

        loop {
            let deadline = window_start + grouping_delay(&events);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match receive_one(&transport, &queue, remaining).await {
                Ok(Some(event)) if event.session_key() == session_id => events.push(event),
                Ok(Some(event)) => {
                    carry = Some(event);
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "receive error inside coalescing window");
                    break;
                }
            }
        }

        let unit = DeliveryUnit::new(session_id, events);
        if tx.send(unit).await.is_err() {
            info!(queue = %queue, "fallback consumer stopped");
            return;
        }
    }
}

/// Receive and ack a single event, or `None` if the wait elapsed.
async fn receive_one(
    transport: &Arc<dyn BrokerTransport>,
    queue: &str,
    wait: Duration,
) -> Result<Option<Event>, QueueError> {
    let mut batch = transport.receive(queue, 1, wait).await?;
    let Some(msg) = batch.pop() else {
        return Ok(None);
    };
    if let Err(e) = transport.ack(queue, msg.tag).await {
        warn!(queue = %queue, error = %e, "failed to ack message");
    }
    match serde_json::from_value::<Event>(msg.body) {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            error!(queue = %queue, error = %e, "dropping malformed event body");
            Ok(None)
        }
    }
}
