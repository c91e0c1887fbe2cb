//! Suspended-event side queue.
//!
//! Events for users without active billing access park here instead of the
//! main queue, wrapped in a [`SuspendedEnvelope`] and partitioned by user id
//! so one user's backlog drains as a unit. When access is restored, an admin
//! trigger replays the backlog into the main queue; scheduled envelopes go
//! back through scheduled publish with their original `deliver_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::event::{Event, ScheduledEvent, SuspendedEnvelope};

use super::{BrokerMessage, BrokerTransport, QueueBackend, QueueError};

/// Waits and batch size for the replay drain loop.
#[derive(Debug, Clone)]
pub struct ReplayTuning {
    /// Messages pulled per receive during replay.
    pub batch_size: usize,
    /// Wait for the session lock and for each batch.
    pub wait: Duration,
}

impl Default for ReplayTuning {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(5),
        }
    }
}

pub struct SuspendedQueue {
    transport: Arc<dyn BrokerTransport>,
    queue_name: String,
    main: Arc<dyn QueueBackend>,
    tuning: ReplayTuning,
}

impl SuspendedQueue {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        queue_name: impl Into<String>,
        main: Arc<dyn QueueBackend>,
        tuning: ReplayTuning,
    ) -> Self {
        Self {
            transport,
            queue_name: queue_name.into(),
            main,
            tuning,
        }
    }

    /// Park an event until the user's access is restored.
    pub async fn publish(&self, event: Event) -> Result<(), QueueError> {
        let session_id = event.suspended_session_key();
        let event_id = event.id.clone();
        let envelope = SuspendedEnvelope::Normal { event };
        let message = BrokerMessage {
            body: serde_json::to_value(&envelope)?,
            session_id: Some(session_id.clone()),
            scheduled_enqueue_at: None,
        };
        self.transport.send(&self.queue_name, message).await?;
        info!(event = %event_id, session = %session_id, "event suspended");
        Ok(())
    }

    /// Park a scheduled event, keeping its delivery time for replay.
    ///
    /// The envelope itself rides the broker's delayed enqueue, so it only
    /// becomes part of the replayable backlog at `deliver_at`. Replaying
    /// after that re-applies the (now elapsed) delivery time on the main
    /// queue, which delivers immediately.
    pub async fn publish_scheduled(
        &self,
        event: Event,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let session_id = event.suspended_session_key();
        let event_id = event.id.clone();
        let envelope = SuspendedEnvelope::Schedule(ScheduledEvent { event, deliver_at });
        let message = BrokerMessage {
            body: serde_json::to_value(&envelope)?,
            session_id: Some(session_id.clone()),
            scheduled_enqueue_at: Some(deliver_at),
        };
        self.transport.send(&self.queue_name, message).await?;
        info!(event = %event_id, session = %session_id, deliver_at = %deliver_at, "scheduled event suspended");
        Ok(())
    }

    /// Drain the user's currently available backlog into the main queue.
    ///
    /// Envelopes are acked before re-publish: a failing event is logged and
    /// lost rather than left to wedge the whole backlog. Returns the number
    /// of envelopes consumed.
    pub async fn replay(&self, user_id: &str) -> Result<usize, QueueError> {
        let Some(mut receiver) = self
            .transport
            .accept_session(&self.queue_name, user_id, self.tuning.wait)
            .await?
        else {
            info!(user = %user_id, "suspended session busy, nothing replayed");
            return Ok(0);
        };

        let mut processed = 0usize;
        loop {
            let batch = match receiver.receive(self.tuning.batch_size, self.tuning.wait).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "receive failed during replay, stopping");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            for msg in batch {
                if let Err(e) = receiver.ack(msg.tag).await {
                    warn!(user = %user_id, error = %e, "failed to ack suspended envelope");
                }
                processed += 1;
                match serde_json::from_value::<SuspendedEnvelope>(msg.body) {
                    Ok(SuspendedEnvelope::Normal { event }) => {
                        if let Err(e) = self.main.publish(event).await {
                            error!(user = %user_id, error = %e, "failed to re-publish suspended event");
                        }
                    }
                    Ok(SuspendedEnvelope::Schedule(scheduled)) => {
                        if let Err(e) = self
                            .main
                            .publish_scheduled(scheduled.event, scheduled.deliver_at)
                            .await
                        {
                            error!(user = %user_id, error = %e, "failed to re-schedule suspended event");
                        }
                    }
                    Err(e) => {
                        error!(user = %user_id, error = %e, "malformed suspended envelope, dropped");
                    }
                }
            }
        }

        info!(user = %user_id, processed, "suspended replay finished");
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ConsumerTuning, InMemoryBroker, LocalQueue};
    use futures::StreamExt;

    fn setup() -> (Arc<InMemoryBroker>, Arc<LocalQueue>, SuspendedQueue) {
        let broker = Arc::new(InMemoryBroker::new());
        let main = Arc::new(LocalQueue::new());
        let suspended = SuspendedQueue::new(
            broker.clone(),
            "suspended-events",
            main.clone(),
            ReplayTuning {
                batch_size: 10,
                wait: Duration::from_millis(20),
            },
        );
        (broker, main, suspended)
    }

    #[tokio::test]
    async fn replay_moves_backlog_to_main_queue_in_order() {
        let (_broker, main, suspended) = setup();
        let one = Event::message("telegram", "u1", "one");
        let two = Event::message("whatsapp", "u1", "two");
        suspended.publish(one.clone()).await.unwrap();
        suspended.publish(two.clone()).await.unwrap();
        // Another user's backlog stays put.
        suspended
            .publish(Event::message("telegram", "u2", "other"))
            .await
            .unwrap();

        let replayed = suspended.replay("u1").await.unwrap();
        assert_eq!(replayed, 2);

        // Replay must hand back the events untouched, id and all.
        let mut stream = main.consume();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.events[0], one);
        assert_eq!(second.events[0], two);
    }

    #[tokio::test]
    async fn replay_of_empty_backlog_is_zero() {
        let (_broker, _main, suspended) = setup();
        assert_eq!(suspended.replay("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_is_repeatable_after_drain() {
        let (_broker, _main, suspended) = setup();
        suspended
            .publish(Event::message("telegram", "u1", "once"))
            .await
            .unwrap();
        assert_eq!(suspended.replay("u1").await.unwrap(), 1);
        assert_eq!(suspended.replay("u1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_envelope_stays_invisible_until_due() {
        let (_broker, main, suspended) = setup();
        let deliver_at = Utc::now() + chrono::Duration::seconds(90);
        suspended
            .publish_scheduled(Event::message("scheduled", "u1", "reminder"), deliver_at)
            .await
            .unwrap();

        // Before deliver_at the backlog has nothing to replay.
        assert_eq!(suspended.replay("u1").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(suspended.replay("u1").await.unwrap(), 1);

        // deliver_at already elapsed on the paused clock, but the replayed
        // schedule recomputes its delay from wall time, so give auto-advance
        // room to skip the residual sleep.
        let mut stream = main.consume();
        let unit = tokio::time::timeout(Duration::from_secs(120), stream.next())
            .await
            .expect("due")
            .unwrap();
        assert_eq!(unit.events[0].payload.text.as_deref(), Some("reminder"));
    }

    #[tokio::test]
    async fn malformed_envelope_is_consumed_not_fatal() {
        let (broker, main, suspended) = setup();
        broker
            .send(
                "suspended-events",
                BrokerMessage {
                    body: serde_json::json!({"garbage": true}),
                    session_id: Some("u1".to_string()),
                    scheduled_enqueue_at: None,
                },
            )
            .await
            .unwrap();
        suspended
            .publish(Event::message("telegram", "u1", "good"))
            .await
            .unwrap();

        assert_eq!(suspended.replay("u1").await.unwrap(), 2);
        let mut stream = main.consume();
        let unit = stream.next().await.unwrap();
        assert_eq!(unit.events[0].payload.text.as_deref(), Some("good"));
    }

    #[tokio::test(start_paused = true)]
    async fn main_consumer_sees_replayed_events_grouped() {
        let broker = Arc::new(InMemoryBroker::new());
        let main: Arc<crate::queue::BrokerQueue> = Arc::new(crate::queue::BrokerQueue::new(
            broker.clone(),
            "events",
            ConsumerTuning::default(),
        ));
        let suspended = SuspendedQueue::new(
            broker.clone(),
            "suspended-events",
            main.clone(),
            ReplayTuning {
                batch_size: 10,
                wait: Duration::from_millis(20),
            },
        );
        suspended
            .publish(Event::message("telegram", "u1", "one"))
            .await
            .unwrap();
        suspended
            .publish(Event::message("telegram", "u1", "two"))
            .await
            .unwrap();

        assert_eq!(suspended.replay("u1").await.unwrap(), 2);

        let mut stream = main.consume();
        let unit = stream.next().await.unwrap();
        assert_eq!(unit.session_id, "telegram_u1");
        assert!(unit.is_grouped);
    }
}
