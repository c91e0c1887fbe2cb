//! In-process queue for local development.
//!
//! Single producer set, single consumer, no persistence, no grouping: every
//! event becomes its own delivery unit in publish order. Scheduled events
//! ride a timer task and join the same channel when due.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};

use crate::event::{DeliveryUnit, Event};

use super::{DeliveryStream, QueueBackend, QueueError};

pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Event>,
    // Taken by the first consume() call.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for LocalQueue {
    async fn publish(&self, event: Event) -> Result<(), QueueError> {
        debug!(event = %event.id, session = %event.session_key(), "enqueued local event");
        self.tx.send(event).map_err(|_| QueueError::Closed)
    }

    async fn publish_scheduled(
        &self,
        event: Event,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let delay = (deliver_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        debug!(event = %event.id, deliver_at = %deliver_at, "scheduled local event");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(event).is_err() {
                warn!("queue closed before scheduled event became due, dropping");
            }
        });
        Ok(())
    }

    fn consume(&self) -> DeliveryStream {
        let rx = self
            .rx
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or(None);
        match rx {
            Some(rx) => UnboundedReceiverStream::new(rx)
                .map(DeliveryUnit::single)
                .boxed(),
            None => {
                error!("local queue consumed twice, returning empty stream");
                futures::stream::empty().boxed()
            }
        }
    }
}
