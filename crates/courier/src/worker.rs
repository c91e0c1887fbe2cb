//! Execution worker.
//!
//! Drains the consume stream: for each delivery unit, start the typing
//! watchdog for the originating conversation, run the processing layer, stop
//! the watchdog, and route the result through egress. A failing unit is
//! logged and skipped; the loop itself only ends when the stream does.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{error, info, warn};

use crate::egress::{EgressRouter, LIVE_CHANNELS, resolve_target};
use crate::event::{DeliveryUnit, Event, ProcessResult};
use crate::queue::QueueBackend;
use crate::watchdog::{WatchdogHandle, WatchdogRegistry};

/// The processing layer (agent runtime, workflow engine, ...) a deployment
/// plugs in behind the pipeline.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, unit: &DeliveryUnit) -> anyhow::Result<ProcessResult>;
}

/// Echoes the combined text back. Stand-in processor for local runs with no
/// runtime attached.
pub struct EchoProcessor;

#[async_trait]
impl Processor for EchoProcessor {
    async fn process(&self, unit: &DeliveryUnit) -> anyhow::Result<ProcessResult> {
        let text = unit
            .events
            .iter()
            .filter_map(|event| event.payload.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ProcessResult::text(text))
    }
}

pub struct ExecutionWorker {
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn Processor>,
    egress: Arc<EgressRouter>,
    watchdogs: Arc<WatchdogRegistry>,
}

impl ExecutionWorker {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        processor: Arc<dyn Processor>,
        egress: Arc<EgressRouter>,
        watchdogs: Arc<WatchdogRegistry>,
    ) -> Self {
        Self {
            backend,
            processor,
            egress,
            watchdogs,
        }
    }

    pub async fn run(&self) {
        info!("execution worker started");
        let mut stream = self.backend.consume();
        while let Some(unit) = stream.next().await {
            if unit.events.is_empty() {
                continue;
            }
            info!(
                session = %unit.session_id,
                events = unit.events.len(),
                grouped = unit.is_grouped,
                "processing delivery unit"
            );
            self.handle_unit(unit).await;
        }
        warn!("event stream ended, execution worker stopping");
    }

    async fn handle_unit(&self, unit: DeliveryUnit) {
        // Routing context comes from the first event; later events in a
        // group are follow-ups within the same conversation.
        let lead = unit.events[0].clone();
        let watchdog = self.start_watchdog(&lead).await;

        let result = self.processor.process(&unit).await;

        // Stop before egress so the indicator never outlives processing.
        if let Some(handle) = watchdog {
            self.watchdogs.stop(handle).await;
        }

        match result {
            Ok(result) => self.egress.send_response(&lead, &result).await,
            Err(e) => {
                error!(session = %unit.session_id, error = %e, "processing failed, unit skipped");
            }
        }
    }

    async fn start_watchdog(&self, event: &Event) -> Option<WatchdogHandle> {
        let user_id = event.user_id.as_deref()?;
        let platform = event
            .output_type
            .as_deref()
            .unwrap_or(&event.source)
            .to_lowercase();
        if !LIVE_CHANNELS.contains(&platform.as_str()) {
            return None;
        }
        let destination = resolve_target(event)?;
        self.watchdogs.start(&platform, &destination, user_id).await
    }
}
