//! Publish façade with entitlement gating.
//!
//! Every ingestion path publishes through [`EventPublisher`]; it decides per
//! event whether the user may consume processing resources. Gated events go
//! to the suspended side queue instead of the main queue, transparently to
//! the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::event::Event;
use crate::queue::{QueueBackend, QueueError, SuspendedQueue};

/// Billing/entitlement lookup seam.
///
/// Implementations are expected to answer from a local cache; the publish
/// path sits on the hot ingestion path. A lookup failure should be reported
/// as `true` (deliver rather than silently park).
#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    async fn has_active_access(&self, user_id: &str) -> bool;
}

/// Grants everyone access. Default for local deployments without billing.
pub struct AllowAll;

#[async_trait]
impl EntitlementChecker for AllowAll {
    async fn has_active_access(&self, _user_id: &str) -> bool {
        true
    }
}

pub struct EventPublisher {
    main: Arc<dyn QueueBackend>,
    suspended: Arc<SuspendedQueue>,
    entitlement: Arc<dyn EntitlementChecker>,
}

impl EventPublisher {
    pub fn new(
        main: Arc<dyn QueueBackend>,
        suspended: Arc<SuspendedQueue>,
        entitlement: Arc<dyn EntitlementChecker>,
    ) -> Self {
        Self {
            main,
            suspended,
            entitlement,
        }
    }

    /// Publish for immediate delivery, or park if the user is gated.
    pub async fn publish(&self, event: Event) -> Result<(), QueueError> {
        if self.is_gated(&event).await {
            info!(user = ?event.user_id, source = %event.source, "user lacks active access, suspending event");
            self.suspended.publish(event).await
        } else {
            self.main.publish(event).await
        }
    }

    /// Publish with a delivery time, or park if the user is gated. Parked
    /// scheduled events keep their `deliver_at` for replay.
    pub async fn publish_scheduled(
        &self,
        event: Event,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if self.is_gated(&event).await {
            info!(user = ?event.user_id, source = %event.source, "user lacks active access, suspending scheduled event");
            self.suspended.publish_scheduled(event, deliver_at).await
        } else {
            self.main.publish_scheduled(event, deliver_at).await
        }
    }

    // System events (no user) are never gated.
    async fn is_gated(&self, event: &Event) -> bool {
        match &event.user_id {
            Some(user_id) => !self.entitlement.has_active_access(user_id).await,
            None => false,
        }
    }
}
