//! Typing-indicator watchdogs.
//!
//! While a conversation's events are being processed, a watchdog task keeps
//! the channel's "still working" indicator alive by pinging on the channel's
//! refresh interval. One task per conversation key; starting a new watchdog
//! for a key replaces (and fully stops) the previous one, so indicators
//! never double up. Every task is bounded by an iteration budget in case a
//! stop is lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use courier_channel_protocol::ChannelSender;

use crate::egress::ChannelRegistry;

/// Iteration and shutdown bounds for watchdog tasks.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Pings sent before a task gives up on its own.
    pub max_iterations: u32,
    /// How long `stop`/replacement waits for the task to exit before
    /// aborting it.
    pub stop_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Identifies one started watchdog. Stopping with a stale handle (already
/// replaced or finished) is a no-op.
#[derive(Debug)]
pub struct WatchdogHandle {
    key: String,
    id: u64,
}

struct WatchdogEntry {
    id: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

pub struct WatchdogRegistry {
    channels: Arc<ChannelRegistry>,
    entries: Arc<DashMap<String, WatchdogEntry>>,
    config: WatchdogConfig,
    next_id: AtomicU64,
}

impl WatchdogRegistry {
    pub fn new(channels: Arc<ChannelRegistry>, config: WatchdogConfig) -> Self {
        Self {
            channels,
            entries: Arc::new(DashMap::new()),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start (or restart) the watchdog for a conversation.
    ///
    /// Returns `None` when no channel is registered for the platform; the
    /// caller proceeds without an indicator.
    pub async fn start(
        &self,
        platform: &str,
        destination: &str,
        user_id: &str,
    ) -> Option<WatchdogHandle> {
        let Some(sender) = self.channels.get(platform) else {
            debug!(platform = %platform, "no channel for platform, skipping watchdog");
            return None;
        };
        let key = format!("{platform}:{destination}:{user_id}");

        // The old task must be fully gone before the replacement pings, or
        // the platform sees interleaved indicators.
        if let Some((_, mut old)) = self.entries.remove(&key) {
            stop_entry(&key, &mut old, self.config.stop_grace).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let entries = self.entries.clone();
        let task_key = key.clone();
        let target = destination.to_string();
        let max_iterations = self.config.max_iterations;
        let join = tokio::spawn(async move {
            run_watchdog(sender, &target, max_iterations, cancel_rx, &task_key).await;
            // Only clear the map if the entry is still ours.
            entries.remove_if(&task_key, |_, entry| entry.id == id);
        });

        // A concurrent start can slip its entry in between the remove above
        // and this insert; stop whatever we displace instead of leaving its
        // task to the iteration budget.
        if let Some(mut displaced) = self.entries.insert(
            key.clone(),
            WatchdogEntry {
                id,
                cancel_tx: Some(cancel_tx),
                join: Some(join),
            },
        ) {
            stop_entry(&key, &mut displaced, self.config.stop_grace).await;
        }
        Some(WatchdogHandle { key, id })
    }

    /// Stop the watchdog this handle refers to. Idempotent; a handle made
    /// stale by a replacement leaves the replacement running.
    pub async fn stop(&self, handle: WatchdogHandle) {
        let Some((_, mut entry)) = self
            .entries
            .remove_if(&handle.key, |_, entry| entry.id == handle.id)
        else {
            return;
        };
        stop_entry(&handle.key, &mut entry, self.config.stop_grace).await;
    }

    /// Whether the task behind this handle is still alive.
    pub fn is_running(&self, handle: &WatchdogHandle) -> bool {
        self.entries.get(&handle.key).is_some_and(|entry| {
            entry.id == handle.id
                && entry
                    .join
                    .as_ref()
                    .is_some_and(|join| !join.is_finished())
        })
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}

async fn stop_entry(key: &str, entry: &mut WatchdogEntry, grace: Duration) {
    if let Some(cancel_tx) = entry.cancel_tx.take() {
        let _ = cancel_tx.send(());
    }
    if let Some(mut join) = entry.join.take() {
        if tokio::time::timeout(grace, &mut join).await.is_err() {
            warn!(watchdog = %key, "watchdog ignored cancel, aborting");
            join.abort();
        }
    }
}

async fn run_watchdog(
    sender: Arc<dyn ChannelSender>,
    target: &str,
    max_iterations: u32,
    mut cancel_rx: oneshot::Receiver<()>,
    key: &str,
) {
    let interval = sender.typing_interval();
    debug!(watchdog = %key, interval_ms = interval.as_millis() as u64, "watchdog started");
    for iteration in 0..max_iterations {
        // Ping failures are non-fatal; the indicator just flickers.
        if let Err(e) = sender.send_typing(target).await {
            warn!(watchdog = %key, iteration, error = %e, "typing ping failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut cancel_rx => {
                debug!(watchdog = %key, "watchdog cancelled");
                return;
            }
        }
    }
    debug!(watchdog = %key, "watchdog iteration budget exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_channel_protocol::{ChannelError, FileRef};
    use std::sync::atomic::AtomicUsize;

    struct PingCounter {
        name: &'static str,
        pings: AtomicUsize,
        interval: Duration,
    }

    impl PingCounter {
        fn new(interval: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: "telegram",
                pings: AtomicUsize::new(0),
                interval,
            })
        }

        fn pings(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelSender for PingCounter {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _: &str, _: &str, _: &[FileRef]) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_typing(&self, _target: &str) -> Result<(), ChannelError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn typing_interval(&self) -> Duration {
            self.interval
        }
    }

    fn registry(sender: Arc<PingCounter>) -> WatchdogRegistry {
        let channels = Arc::new(ChannelRegistry::default());
        channels.register(sender);
        WatchdogRegistry::new(channels, WatchdogConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_the_channel_interval_until_stopped() {
        let sender = PingCounter::new(Duration::from_secs(4));
        let registry = registry(sender.clone());

        let handle = registry.start("telegram", "chat1", "u1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        // Pings at t=0, 4, 8.
        assert_eq!(sender.pings(), 3);
        assert!(registry.is_running(&handle));

        registry.stop(handle).await;
        assert_eq!(registry.active_count(), 0);
        let before = sender.pings();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sender.pings(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_previous_task() {
        let sender = PingCounter::new(Duration::from_secs(4));
        let registry = registry(sender.clone());

        let first = registry.start("telegram", "chat1", "u1").await.unwrap();
        let second = registry.start("telegram", "chat1", "u1").await.unwrap();
        assert!(!registry.is_running(&first));
        assert!(registry.is_running(&second));
        assert_eq!(registry.active_count(), 1);

        // A stale handle must not kill the replacement.
        registry.stop(first).await;
        assert!(registry.is_running(&second));
        registry.stop(second).await;
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_starts_leave_a_single_task() {
        let sender = PingCounter::new(Duration::from_secs(4));
        let registry = registry(sender.clone());

        let starts = (0..5).map(|_| registry.start("telegram", "chat1", "u1"));
        let handles: Vec<_> = futures::future::join_all(starts).await;
        assert_eq!(registry.active_count(), 1);

        // Only the survivor pings; a leaked task would double the cadence.
        let before = sender.pings();
        tokio::time::sleep(Duration::from_secs(9)).await;
        let delta = sender.pings() - before;
        assert!((1..=3).contains(&delta), "pings in window: {delta}");

        for handle in handles.into_iter().flatten() {
            registry.stop(handle).await;
        }
        assert_eq!(registry.active_count(), 0);
        let after = sender.pings();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sender.pings(), after);
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_budget_bounds_a_lost_stop() {
        let sender = PingCounter::new(Duration::from_secs(1));
        let registry = registry(sender.clone());

        let handle = registry.start("telegram", "chat1", "u1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sender.pings(), 30);
        assert!(!registry.is_running(&handle));
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn unknown_platform_yields_no_handle() {
        let registry = WatchdogRegistry::new(
            Arc::new(ChannelRegistry::default()),
            WatchdogConfig::default(),
        );
        assert!(registry.start("telegram", "chat1", "u1").await.is_none());
    }
}
