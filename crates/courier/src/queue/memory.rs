//! In-memory [`BrokerTransport`] implementation.
//!
//! Full broker semantics without external infrastructure: session-partitioned
//! FIFOs, exclusive session locks, scheduled enqueue, and at-least-once
//! delivery (unacked messages return to their session when the receiver is
//! dropped). Used for dev deployments and as the test double for every
//! consumer-side code path.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BrokerMessage, BrokerTransport, QueueError, ReceivedMessage, SessionReceiver};

pub struct InMemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    sessions_enabled: bool,
}

struct QueueState {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    sessions: BTreeMap<String, VecDeque<StoredMessage>>,
    locked: HashSet<String>,
    in_flight: HashMap<u64, StoredMessage>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    session_id: String,
    body: Value,
    delivery_count: u32,
}

impl QueueState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    // Never held across an await.
    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, session_id: String, body: Value) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .sessions
            .entry(session_id.clone())
            .or_default()
            .push_back(StoredMessage {
                seq,
                session_id,
                body,
                delivery_count: 0,
            });
        drop(inner);
        self.notify.notify_one();
    }
}

impl QueueInner {
    /// Put an in-flight message back into its session, seq order preserved.
    fn requeue(&mut self, msg: StoredMessage) {
        let queue = self.sessions.entry(msg.session_id.clone()).or_default();
        let pos = queue
            .iter()
            .position(|m| m.seq > msg.seq)
            .unwrap_or(queue.len());
        queue.insert(pos, msg);
    }

    fn take_front(&mut self, session_id: &str, max: usize) -> Vec<ReceivedMessage> {
        let mut out = Vec::new();
        if let Some(queue) = self.sessions.get_mut(session_id) {
            while out.len() < max {
                let Some(mut msg) = queue.pop_front() else { break };
                msg.delivery_count += 1;
                out.push(ReceivedMessage {
                    tag: msg.seq,
                    session_id: msg.session_id.clone(),
                    body: msg.body.clone(),
                    delivery_count: msg.delivery_count,
                });
                self.in_flight.insert(msg.seq, msg);
            }
        }
        out
    }

    /// Session-less pop: lowest sequence number across all partitions.
    fn take_global(&mut self, max: usize) -> Vec<ReceivedMessage> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(session_id) = self
                .sessions
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .min_by_key(|(_, q)| q[0].seq)
                .map(|(sid, _)| sid.clone())
            else {
                break;
            };
            out.extend(self.take_front(&session_id, 1));
        }
        out
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            sessions_enabled: true,
        }
    }

    /// A broker that reports no session support, pinning consumers to the
    /// non-grouped fallback path.
    pub fn without_sessions() -> Self {
        Self {
            queues: DashMap::new(),
            sessions_enabled: false,
        }
    }

    fn state(&self, queue: &str) -> Arc<QueueState> {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }

    /// Messages currently sitting in a queue (excludes in-flight). Test aid.
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.state(queue);
        let inner = state.lock();
        inner.sessions.values().map(VecDeque::len).sum()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    fn supports_sessions(&self) -> bool {
        self.sessions_enabled
    }

    async fn send(&self, queue: &str, message: BrokerMessage) -> Result<(), QueueError> {
        let state = self.state(queue);
        let session_id = message.session_id.unwrap_or_default();
        if let Some(at) = message.scheduled_enqueue_at {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !delay.is_zero() {
                let body = message.body;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.enqueue(session_id, body);
                });
                return Ok(());
            }
        }
        state.enqueue(session_id, message.body);
        Ok(())
    }

    async fn accept_next_session(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, QueueError> {
        let state = self.state(queue);
        let deadline = Instant::now() + wait;
        loop {
            let notified = state.notify.notified();
            let found = {
                let mut inner = state.lock();
                let QueueInner {
                    sessions, locked, ..
                } = &mut *inner;
                let found = sessions
                    .iter()
                    .find(|(sid, q)| !q.is_empty() && !locked.contains(sid.as_str()))
                    .map(|(sid, _)| sid.clone());
                if let Some(sid) = &found {
                    locked.insert(sid.clone());
                }
                found
            };
            if let Some(session_id) = found {
                drop(notified);
                return Ok(Some(Box::new(MemorySessionReceiver {
                    state,
                    session_id,
                })));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn accept_session(
        &self,
        queue: &str,
        session_id: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, QueueError> {
        let state = self.state(queue);
        let deadline = Instant::now() + wait;
        loop {
            let notified = state.notify.notified();
            let acquired = {
                let mut inner = state.lock();
                inner.locked.insert(session_id.to_string())
            };
            if acquired {
                drop(notified);
                return Ok(Some(Box::new(MemorySessionReceiver {
                    state,
                    session_id: session_id.to_string(),
                })));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let state = self.state(queue);
        let deadline = Instant::now() + wait;
        loop {
            let notified = state.notify.notified();
            let batch = state.lock().take_global(max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<(), QueueError> {
        let state = self.state(queue);
        state.lock().in_flight.remove(&tag);
        Ok(())
    }

    async fn abandon(&self, queue: &str, tag: u64) -> Result<(), QueueError> {
        let state = self.state(queue);
        let mut inner = state.lock();
        if let Some(msg) = inner.in_flight.remove(&tag) {
            inner.requeue(msg);
            drop(inner);
            state.notify.notify_one();
        }
        Ok(())
    }
}

// ============================================================================
// MemorySessionReceiver
// ============================================================================

struct MemorySessionReceiver {
    state: Arc<QueueState>,
    session_id: String,
}

#[async_trait]
impl SessionReceiver for MemorySessionReceiver {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn receive(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.state.notify.notified();
            let batch = self.state.lock().take_front(&self.session_id, max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), QueueError> {
        self.state.lock().in_flight.remove(&tag);
        Ok(())
    }

    async fn abandon(&mut self, tag: u64) -> Result<(), QueueError> {
        let mut inner = self.state.lock();
        if let Some(msg) = inner.in_flight.remove(&tag) {
            inner.requeue(msg);
            drop(inner);
            self.state.notify.notify_one();
        }
        Ok(())
    }
}

impl Drop for MemorySessionReceiver {
    // Releasing the session returns unacked messages to their FIFO slots.
    fn drop(&mut self) {
        let mut inner = self.state.lock();
        let tags: Vec<u64> = inner
            .in_flight
            .values()
            .filter(|m| m.session_id == self.session_id)
            .map(|m| m.seq)
            .collect();
        for tag in tags {
            if let Some(msg) = inner.in_flight.remove(&tag) {
                inner.requeue(msg);
            }
        }
        inner.locked.remove(&self.session_id);
        drop(inner);
        self.state.notify.notify_one();
    }
}
