//! Event distribution fabric: asynchronous, at-least-once delivery of
//! instance events between cohort members.
//!
//! `publish` only enqueues; a publisher task pushes sealed envelopes onto the
//! transport with a per-attempt timeout and bounded exponential backoff.
//! Envelopes that exhaust their attempts are parked in a redelivery queue
//! that a timer task drains, so nothing is dropped. Listener tasks drain the
//! transport, keep the registry current and hand events to subscribers.

use crate::config::PublishConfig;
use crate::error::{CohortError, Result};
use crate::event::{CohortMessage, EventEnvelope, InstanceEvent};
use crate::instance::{current_time_us, MetadataCollectionId};
use crate::registry::{CohortRegistry, MemberDescriptor};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// At-least-once transport carrying sealed envelopes between members.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Hand an envelope to the transport for delivery to every other member.
    async fn send(&self, envelope: EventEnvelope) -> Result<()>;

    /// Next envelope addressed to this member; `None` once the transport is gone.
    async fn recv(&self) -> Option<EventEnvelope>;
}

#[derive(Debug, Default)]
struct TopicInner {
    subscribers: DashMap<MetadataCollectionId, mpsc::UnboundedSender<EventEnvelope>>,
    partitioned: Mutex<HashSet<MetadataCollectionId>>,
    holding: AtomicBool,
    held: Mutex<HashMap<MetadataCollectionId, Vec<EventEnvelope>>>,
}

impl TopicInner {
    fn is_partitioned(&self, member: &MetadataCollectionId) -> bool {
        self.partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(member)
    }

    fn deliver(&self, from: &MetadataCollectionId, envelope: &EventEnvelope) {
        let holding = self.holding.load(Ordering::SeqCst);
        for subscriber in self.subscribers.iter() {
            let target = subscriber.key();
            if target == from {
                continue;
            }
            if holding || self.is_partitioned(target) {
                self.held
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(target.clone())
                    .or_default()
                    .push(envelope.clone());
                continue;
            }
            if subscriber.value().send(envelope.clone()).is_err() {
                debug!("topic subscriber {} has gone away", target);
            }
        }
    }

    fn release(&self, reverse: bool) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let ready: Vec<MetadataCollectionId> = held
            .keys()
            .filter(|member| !self.is_partitioned(member))
            .cloned()
            .collect();
        for member in ready {
            let Some(mut envelopes) = held.remove(&member) else {
                continue;
            };
            if reverse {
                envelopes.reverse();
            }
            if let Some(tx) = self.subscribers.get(&member) {
                for envelope in envelopes {
                    let _ = tx.send(envelope);
                }
            }
        }
    }
}

/// In-process broadcast topic shared by simulated members.
///
/// Every connected member receives every envelope except its own. Tests can
/// partition a member (its sends fail, deliveries to it are parked) or hold
/// all deliveries and release them later, optionally in reverse order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTopic {
    inner: Arc<TopicInner>,
}

impl InMemoryTopic {
    /// Create an empty topic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member. Reconnecting replaces the earlier connection.
    pub fn connect(&self, member_id: MetadataCollectionId) -> InMemoryConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(member_id.clone(), tx);
        InMemoryConnection {
            member_id,
            topic: Arc::clone(&self.inner),
            receiver: tokio::sync::Mutex::new(rx),
        }
    }

    /// Cut a member off from the topic.
    pub fn partition(&self, member_id: &MetadataCollectionId) {
        info!("partitioning {} from the topic", member_id);
        self.inner
            .partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member_id.clone());
    }

    /// Reconnect a partitioned member and hand it what was parked for it.
    pub fn heal(&self, member_id: &MetadataCollectionId) {
        info!("healing partition of {}", member_id);
        self.inner
            .partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(member_id);
        if !self.inner.holding.load(Ordering::SeqCst) {
            self.inner.release(false);
        }
    }

    /// Park every delivery until [`release`](Self::release).
    pub fn hold(&self) {
        self.inner.holding.store(true, Ordering::SeqCst);
    }

    /// Deliver everything parked, in publish order or reversed.
    pub fn release(&self, reverse: bool) {
        self.inner.holding.store(false, Ordering::SeqCst);
        self.inner.release(reverse);
    }

    /// Number of envelopes parked for `member_id`.
    pub fn held_for(&self, member_id: &MetadataCollectionId) -> usize {
        self.inner
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(member_id)
            .map_or(0, Vec::len)
    }
}

/// One member's connection to an [`InMemoryTopic`].
#[derive(Debug)]
pub struct InMemoryConnection {
    member_id: MetadataCollectionId,
    topic: Arc<TopicInner>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventEnvelope>>,
}

#[async_trait]
impl EventTransport for InMemoryConnection {
    async fn send(&self, envelope: EventEnvelope) -> Result<()> {
        if self.topic.is_partitioned(&self.member_id) {
            return Err(CohortError::Transient {
                operation: "publish",
                target: self.member_id.to_string(),
                reason: "member is partitioned from the topic".to_string(),
            });
        }
        self.topic.deliver(&self.member_id, &envelope);
        Ok(())
    }

    async fn recv(&self) -> Option<EventEnvelope> {
        self.receiver.lock().await.recv().await
    }
}

/// Callback invoked once per delivered instance event. Must be idempotent.
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &InstanceEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&InstanceEvent) + Send + Sync,
{
    fn on_event(&self, event: &InstanceEvent) {
        self(event)
    }
}

#[derive(Debug, Default)]
struct FabricStatsInner {
    published: AtomicU64,
    sent: AtomicU64,
    delivered: AtomicU64,
    retries: AtomicU64,
    queued_for_redelivery: AtomicU64,
    redelivered: AtomicU64,
    corrupt: AtomicU64,
}

/// Snapshot of fabric counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FabricStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Messages handed to the transport.
    pub sent: u64,
    /// Instance events received from other members.
    pub delivered: u64,
    /// Send attempts that were retried.
    pub retries: u64,
    /// Messages parked after exhausting their attempts.
    pub queued_for_redelivery: u64,
    /// Parked messages later sent successfully.
    pub redelivered: u64,
    /// Inbound envelopes that failed their integrity check.
    pub corrupt: u64,
}

/// One member's attachment to the cohort topic.
pub struct EventFabric {
    local_member_id: MetadataCollectionId,
    display_name: String,
    config: PublishConfig,
    transport: Arc<dyn EventTransport>,
    registry: Arc<CohortRegistry>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    outbound_tx: mpsc::UnboundedSender<EventEnvelope>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
    redelivery: Mutex<VecDeque<EventEnvelope>>,
    sequence: AtomicU64,
    stats: FabricStatsInner,
    cancel: CancellationToken,
}

impl EventFabric {
    /// Create a fabric over `transport`. Nothing moves until [`start`](Self::start).
    pub fn new(
        registry: Arc<CohortRegistry>,
        display_name: &str,
        transport: Arc<dyn EventTransport>,
        config: PublishConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            local_member_id: registry.local_member_id().clone(),
            display_name: display_name.to_string(),
            config,
            transport,
            registry,
            handlers: RwLock::new(Vec::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            redelivery: Mutex::new(VecDeque::new()),
            sequence: AtomicU64::new(0),
            stats: FabricStatsInner::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// The local member id.
    pub fn local_member_id(&self) -> &MetadataCollectionId {
        &self.local_member_id
    }

    /// Display name announced with every event.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Next sequence hint for an outgoing event.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a handler for inbound instance events.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Queue an instance event for delivery. Never blocks and never fails
    /// because of the transport; errors only for an unencodable event or
    /// after shutdown.
    pub fn publish(&self, event: InstanceEvent) -> Result<()> {
        debug!(
            "publishing {:?} for {} (seq {})",
            event.kind,
            event.instance_guid(),
            event.sequence_hint
        );
        self.publish_message(&CohortMessage::Instance(event))
    }

    /// Announce this member to the cohort.
    pub fn announce(&self, descriptor: MemberDescriptor) -> Result<()> {
        self.publish_message(&CohortMessage::Registration {
            member_id: self.local_member_id.clone(),
            descriptor,
            timestamp_us: current_time_us(),
        })
    }

    fn publish_message(&self, message: &CohortMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CohortError::Shutdown);
        }
        let envelope = EventEnvelope::seal(message)?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(envelope)) = self.outbound_tx.send(envelope) {
            self.park(envelope);
        }
        Ok(())
    }

    fn park(&self, envelope: EventEnvelope) {
        self.stats
            .queued_for_redelivery
            .fetch_add(1, Ordering::Relaxed);
        self.redelivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(envelope);
    }

    /// Number of envelopes waiting for redelivery.
    pub fn pending_redelivery(&self) -> usize {
        self.redelivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current counters.
    pub fn stats(&self) -> FabricStats {
        FabricStats {
            published: self.stats.published.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            queued_for_redelivery: self.stats.queued_for_redelivery.load(Ordering::Relaxed),
            redelivered: self.stats.redelivered.load(Ordering::Relaxed),
            corrupt: self.stats.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Spawn the publisher, redelivery and listener tasks.
    pub fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| CohortError::Conflict {
                operation: "start_fabric",
                target: self.local_member_id.to_string(),
                reason: "fabric already started".to_string(),
            })?;

        let mut tasks = Vec::with_capacity(2 + self.config.listener_tasks);
        tasks.push(tokio::spawn(Arc::clone(self).run_publisher(outbound_rx)));
        tasks.push(tokio::spawn(Arc::clone(self).run_redelivery()));
        for _ in 0..self.config.listener_tasks.max(1) {
            tasks.push(tokio::spawn(Arc::clone(self).run_listener()));
        }
        info!(
            "fabric for {} started with {} listener task(s)",
            self.local_member_id, self.config.listener_tasks
        );
        Ok(tasks)
    }

    /// Stop every task spawned by [`start`](Self::start).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// True once shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run_publisher(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<EventEnvelope>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = outbound.recv() => match next {
                    Some(envelope) => self.send_with_retry(envelope).await,
                    None => break,
                },
            }
        }
        // Keep whatever was still queued at shutdown.
        while let Ok(envelope) = outbound.try_recv() {
            self.park(envelope);
        }
        debug!("publisher for {} stopped", self.local_member_id);
    }

    async fn run_redelivery(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.redelivery_interval());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.pending_redelivery() > 0 {
                        self.flush_redelivery().await;
                    }
                }
            }
        }
    }

    async fn run_listener(self: Arc<Self>) {
        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.transport.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.handle_envelope(&envelope);
        }
        debug!("listener for {} stopped", self.local_member_id);
    }

    async fn try_send(&self, envelope: &EventEnvelope) -> Result<()> {
        match tokio::time::timeout(
            self.config.attempt_timeout(),
            self.transport.send(envelope.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CohortError::Transient {
                operation: "publish",
                target: self.local_member_id.to_string(),
                reason: format!("send timed out after {:?}", self.config.attempt_timeout()),
            }),
        }
    }

    async fn send_with_retry(&self, envelope: EventEnvelope) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.try_send(&envelope).await {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.config.max_attempts {
                warn!(
                    "publish from {} gave up after {} attempt(s): {}; queued for redelivery",
                    self.local_member_id, attempt, err
                );
                self.park(envelope);
                return;
            }
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(
                        "publisher for {} stopping mid-retry; envelope parked",
                        self.local_member_id
                    );
                    self.park(envelope);
                    return;
                }
                _ = tokio::time::sleep(self.compute_backoff(attempt - 1)) => {}
            }
        }
    }

    /// Exponential backoff for the given retry, capped. Jitter takes up to
    /// half of the capped delay off, so the cap is never exceeded.
    fn compute_backoff(&self, retry: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64;
        let computed = base * self.config.backoff_multiplier.powi(retry as i32);
        let capped = computed.min(self.config.max_backoff_ms as f64) as u64;
        if self.config.jitter && capped > 1 {
            let jitter = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped - jitter)
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Try every parked envelope once, in order. Returns how many went out;
    /// the rest stay parked.
    pub async fn flush_redelivery(&self) -> usize {
        let parked: Vec<EventEnvelope> = self
            .redelivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if parked.is_empty() {
            return 0;
        }

        let mut sent = 0;
        let mut remaining = VecDeque::new();
        for envelope in parked {
            if !remaining.is_empty() {
                remaining.push_back(envelope);
                continue;
            }
            match self.try_send(&envelope).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!("redelivery from {} still failing: {}", self.local_member_id, e);
                    remaining.push_back(envelope);
                }
            }
        }

        if !remaining.is_empty() {
            let mut queue = self.redelivery.lock().unwrap_or_else(PoisonError::into_inner);
            // Envelopes parked meanwhile go after the older ones.
            remaining.extend(queue.drain(..));
            *queue = remaining;
        }
        if sent > 0 {
            info!("redelivered {} event(s) from {}", sent, self.local_member_id);
            self.stats.redelivered.fetch_add(sent as u64, Ordering::Relaxed);
            self.stats.sent.fetch_add(sent as u64, Ordering::Relaxed);
        }
        sent
    }

    /// Process one inbound envelope: verify it, keep the registry current
    /// and dispatch instance events to subscribers.
    pub fn handle_envelope(&self, envelope: &EventEnvelope) {
        let message = match envelope.open() {
            Ok(message) => message,
            Err(e) => {
                self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!("dropping inbound envelope at {}: {}", self.local_member_id, e);
                return;
            }
        };
        if message.sender() == &self.local_member_id {
            return;
        }
        match message {
            CohortMessage::Registration {
                member_id,
                descriptor,
                timestamp_us,
            } => {
                self.registry.register_member(member_id.clone(), &descriptor);
                self.registry
                    .observe_event(&member_id, &descriptor.display_name, timestamp_us);
            }
            CohortMessage::Instance(event) => {
                self.registry.observe_event(
                    &event.originator,
                    &event.originator_name,
                    event.timestamp_us,
                );
                let handlers: Vec<Arc<dyn EventHandler>> = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in handlers {
                    handler.on_event(&event);
                }
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
