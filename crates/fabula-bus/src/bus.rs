//! The event bus proper: retrying publisher with local-queue fallback,
//! pattern subscriptions with bounded buffers, handler retry, dead-letter
//! channel, replay drain, and the transport health probe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

use fabula_core::breaker::CircuitBreaker;
use fabula_core::config::TRANSPORT_PUBLISH_TIMEOUT_MS;
use fabula_core::events::Event;
use fabula_core::health::{HealthRegistry, ProbeResult};

use crate::error::{BusError, Result};
use crate::replay::LocalReplayQueue;
use crate::transport::{BusTransport, CHANNEL_PREFIX};

/// Publish retries after the first attempt fails.
const PUBLISH_RETRIES: u32 = 3;
/// Base backoff between publish attempts.
const PUBLISH_BACKOFF_BASE_MS: u64 = 100;
/// Handler attempts before an event is dead-lettered.
const HANDLER_ATTEMPTS: u32 = 3;
/// Base backoff between handler attempts.
const HANDLER_BACKOFF_BASE_MS: u64 = 50;
/// Per-subscriber buffer capacity; overflow drops the oldest entry.
const SUBSCRIBER_BUFFER: usize = 256;
/// Replay drain cadence while events are queued.
const DRAIN_INTERVAL_SECS: u64 = 1;
/// Transport liveness probe cadence.
const PROBE_INTERVAL_SECS: u64 = 10;

/// A consumer callback. Must be idempotent: the same event may be delivered
/// more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Process one event. An `Err` triggers retry and, after the retry
    /// budget, dead-lettering.
    async fn handle(&self, event: &Event) -> std::result::Result<(), String>;
}

/// An event whose handler exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Event,
    pub subscriber: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct CountersSnapshot {
    pub published: u64,
    pub queued_local: u64,
    pub replayed: u64,
    pub malformed: u64,
    pub subscriber_dropped: u64,
    pub dead_lettered: u64,
}

/// Monotonic bus counters, readable from the health endpoint and tests.
#[derive(Default)]
pub struct BusCounters {
    pub published: AtomicU64,
    pub queued_local: AtomicU64,
    pub replayed: AtomicU64,
    pub malformed: AtomicU64,
    pub subscriber_dropped: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl BusCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            published: self.published.load(Ordering::Relaxed),
            queued_local: self.queued_local.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            subscriber_dropped: self.subscriber_dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

struct Subscription {
    pattern: String,
    handler: Arc<dyn EventHandler>,
    buffer: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
}

pub struct EventBus {
    transport: Arc<dyn BusTransport>,
    replay: LocalReplayQueue,
    breaker: Arc<CircuitBreaker>,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    dlq_tx: mpsc::Sender<DeadLetter>,
    pub counters: BusCounters,
}

impl EventBus {
    /// Build the bus. The returned receiver yields dead letters; the caller
    /// owns their persistence.
    pub fn new(
        transport: Arc<dyn BusTransport>,
        replay: LocalReplayQueue,
    ) -> (Arc<Self>, mpsc::Receiver<DeadLetter>) {
        let (dlq_tx, dlq_rx) = mpsc::channel(256);
        let bus = Arc::new(Self {
            transport,
            replay,
            breaker: Arc::new(CircuitBreaker::new("bus")),
            subscriptions: Mutex::new(Vec::new()),
            dlq_tx,
            counters: BusCounters::default(),
        });
        (bus, dlq_rx)
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Events currently parked in the local replay queue.
    pub fn queued_len(&self) -> usize {
        self.replay.len()
    }

    /// Events lost to replay-queue overflow.
    pub fn queue_dropped(&self) -> u64 {
        self.replay.dropped()
    }

    /// Register a handler for every event whose type matches `pattern`
    /// (exact name, `prefix*`, or `*`). Must be called before [`run`].
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) {
        info!(pattern, subscriber = handler.name(), "bus subscription registered");
        self.subscriptions.lock().unwrap().push(Arc::new(Subscription {
            pattern: pattern.to_string(),
            handler,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }));
    }

    /// Publish an event.
    ///
    /// Returns `Ok` once the event is accepted by the transport or durably
    /// parked in the local replay queue; only serialization and queue I/O
    /// failures surface as errors.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        let channel = format!("{}{}", CHANNEL_PREFIX, event.event_type);
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if !self.breaker.allow() {
            return self.queue_local(&event);
        }

        let mut delay_ms = PUBLISH_BACKOFF_BASE_MS;
        for attempt in 0..=PUBLISH_RETRIES {
            match tokio::time::timeout(
                Duration::from_millis(TRANSPORT_PUBLISH_TIMEOUT_MS),
                self.transport.publish(&channel, &payload),
            )
            .await
            {
                Ok(Ok(())) => {
                    self.breaker.record_success();
                    return Ok(());
                }
                Ok(Err(e)) => {
                    self.breaker.record_failure();
                    if attempt < PUBLISH_RETRIES {
                        warn!(
                            event_type = %event.event_type,
                            attempt = attempt + 1,
                            error = %e,
                            "publish failed, backing off"
                        );
                    }
                }
                Err(_) => {
                    self.breaker.record_failure();
                    warn!(
                        event_type = %event.event_type,
                        attempt = attempt + 1,
                        "publish timed out"
                    );
                }
            }
            if attempt < PUBLISH_RETRIES {
                tokio::time::sleep(jittered(Duration::from_millis(delay_ms))).await;
                delay_ms *= 2;
            }
        }

        self.queue_local(&event)
    }

    fn queue_local(&self, event: &Event) -> Result<()> {
        self.replay.append(event)?;
        self.counters.queued_local.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drive the bus: subscriber workers, the inbound pump, the replay
    /// drain, and the transport probe. Runs until `shutdown` broadcasts true.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<HealthRegistry>,
        shutdown: watch::Receiver<bool>,
    ) {
        // Subscriber workers. The set is fixed at startup.
        let subs: Vec<Arc<Subscription>> = self.subscriptions.lock().unwrap().clone();
        for sub in &subs {
            tokio::spawn(run_subscriber(
                Arc::clone(sub),
                self.dlq_tx.clone(),
                shutdown.clone(),
            ));
        }

        // Inbound pump: transport firehose fans out into subscriber buffers.
        match self.transport.subscribe_all().await {
            Ok(mut rx) => {
                let bus = Arc::clone(&self);
                let mut pump_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            received = rx.recv() => match received {
                                Some((_, payload)) => bus.dispatch_inbound(&payload),
                                None => {
                                    warn!("bus inbound stream closed");
                                    break;
                                }
                            },
                            _ = pump_shutdown.changed() => {
                                if *pump_shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
            Err(e) => error!(error = %e, "bus subscription could not be established"),
        }

        info!("event bus started");
        let mut drain_tick =
            tokio::time::interval(Duration::from_secs(DRAIN_INTERVAL_SECS));
        let mut probe_tick =
            tokio::time::interval(Duration::from_secs(PROBE_INTERVAL_SECS));
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = drain_tick.tick() => {
                    if !self.replay.is_empty() {
                        self.drain_once().await;
                    }
                }
                _ = probe_tick.tick() => {
                    self.probe(&registry).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event bus shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn dispatch_inbound(&self, payload: &str) {
        let event: Event = match serde_json::from_str(payload) {
            Ok(ev) => ev,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "malformed event on bus, dropped");
                return;
            }
        };

        let subs = self.subscriptions.lock().unwrap().clone();
        for sub in subs {
            if !pattern_matches(&sub.pattern, &event.event_type) {
                continue;
            }
            {
                let mut buffer = sub.buffer.lock().unwrap();
                if buffer.len() >= SUBSCRIBER_BUFFER {
                    buffer.pop_front();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.counters.subscriber_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = sub.handler.name(),
                        "subscriber buffer full, oldest event dropped"
                    );
                }
                buffer.push_back(event.clone());
            }
            sub.notify.notify_one();
        }
    }

    /// Republish queued events in FIFO order, stopping at the first failure.
    async fn drain_once(&self) {
        while let Some(event) = self.replay.front() {
            if !self.breaker.allow() {
                return;
            }
            let payload = match serde_json::to_string(&event) {
                Ok(p) => p,
                Err(e) => {
                    // Unserializable entries can never be delivered; drop them.
                    error!(error = %e, "unserializable replay entry dropped");
                    let _ = self.replay.ack_front();
                    continue;
                }
            };
            let channel = format!("{}{}", CHANNEL_PREFIX, event.event_type);
            match tokio::time::timeout(
                Duration::from_millis(TRANSPORT_PUBLISH_TIMEOUT_MS),
                self.transport.publish(&channel, &payload),
            )
            .await
            {
                Ok(Ok(())) => {
                    self.breaker.record_success();
                    if let Err(e) = self.replay.ack_front() {
                        error!(error = %e, "replay ack failed");
                        return;
                    }
                    self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.breaker.record_failure();
                    warn!(error = %e, pending = self.replay.len(), "replay drain interrupted");
                    return;
                }
                Err(_) => {
                    self.breaker.record_failure();
                    warn!(pending = self.replay.len(), "replay drain timed out");
                    return;
                }
            }
        }
    }

    async fn probe(&self, registry: &HealthRegistry) {
        let started = std::time::Instant::now();
        match self.transport.ping().await {
            Ok(()) => {
                self.breaker.record_success();
                registry.record("bus", ProbeResult::up(started.elapsed().as_millis() as u64));
            }
            Err(e) => {
                self.breaker.record_failure();
                registry.record("bus", ProbeResult::down(e.to_string()));
            }
        }
    }
}

async fn run_subscriber(
    sub: Arc<Subscription>,
    dlq_tx: mpsc::Sender<DeadLetter>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = sub.buffer.lock().unwrap().pop_front();
        let event = match next {
            Some(ev) => ev,
            None => {
                tokio::select! {
                    _ = sub.notify.notified() => continue,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }
            }
        };

        let mut last_error = String::new();
        let mut delivered = false;
        for attempt in 1..=HANDLER_ATTEMPTS {
            match sub.handler.handle(&event).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    last_error = e;
                    if attempt < HANDLER_ATTEMPTS {
                        let backoff = HANDLER_BACKOFF_BASE_MS << (attempt - 1);
                        tokio::time::sleep(jittered(Duration::from_millis(backoff))).await;
                    }
                }
            }
        }

        if !delivered {
            warn!(
                subscriber = sub.handler.name(),
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %last_error,
                "handler exhausted retries, dead-lettering"
            );
            let letter = DeadLetter {
                event,
                subscriber: sub.handler.name().to_string(),
                error: last_error,
                attempts: HANDLER_ATTEMPTS,
            };
            if dlq_tx.send(letter).await.is_err() {
                error!("dead-letter channel closed, letter lost");
            }
        }
    }
}

/// Exact match, `prefix*`, or the bare wildcard `*`.
fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// Apply ±25 % jitter using the subsecond clock, avoiding a rand dependency.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as i64;
    let quarter = base_ms / 4;
    if quarter == 0 {
        return base;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as i64)
        .unwrap_or(0);
    let offset = (nanos % (quarter * 2)) - quarter;
    Duration::from_millis((base_ms + offset).max(1) as u64)
}
