//! In-memory broker for tests and local development.
//!
//! Queues are tokio mpsc channels shared by every consumer of the same queue,
//! so a single process can run clients and servers against each other without
//! RabbitMQ. Connection loss is simulated with [`MemoryBroker::disconnect`]
//! and recovery with [`MemoryBroker::reestablish`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    Acknowledger, Broker, Channel, Delivery, DeliveryStream, OutboundMessage, QueueSpec,
};
use crate::error::{Result, RpcError};

/// Capacity of the reestablishment broadcast.
const REESTABLISH_CAPACITY: usize = 16;

/// Counters for broker-side delivery outcomes.
#[derive(Debug, Default)]
struct Stats {
    acked: AtomicUsize,
    rejected: AtomicUsize,
    requeued: AtomicUsize,
    unroutable: AtomicUsize,
    expired: AtomicUsize,
}

struct StoredMessage {
    message: OutboundMessage,
    expires_at: Option<Instant>,
}

struct MemoryQueue {
    sender: mpsc::UnboundedSender<StoredMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>,
    declares: AtomicUsize,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            declares: AtomicUsize::new(0),
        }
    }

    async fn recv(&self) -> Option<StoredMessage> {
        self.receiver.lock().await.recv().await
    }
}

struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    channels: Mutex<Vec<Weak<ChannelState>>>,
    connected: AtomicBool,
    fail_open_channel: AtomicBool,
    fail_publish: AtomicBool,
    channels_opened: AtomicUsize,
    reestablished: broadcast::Sender<()>,
    stats: Stats,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// In-process broker.
///
/// Cloning shares the same queues and connection state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (reestablished, _) = broadcast::channel(REESTABLISH_CAPACITY);

        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                channels: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                fail_open_channel: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
                channels_opened: AtomicUsize::new(0),
                reestablished,
                stats: Stats::default(),
            }),
        }
    }

    /// Drop the simulated connection: every open channel is closed and its
    /// consumers end. Queues and their messages survive.
    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);

        let channels = std::mem::take(
            &mut *self
                .state
                .channels
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.closed.send_replace(true);
        }

        warn!("Memory broker connection lost");
    }

    /// Restore the connection and signal reestablishment to subscribers.
    pub fn reestablish(&self) {
        self.state.connected.store(true, Ordering::SeqCst);
        let subscribers = self.state.reestablished.send(()).unwrap_or(0);
        info!(subscribers, "Memory broker connection reestablished");
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Make subsequent `open_channel` calls fail.
    pub fn set_fail_open_channel(&self, fail: bool) {
        self.state.fail_open_channel.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queue(name).is_some()
    }

    /// Number of times a queue has been declared.
    pub fn declare_count(&self, name: &str) -> usize {
        self.state
            .queue(name)
            .map(|q| q.declares.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.state.stats.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.state.stats.rejected.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.state.stats.requeued.load(Ordering::SeqCst)
    }

    /// Messages published to a queue that does not exist.
    pub fn unroutable(&self) -> usize {
        self.state.stats.unroutable.load(Ordering::SeqCst)
    }

    /// Messages discarded because their TTL passed before delivery.
    pub fn expired(&self) -> usize {
        self.state.stats.expired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_connected() {
            return Err(RpcError::Connection("Broker is not connected".to_string()));
        }
        if self.state.fail_open_channel.load(Ordering::SeqCst) {
            return Err(RpcError::Connection(
                "Failed to create channel: injected failure".to_string(),
            ));
        }

        let (closed, _) = watch::channel(false);
        let channel = Arc::new(ChannelState {
            broker: self.state.clone(),
            closed,
        });

        {
            let mut channels = self
                .state
                .channels
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            channels.retain(|c| c.strong_count() > 0);
            channels.push(Arc::downgrade(&channel));
        }
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryChannel { state: channel }))
    }

    fn notify_reestablish(&self) -> broadcast::Receiver<()> {
        self.state.reestablished.subscribe()
    }
}

// ============================================================================
// Channel
// ============================================================================

struct ChannelState {
    broker: Arc<BrokerState>,
    closed: watch::Sender<bool>,
}

/// Channel handed out by [`MemoryBroker`].
pub struct MemoryChannel {
    state: Arc<ChannelState>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if *self.state.closed.borrow() || !self.state.broker.connected.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("Channel is closed".to_string()));
        }
        Ok(())
    }
}

/// Parse an AMQP expiration (milliseconds as a decimal string).
fn expiry_deadline(expiration: Option<&str>) -> Option<Instant> {
    let millis = u64::from_str(expiration?).ok()?;
    Some(Instant::now() + Duration::from_millis(millis))
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        self.ensure_open()
            .map_err(|e| RpcError::Topology(format!("Failed to declare queue: {}", e)))?;

        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        let queue = self
            .state
            .broker
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.clone())
            .or_insert_with(|| Arc::new(MemoryQueue::new()))
            .clone();
        queue.declares.fetch_add(1, Ordering::SeqCst);

        debug!(queue = %name, durable = spec.durable, "Declared queue");
        Ok(name)
    }

    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<()> {
        self.ensure_open()
            .map_err(|e| RpcError::Publish(format!("Failed to publish: {}", e)))?;

        let broker = &self.state.broker;
        if broker.fail_publish.load(Ordering::SeqCst) {
            return Err(RpcError::Publish(
                "Failed to publish: injected failure".to_string(),
            ));
        }

        let Some(queue) = broker.queue(routing_key) else {
            // Default exchange drops messages with no matching queue.
            broker.stats.unroutable.fetch_add(1, Ordering::SeqCst);
            debug!(routing_key = %routing_key, "Dropped unroutable message");
            return Ok(());
        };

        let expires_at = expiry_deadline(message.properties.expiration.as_deref());
        queue
            .sender
            .send(StoredMessage {
                message,
                expires_at,
            })
            .map_err(|_| RpcError::Publish(format!("Queue '{}' is gone", routing_key)))
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        self.ensure_open()
            .map_err(|e| RpcError::Topology(format!("Failed to start consumer: {}", e)))?;

        let memory_queue = self.state.broker.queue(queue).ok_or_else(|| {
            RpcError::Topology(format!("Failed to start consumer: no queue '{}'", queue))
        })?;

        let consumer = ConsumerState {
            queue: memory_queue,
            closed: self.state.closed.subscribe(),
            broker: self.state.broker.clone(),
            auto_ack,
        };

        let stream = futures::stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((delivery, consumer))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.send_replace(true);
        Ok(())
    }
}

struct ConsumerState {
    queue: Arc<MemoryQueue>,
    closed: watch::Receiver<bool>,
    broker: Arc<BrokerState>,
    auto_ack: bool,
}

impl ConsumerState {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let stored = tokio::select! {
                _ = wait_closed(&mut self.closed) => return None,
                stored = self.queue.recv() => stored?,
            };

            if stored.expires_at.is_some_and(|at| at <= Instant::now()) {
                self.broker.stats.expired.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            let acker: Arc<dyn Acknowledger> = if self.auto_ack {
                Arc::new(AutoAcker)
            } else {
                Arc::new(MemoryAcker {
                    broker: self.broker.clone(),
                    queue: self.queue.clone(),
                    message: stored.message.clone(),
                    settled: AtomicBool::new(false),
                })
            };

            let OutboundMessage { properties, body } = stored.message;
            return Some(Delivery::new(properties, body, acker));
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // Sender dropped counts as closed.
    let _ = closed.wait_for(|closed| *closed).await;
}

// ============================================================================
// Acknowledgment
// ============================================================================

/// Deliveries consumed in auto-ack mode; settling them is a no-op.
struct AutoAcker;

#[async_trait]
impl Acknowledger for AutoAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<BrokerState>,
    queue: Arc<MemoryQueue>,
    message: OutboundMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RpcError::Ack("Delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.broker.stats.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.broker.stats.rejected.fetch_add(1, Ordering::SeqCst);

        if requeue {
            self.broker.stats.requeued.fetch_add(1, Ordering::SeqCst);
            let message = self.message.clone();
            let expires_at = expiry_deadline(message.properties.expiration.as_deref());
            self.queue
                .sender
                .send(StoredMessage {
                    message,
                    expires_at,
                })
                .map_err(|_| RpcError::Ack("Queue is gone".to_string()))?;
        }
        Ok(())
    }
}
