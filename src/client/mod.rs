//! RPC client.
//!
//! The client owns an outbound channel, an exclusive broker-named reply
//! queue, the registry of in-flight slots, and a background task that drains
//! the reply queue and completes matching slots. After the broker signals a
//! reconnection the task rebuilds the channel and reply queue.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Channel, Delivery, DeliveryStream, QueueSpec};
use crate::error::{Result, RpcError};
use crate::response::Response;

mod call;
mod slot;

pub use call::Call;
pub use slot::{CorrelationId, Slot, SlotRegistry};

/// Channel and reply queue currently in use.
struct ReplyTopology {
    channel: Arc<dyn Channel>,
    reply_queue: String,
}

type SharedTopology = Arc<RwLock<Arc<ReplyTopology>>>;

pub(crate) struct ClientInner {
    service_name: String,
    default_ttl: Duration,
    slots: SlotRegistry,
    topology: SharedTopology,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn topology(&self) -> Arc<ReplyTopology> {
        self.topology
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(consumer) = self
            .consumer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            consumer.abort();
        }
    }
}

/// Client for calling methods of one remote service.
///
/// Cheap to clone; clones share the reply queue and slot registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect a client to `service_name`.
    ///
    /// `default_ttl` bounds every call that does not set its own timeout and
    /// must be greater than zero.
    pub async fn new(
        broker: Arc<dyn Broker>,
        service_name: impl Into<String>,
        default_ttl: Duration,
    ) -> Result<Self> {
        if default_ttl.is_zero() {
            return Err(RpcError::InvalidTimeout);
        }

        let service_name = service_name.into();
        // Subscribe before setup so no reconnection signal is missed.
        let reestablished = broker.notify_reestablish();
        let (topology, replies) = setup_reply_topology(broker.as_ref()).await?;

        info!(
            service = %service_name,
            reply_queue = %topology.reply_queue,
            "Client connected"
        );

        let topology: SharedTopology = Arc::new(RwLock::new(Arc::new(topology)));
        let slots = SlotRegistry::new();

        let consumer = tokio::spawn(consume_replies(
            broker,
            slots.clone(),
            topology.clone(),
            replies,
            reestablished,
        ));

        Ok(Self {
            inner: Arc::new(ClientInner {
                service_name,
                default_ttl,
                slots,
                topology,
                consumer: Mutex::new(Some(consumer)),
            }),
        })
    }

    /// Start building a call to `method`.
    pub fn call(&self, method: impl Into<String>) -> Call {
        Call::new(self.inner.clone(), method.into())
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Name of the queue replies are currently delivered to.
    pub fn reply_queue(&self) -> String {
        self.inner.topology().reply_queue.clone()
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.slots.len()
    }

    /// Whether a slot is registered for the token.
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.slots.lookup(correlation_id)
    }

    /// Stop consuming replies and close the channel. Calls still waiting
    /// fail with `RpcError::Closed`.
    pub async fn close(&self) -> Result<()> {
        let consumer = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(consumer) = consumer {
            consumer.abort();
        }

        self.inner.slots.clear();
        self.inner.topology().channel.close().await
    }
}

/// Open a channel, declare a broker-named reply queue and consume it.
async fn setup_reply_topology(broker: &dyn Broker) -> Result<(ReplyTopology, DeliveryStream)> {
    let channel = broker.open_channel().await?;
    let reply_queue = channel.declare_queue(&QueueSpec::exclusive()).await?;
    let replies = channel.consume(&reply_queue, true).await?;

    Ok((
        ReplyTopology {
            channel,
            reply_queue,
        },
        replies,
    ))
}

/// Drain the reply queue for the lifetime of the client.
async fn consume_replies(
    broker: Arc<dyn Broker>,
    slots: SlotRegistry,
    topology: SharedTopology,
    mut replies: DeliveryStream,
    mut reestablished: broadcast::Receiver<()>,
) {
    loop {
        while let Some(delivery) = replies.next().await {
            complete_slot(&slots, delivery);
        }

        warn!("Reply consumer stopped, waiting for reconnection");

        loop {
            match reestablished.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }

            match setup_reply_topology(broker.as_ref()).await {
                Ok((rebuilt, stream)) => {
                    info!(reply_queue = %rebuilt.reply_queue, "Reply queue reestablished");
                    *topology.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rebuilt);
                    replies = stream;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error setting up reply queue after reconnection");
                }
            }
        }
    }
}

/// Hand a reply to its slot, or drop it when nobody is waiting.
fn complete_slot(slots: &SlotRegistry, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
        debug!("Discarding reply without correlation id");
        return;
    };
    let correlation_id = CorrelationId::from(correlation_id);

    if !slots.lookup(&correlation_id) {
        debug!(correlation_id = %correlation_id, "Discarding unmatched reply");
        return;
    }

    if slots.fulfill(&correlation_id, Response::from_delivery(&delivery)) {
        debug!(correlation_id = %correlation_id, "Reply delivered");
    }
}
