//! Broker abstraction the RPC layer rides on.
//!
//! This module contains:
//! - `Broker` trait: hands out channels and signals reconnection
//! - `Channel` trait: queue declaration, publishing and consuming
//! - `Acknowledger` trait: per-delivery ack/reject
//! - Message types shared by every implementation
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::error::Result;

mod headers;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use headers::{HeaderValue, Headers, METHOD_HEADER, STATUS_CODE_HEADER};
pub use memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpBrokerConfig};

/// Content type for raw byte payloads.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
/// Content type for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

// ============================================================================
// Messages
// ============================================================================

/// Properties carried by every message on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as a decimal string.
    pub expiration: Option<String>,
    pub headers: Headers,
}

/// Message handed to `Channel::publish`.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// Acknowledges or rejects a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// Message received from a consumer.
#[derive(Clone)]
pub struct Delivery {
    pub properties: MessageProperties,
    pub body: Bytes,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(properties: MessageProperties, body: Bytes, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            properties,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries from a consumer. Ends when the consuming channel
/// closes or the connection is lost.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name. Empty lets the broker pick one.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable, shared queue (service inbound queues).
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Broker-named exclusive queue (client reply queues).
    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A channel opened on the broker connection.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue and return its (possibly broker-assigned) name.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Publish to the default exchange, routed by queue name.
    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream>;

    /// Close the channel, ending every consumer opened on it.
    async fn close(&self) -> Result<()>;
}

/// Connection owner. Opening, authenticating and re-dialing the transport is
/// the implementation's business; the RPC layer only asks for channels and
/// listens for reconnection.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Subscribe to reestablishment signals, one per successful reconnection.
    fn notify_reestablish(&self) -> broadcast::Receiver<()>;
}
