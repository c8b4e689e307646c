//! AMQP (RabbitMQ) broker implementation.
//!
//! Channels are opened on connections drawn from a `deadpool-lapin` pool and
//! put in publisher-confirm mode. Every pooled connection registers an error
//! callback when the pool creates it. A supervisor task receives those
//! failures, re-dials with exponential backoff and then emits the
//! reestablishment signal servers and clients use to rebuild their topology.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Hook, Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, ConnectionProperties,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    Acknowledger, Broker, Channel, Delivery, DeliveryStream, HeaderValue, Headers,
    MessageProperties, OutboundMessage, QueueSpec,
};
use crate::error::{Result, RpcError};
use crate::utils::retry::reconnect_backoff;

/// Capacity of the reestablishment broadcast.
const REESTABLISH_CAPACITY: usize = 16;

/// Configuration for the AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpBrokerConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl AmqpBrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
        }
    }
}

/// RabbitMQ broker.
pub struct AmqpBroker {
    pool: Pool,
    reestablished: broadcast::Sender<()>,
    supervisor: JoinHandle<()>,
}

impl AmqpBroker {
    /// Connect to RabbitMQ and start supervising the pooled connections.
    pub async fn connect(config: AmqpBrokerConfig) -> Result<Self> {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .post_create(Hook::sync_fn(move |conn: &mut lapin::Connection, _| {
                let lost = lost_tx.clone();
                conn.on_error(move |e| {
                    let _ = lost.send(e.to_string());
                });
                Ok(())
            }))
            .build()
            .map_err(|e| RpcError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %config.url, "Connected to AMQP");

        let (reestablished, _) = broadcast::channel(REESTABLISH_CAPACITY);
        let redial_pool = pool.clone();
        let supervisor = tokio::spawn(supervise(lost_rx, reestablished.clone(), move || {
            let pool = redial_pool.clone();
            async move {
                let channel = Self::channel_from(&pool).await?;
                let _ = channel.close(200, "OK").await;
                Ok(())
            }
        }));

        Ok(Self {
            pool,
            reestablished,
            supervisor,
        })
    }

    async fn channel_from(pool: &Pool) -> Result<lapin::Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            RpcError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to create channel: {}", e)))
    }
}

/// Wait for connection failures and re-dial after each one.
///
/// Failures reported while re-dialing are folded into the same recovery, so
/// connections that fail together produce one reestablish signal.
async fn supervise<F, Fut>(
    mut lost: mpsc::UnboundedReceiver<String>,
    reestablished: broadcast::Sender<()>,
    redial: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while let Some(e) = lost.recv().await {
        warn!(error = %e, "AMQP connection lost, reconnecting");

        let mut backoff = reconnect_backoff().build();
        while let Err(e) = redial().await {
            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            error!(
                error = %e,
                backoff_ms = %delay.as_millis(),
                "Failed to reconnect, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        while lost.try_recv().is_ok() {}

        info!("AMQP connection reestablished");
        let _ = reestablished.send(());
    }
}

impl Drop for AmqpBroker {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = Self::channel_from(&self.pool).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to enable confirms: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn notify_reestablish(&self) -> broadcast::Receiver<()> {
        self.reestablished.subscribe()
    }
}

// ============================================================================
// Channel
// ============================================================================

struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to declare queue: {}", e)))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let properties = to_basic_properties(&message.properties);

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| RpcError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| RpcError::Publish(format!("Publish confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(RpcError::Publish(format!(
                "Broker nacked message to {}",
                routing_key
            )));
        }

        debug!(routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to start consumer: {}", e)))?;

        let queue = queue.to_string();
        let stream = consumer
            .take_while(move |delivery| {
                if let Err(e) = delivery {
                    error!(queue = %queue, error = %e, "Consumer delivery error");
                }
                futures::future::ready(delivery.is_ok())
            })
            .filter_map(|delivery| futures::future::ready(delivery.ok().map(from_lapin_delivery)));

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to close channel: {}", e)))
    }
}

// ============================================================================
// Acknowledgment
// ============================================================================

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| RpcError::Ack(format!("Failed to reject message: {}", e)))
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(to_field_table(&properties.headers));

    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(expiration.as_str().into());
    }

    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<lapin::types::ShortString>| {
        value.as_ref().map(|s| s.as_str().to_string())
    };

    MessageProperties {
        content_type: text(basic.content_type()),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        expiration: text(basic.expiration()),
        headers: basic
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    Delivery::new(
        properties,
        delivery.data.into(),
        Arc::new(AmqpAcker(delivery.acker)),
    )
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers.iter() {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(name.as_str().into(), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::ShortShortInt(v) => HeaderValue::Int((*v).into()),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Int((*v).into()),
                AMQPValue::ShortInt(v) => HeaderValue::Int((*v).into()),
                AMQPValue::ShortUInt(v) => HeaderValue::Int((*v).into()),
                AMQPValue::LongInt(v) => HeaderValue::Int((*v).into()),
                AMQPValue::LongUInt(v) => HeaderValue::Int((*v).into()),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
                _ => return None,
            };
            Some((name.as_str().to_string(), value))
        })
        .collect()
}
