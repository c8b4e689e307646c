//! Call builder.
//!
//! A [`Call`] accumulates method, payload and timeout, then publishes the
//! request in one of three modes:
//! - [`Call::void`]: fire-and-forget, no correlation metadata
//! - [`Call::dispatch`]: registers a [`Slot`] and returns it
//! - [`Call::sync`]: dispatches and waits for the reply or the timeout

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use super::slot::Slot;
use super::ClientInner;
use crate::broker::{
    MessageProperties, OutboundMessage, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM,
    METHOD_HEADER,
};
use crate::error::{Result, RpcError};
use crate::response::Response;

/// A remote call being built.
pub struct Call {
    client: Arc<ClientInner>,
    method: String,
    body: Bytes,
    content_type: String,
    timeout: Option<Duration>,
    /// Encoding failure from a JSON payload setter, surfaced on publish.
    encode_error: Option<serde_json::Error>,
}

impl Call {
    pub(super) fn new(client: Arc<ClientInner>, method: String) -> Self {
        Self {
            client,
            method,
            body: Bytes::new(),
            content_type: String::new(),
            timeout: None,
            encode_error: None,
        }
    }

    /// Override the client's default TTL for this call. Zero is ignored.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Raw bytes body, sent as `application/octet-stream`.
    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        self.with_body_content_type(body, CONTENT_TYPE_OCTET_STREAM)
    }

    /// Raw bytes body with an explicit content type.
    pub fn with_body_content_type(
        mut self,
        body: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        self.body = body.into();
        self.content_type = content_type.into();
        self.encode_error = None;
        self
    }

    /// JSON body from any serializable value (structs, maps).
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.body = body.into();
                self.content_type = CONTENT_TYPE_JSON.to_string();
                self.encode_error = None;
            }
            Err(e) => self.encode_error = Some(e),
        }
        self
    }

    /// JSON array body built from positional arguments.
    pub fn with_args<I, T>(self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let args: std::result::Result<Vec<serde_json::Value>, _> =
            args.into_iter().map(serde_json::to_value).collect();

        match args {
            Ok(args) => self.with_json(&args),
            Err(e) => Self {
                encode_error: Some(e),
                ..self
            },
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Call-specific timeout if set, the client's default TTL otherwise.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.client.default_ttl)
    }

    /// Publish without expecting a reply.
    pub async fn void(self) -> Result<()> {
        let topology = self.client.topology();
        let service_name = self.client.service_name.clone();
        let message = self.into_message()?;

        topology.channel.publish(&service_name, message).await
    }

    /// Publish and return the slot the reply will be delivered to.
    ///
    /// On publish failure no slot survives.
    pub async fn dispatch(self) -> Result<Slot> {
        let timeout = self.effective_timeout();
        let topology = self.client.topology();
        let client = self.client.clone();
        let method = self.method.clone();
        let mut message = self.into_message()?;

        let slot = client.slots.create();
        message.properties.correlation_id = Some(slot.correlation_id().to_string());
        message.properties.reply_to = Some(topology.reply_queue.clone());
        message.properties.expiration = Some(timeout.as_millis().to_string());

        topology.channel.publish(&client.service_name, message).await?;

        debug!(
            service = %client.service_name,
            method = %method,
            reply_queue = %topology.reply_queue,
            correlation_id = %slot.correlation_id(),
            "Published request"
        );

        Ok(slot)
    }

    /// Publish and wait for the reply, up to the effective timeout.
    ///
    /// The slot is disposed on every exit path.
    pub async fn sync(self) -> Result<Response> {
        let timeout = self.effective_timeout();
        let slot = self.dispatch().await?;

        match tokio::time::timeout(timeout, slot.response()).await {
            Ok(response) => response,
            Err(_) => Err(RpcError::TimedOut),
        }
    }

    fn into_message(self) -> Result<OutboundMessage> {
        if let Some(e) = self.encode_error {
            return Err(RpcError::Encode(e));
        }

        let mut properties = MessageProperties {
            content_type: Some(self.content_type),
            ..Default::default()
        };
        properties.headers.set(METHOD_HEADER, self.method);

        Ok(OutboundMessage {
            properties,
            body: self.body,
        })
    }
}
