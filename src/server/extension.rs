//! Server extensions.
//!
//! Extensions observe the server lifecycle and every request/response pair:
//! - `server_listening`: once per topology (re)establishment, before consuming
//! - `incoming_request`: before the handler runs
//! - `outgoing_response`: after the handler returns
//!
//! Hooks run in registration order.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::request::Request;
use super::spec::Spec;
use super::Server;
use crate::broker::{MessageProperties, OutboundMessage, QueueSpec, CONTENT_TYPE_JSON};
use crate::error::{Result, RpcError};
use crate::response::Response;

/// Queue specs are announced to by default.
pub const DEFAULT_SPECS_QUEUE: &str = "angzarr-rpc.specs";

/// Hook points around the server lifecycle and each request.
///
/// Every hook defaults to a no-op.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Topology is (re)established and the server is about to consume.
    /// Errors are logged; they do not stop the server.
    async fn server_listening(&self, _server: &Server) -> Result<()> {
        Ok(())
    }

    async fn incoming_request(&self, _request: &Request) {}

    async fn outgoing_response(
        &self,
        _request: &Request,
        _response: &Response,
        _elapsed: Duration,
        _status_code: i16,
    ) {
    }
}

/// Logs every request and its outcome.
#[derive(Debug, Default, Clone)]
pub struct LoggingExtension;

#[async_trait]
impl Extension for LoggingExtension {
    async fn server_listening(&self, server: &Server) -> Result<()> {
        info!(
            service = %server.service_name(),
            methods = server.registered_methods().len(),
            "Server listening"
        );
        Ok(())
    }

    async fn incoming_request(&self, request: &Request) {
        debug!(
            service = %request.service_name(),
            method = %request.method(),
            content_type = %request.content_type(),
            body_len = request.body().len(),
            "Incoming request"
        );
    }

    async fn outgoing_response(
        &self,
        request: &Request,
        _response: &Response,
        elapsed: Duration,
        status_code: i16,
    ) {
        info!(
            service = %request.service_name(),
            method = %request.method(),
            status_code,
            elapsed_ms = %elapsed.as_millis(),
            "Request handled"
        );
    }
}

/// Body published by [`SpecAnnouncer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecAnnouncement {
    pub service: String,
    pub specs: BTreeMap<String, Spec>,
}

/// Publishes the server's method specs each time it starts listening.
#[derive(Debug, Clone)]
pub struct SpecAnnouncer {
    queue: String,
}

impl Default for SpecAnnouncer {
    fn default() -> Self {
        Self::new(DEFAULT_SPECS_QUEUE)
    }
}

impl SpecAnnouncer {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl Extension for SpecAnnouncer {
    async fn server_listening(&self, server: &Server) -> Result<()> {
        let announcement = SpecAnnouncement {
            service: server.service_name().to_string(),
            specs: server.specs(),
        };
        let body = serde_json::to_vec(&announcement).map_err(RpcError::Encode)?;

        let channel = server.broker().open_channel().await?;
        channel.declare_queue(&QueueSpec::durable(&self.queue)).await?;

        let message = OutboundMessage {
            properties: MessageProperties {
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                ..Default::default()
            },
            body: body.into(),
        };
        let published = channel.publish(&self.queue, message).await;
        let _ = channel.close().await;
        published?;

        debug!(
            service = %announcement.service,
            queue = %self.queue,
            specs = announcement.specs.len(),
            "Announced specs"
        );
        Ok(())
    }
}
