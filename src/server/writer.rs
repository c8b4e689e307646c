//! One-shot writer publishing a handler's response to the caller.

use std::sync::Arc;

use tracing::debug;

use crate::broker::{Channel, Delivery, MessageProperties, OutboundMessage};
use crate::error::{Result, RpcError};
use crate::response::Response;

/// Sends a response back to the request's reply queue and settles the
/// request delivery.
pub struct ResponseWriter {
    delivery: Delivery,
    channel: Option<Arc<dyn Channel>>,
    auto_ack: bool,
}

impl ResponseWriter {
    pub fn new(delivery: Delivery, channel: Option<Arc<dyn Channel>>, auto_ack: bool) -> Self {
        Self {
            delivery,
            channel,
            auto_ack,
        }
    }

    /// Publish the response, then ack the request unless in auto-ack mode.
    ///
    /// On publish failure the request stays unacknowledged. Requests without
    /// a reply destination (fire-and-forget) are only acknowledged.
    pub async fn write(self, mut response: Response) -> Result<()> {
        let reply_to = self.delivery.properties.reply_to.as_deref();
        let correlation_id = self.delivery.properties.correlation_id.clone();

        debug!(
            reply_to = ?reply_to,
            correlation_id = ?correlation_id,
            "Sending response"
        );

        let Some(channel) = &self.channel else {
            return Err(RpcError::NilPublishChannel);
        };

        // Status code travels as a header as well.
        response.stamp_status_code();

        match reply_to {
            Some(reply_to) => {
                let (body, content_type, headers) = response.into_parts();
                let message = OutboundMessage {
                    properties: MessageProperties {
                        content_type: Some(content_type),
                        correlation_id: correlation_id.clone(),
                        headers,
                        ..Default::default()
                    },
                    body,
                };
                channel.publish(reply_to, message).await?;
            }
            None => debug!("Request has no reply destination, skipping publish"),
        }

        if !self.auto_ack {
            self.delivery.ack().await?;
            debug!(correlation_id = ?correlation_id, "Acked request");
        }

        Ok(())
    }
}
