//! Error types shared by the client, server and broker layers.

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur while issuing or serving remote calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("timed out")]
    TimedOut,

    #[error("No AMQP channel to publish the response to.")]
    NilPublishChannel,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Topology setup failed: {0}")]
    Topology(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Malformed request envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Default TTL must be greater than zero")]
    InvalidTimeout,

    #[error("Client closed before a reply arrived")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Whether this error came from the local timer rather than the transport.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(RpcError::TimedOut.to_string(), "timed out");
        assert_eq!(
            RpcError::NilPublishChannel.to_string(),
            "No AMQP channel to publish the response to."
        );
        assert_eq!(
            RpcError::Publish("channel closed".to_string()).to_string(),
            "Publish failed: channel closed"
        );
    }

    #[test]
    fn test_is_timeout() {
        assert!(RpcError::TimedOut.is_timeout());
        assert!(!RpcError::Closed.is_timeout());
    }
}
