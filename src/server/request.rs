//! Inbound request view and the envelope it is validated from.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::broker::{HeaderValue, MessageProperties, METHOD_HEADER};
use crate::error::{Result, RpcError};

/// Routing envelope carried in the request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub method: String,
}

impl RequestEnvelope {
    /// Validate the `X-Method` header of an inbound message.
    pub fn from_properties(properties: &MessageProperties) -> Result<Self> {
        match properties.headers.get(METHOD_HEADER) {
            None => Err(RpcError::MalformedEnvelope(format!(
                "missing {} header",
                METHOD_HEADER
            ))),
            Some(HeaderValue::Str(method)) if !method.is_empty() => Ok(Self {
                method: method.clone(),
            }),
            Some(HeaderValue::Str(_)) => Err(RpcError::MalformedEnvelope(format!(
                "empty {} header",
                METHOD_HEADER
            ))),
            Some(other) => Err(RpcError::MalformedEnvelope(format!(
                "{} header is not a string: {:?}",
                METHOD_HEADER, other
            ))),
        }
    }
}

/// One inbound call, as seen by handlers and extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    service_name: String,
    method: String,
    content_type: String,
    body: Bytes,
}

impl Request {
    pub fn new(
        service_name: impl Into<String>,
        method: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method: method.into(),
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserialize a JSON body.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(RpcError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties_with(value: Option<HeaderValue>) -> MessageProperties {
        let mut properties = MessageProperties::default();
        if let Some(value) = value {
            properties.headers.set(METHOD_HEADER, value);
        }
        properties
    }

    #[test]
    fn test_envelope_valid() {
        let envelope =
            RequestEnvelope::from_properties(&properties_with(Some("echo".into()))).unwrap();
        assert_eq!(envelope.method, "echo");
    }

    #[test]
    fn test_envelope_missing_header() {
        let result = RequestEnvelope::from_properties(&properties_with(None));
        assert!(matches!(result, Err(RpcError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_envelope_wrong_type() {
        let result = RequestEnvelope::from_properties(&properties_with(Some(42i64.into())));
        assert!(matches!(result, Err(RpcError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_envelope_empty_method() {
        let result = RequestEnvelope::from_properties(&properties_with(Some("".into())));
        assert!(matches!(result, Err(RpcError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_request_deserialize() {
        let request = Request::new("calc", "add", "application/json", "[1,2]");
        let args: Vec<i32> = request.deserialize().unwrap();
        assert_eq!(args, vec![1, 2]);
        assert_eq!(request.service_name(), "calc");
    }
}
