//! Response model shared by handlers and callers.
//!
//! On the server a handler fills in a [`Response`]; the `ResponseWriter`
//! publishes it. On the client the reply consumer rebuilds one from the
//! reply delivery.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::broker::{
    Delivery, HeaderValue, Headers, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM,
    STATUS_CODE_HEADER,
};
use crate::error::{Result, RpcError};

/// RPC response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    body: Bytes,
    content_type: String,
    status_code: i16,
    headers: Headers,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a JSON body.
    pub fn json<T: Serialize + ?Sized>(&mut self, status_code: i16, content: &T) -> Result<()> {
        let body = serde_json::to_vec(content).map_err(RpcError::Encode)?;
        self.status_code = status_code;
        self.body = body.into();
        self.content_type = CONTENT_TYPE_JSON.to_string();
        Ok(())
    }

    /// Set a raw body with an explicit content type.
    pub fn raw(
        &mut self,
        status_code: i16,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) {
        self.status_code = status_code;
        self.content_type = content_type.into();
        self.body = body.into();
    }

    /// Set an octet-stream body.
    pub fn bytes(&mut self, status_code: i16, body: impl Into<Bytes>) {
        self.raw(status_code, CONTENT_TYPE_OCTET_STREAM, body);
    }

    /// Leave the body empty and only set the status.
    pub fn empty(&mut self, status_code: i16) {
        self.status_code = status_code;
    }

    pub fn status_code(&self) -> i16 {
        self.status_code
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Deserialize a JSON body.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(RpcError::Decode)
    }

    /// Copy the status code into the header table, as it travels on the wire.
    pub(crate) fn stamp_status_code(&mut self) {
        self.headers.set(STATUS_CODE_HEADER, self.status_code);
    }

    /// Split into body, content type and headers for publishing.
    pub(crate) fn into_parts(self) -> (Bytes, String, Headers) {
        (self.body, self.content_type, self.headers)
    }

    /// Rebuild a response from a reply delivery.
    pub(crate) fn from_delivery(delivery: &Delivery) -> Self {
        let headers = delivery.properties.headers.clone();
        let status_code = headers
            .get(STATUS_CODE_HEADER)
            .and_then(HeaderValue::as_i64)
            .and_then(|code| i16::try_from(code).ok())
            .unwrap_or_default();

        Self {
            body: delivery.body.clone(),
            content_type: delivery.properties.content_type.clone().unwrap_or_default(),
            status_code,
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sum {
        total: i64,
    }

    #[test]
    fn test_json_body() {
        let mut response = Response::new();
        response.json(200, &Sum { total: 3 }).unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_type(), CONTENT_TYPE_JSON);
        assert_eq!(response.deserialize::<Sum>().unwrap(), Sum { total: 3 });
    }

    #[test]
    fn test_raw_and_empty() {
        let mut response = Response::new();
        response.raw(201, "text/plain", "created");
        assert_eq!(response.body(), &Bytes::from_static(b"created"));
        assert_eq!(response.content_type(), "text/plain");

        response.empty(204);
        assert_eq!(response.status_code(), 204);
    }

    #[test]
    fn test_stamp_status_code() {
        let mut response = Response::new();
        response.headers_mut().set("X-Trace", "abc");
        response.empty(404);
        response.stamp_status_code();

        assert_eq!(
            response.headers().get(STATUS_CODE_HEADER),
            Some(&HeaderValue::Int(404))
        );
        assert_eq!(response.headers().len(), 2);
    }

    #[test]
    fn test_deserialize_invalid_json() {
        let mut response = Response::new();
        response.bytes(200, "not json");
        assert!(matches!(
            response.deserialize::<Sum>(),
            Err(RpcError::Decode(_))
        ));
    }
}
