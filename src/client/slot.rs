//! Correlation registry and the single-use slots it hands out.
//!
//! A [`Slot`] is created right before a request is published and removed
//! from the registry exactly once: when its reply is fulfilled, or when the
//! slot is disposed or dropped. Replies for tokens that are no longer
//! registered are discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::response::Response;

/// Opaque token matching a reply to its pending call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

type Pending = HashMap<CorrelationId, oneshot::Sender<Response>>;

/// Registry of in-flight calls keyed by correlation token.
///
/// Safe to share between any number of calling tasks and the reply consumer.
/// The lock is never held across an await point.
#[derive(Clone, Default)]
pub struct SlotRegistry {
    pending: Arc<Mutex<Pending>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new slot under a freshly generated token.
    pub fn create(&self) -> Slot {
        let (sender, receiver) = oneshot::channel();
        let mut pending = self.lock();

        let mut correlation_id = CorrelationId::generate();
        while pending.contains_key(&correlation_id) {
            correlation_id = CorrelationId::generate();
        }
        pending.insert(correlation_id.clone(), sender);

        Slot {
            correlation_id,
            receiver,
            registry: self.clone(),
            created_at: Instant::now(),
        }
    }

    /// Whether a slot is currently registered for the token.
    pub fn lookup(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Deliver a reply to the matching slot, removing it from the registry.
    ///
    /// Returns false when no slot is registered (already timed out, disposed,
    /// or never issued here); the reply is dropped.
    pub fn fulfill(&self, correlation_id: &CorrelationId, response: Response) -> bool {
        let sender = self.lock().remove(correlation_id);
        match sender {
            // A closed receiver means the waiter gave up in the meantime.
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Remove a slot without delivering anything. No-op for unknown tokens.
    pub fn dispose(&self, correlation_id: &CorrelationId) {
        self.lock().remove(correlation_id);
    }

    /// Drop every pending slot; their waiters observe `RpcError::Closed`.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Rendezvous point for one asynchronous reply.
///
/// Dropping the slot disposes it.
pub struct Slot {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Response>,
    registry: SlotRegistry,
    created_at: Instant,
}

impl Slot {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wait for the reply. Not bounded by any timeout; pair with
    /// `tokio::time::timeout` or use `Call::sync`.
    pub async fn response(mut self) -> Result<Response> {
        (&mut self.receiver).await.map_err(|_| RpcError::Closed)
    }

    /// Return the reply if it has already arrived.
    pub fn try_response(&mut self) -> Option<Response> {
        self.receiver.try_recv().ok()
    }

    /// Remove the slot from the registry; a late reply will be dropped.
    pub fn dispose(self) {}
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.registry.dispose(&self.correlation_id);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("correlation_id", &self.correlation_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}
