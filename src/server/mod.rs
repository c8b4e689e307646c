//! RPC server.
//!
//! The server owns its topology (a durable inbound queue named after the
//! service plus a consumer on it), the method registry and the extension
//! list. `listen_and_serve` spawns one task per inbound delivery.
//!
//! Topology lifecycle:
//! - `Uninitialized` until the first setup succeeds in `Server::new`
//! - `TopologySet` while a consumer is available
//! - `TopologyLost` after the consumer stream ends without a close
//!
//! A supervisor task re-runs setup once per broker reestablishment signal.
//! Setup never runs concurrently with itself; a failed setup is logged and
//! the server waits for the next signal. The serve loop polls every
//! [`SERVE_POLL_INTERVAL`] while no consumer is available.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Channel, Delivery, DeliveryStream, QueueSpec};
use crate::error::Result;
use crate::response::Response;

mod extension;
mod handler;
mod request;
mod spec;
mod writer;

pub use extension::{
    Extension, LoggingExtension, SpecAnnouncement, SpecAnnouncer, DEFAULT_SPECS_QUEUE,
};
pub use handler::MethodHandler;
pub use request::{Request, RequestEnvelope};
pub use spec::Spec;
pub use writer::ResponseWriter;

use handler::{ExtendedHandler, Extensions};

/// Interval between topology checks while no consumer is available.
pub const SERVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Topology lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Uninitialized,
    TopologySet,
    TopologyLost,
}

/// Server construction options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Let the broker acknowledge deliveries; the server then never acks or
    /// rejects.
    pub auto_ack: bool,
    /// Cap on concurrently running request tasks. `None` spawns one task per
    /// delivery without limit.
    pub max_concurrent_requests: Option<usize>,
}

/// Channel and consumer produced by the last successful setup.
#[derive(Default)]
struct Topology {
    channel: Option<Arc<dyn Channel>>,
    requests: Option<DeliveryStream>,
}

struct ServerInner {
    broker: Arc<dyn Broker>,
    service_name: String,
    options: ServerOptions,
    methods: RwLock<HashMap<String, Arc<ExtendedHandler>>>,
    specs: RwLock<BTreeMap<String, Spec>>,
    extensions: Extensions,
    /// Held for the whole of a setup so setups never overlap.
    topology: tokio::sync::Mutex<Topology>,
    state: watch::Sender<TopologyState>,
    setups: AtomicUsize,
    limiter: Option<Arc<Semaphore>>,
    closed: watch::Sender<bool>,
    serving: AtomicBool,
    close_subscribers: Mutex<CloseSubscribers>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct CloseSubscribers {
    finished: bool,
    waiting: Vec<oneshot::Sender<()>>,
}

impl ServerInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Open a channel, declare the inbound queue and start consuming it.
    async fn setup_topology(&self) -> Result<()> {
        let mut topology = self.topology.lock().await;

        let channel = self.broker.open_channel().await?;

        if let Err(e) = channel
            .declare_queue(&QueueSpec::durable(&self.service_name))
            .await
        {
            let _ = channel.close().await;
            return Err(e);
        }

        let requests = match channel
            .consume(&self.service_name, self.options.auto_ack)
            .await
        {
            Ok(requests) => requests,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        if let Some(previous) = topology.channel.replace(channel) {
            let _ = previous.close().await;
        }
        topology.requests = Some(requests);
        self.state.send_replace(TopologyState::TopologySet);
        self.setups.fetch_add(1, Ordering::SeqCst);

        info!(service = %self.service_name, "Topology set");
        Ok(())
    }

    /// Take the consumer for the serve loop, if one is available.
    async fn take_requests(&self) -> Option<DeliveryStream> {
        self.topology.lock().await.requests.take()
    }

    /// Called when a consumer stream ends. A setup that completed in the
    /// meantime keeps the state at `TopologySet`.
    async fn mark_topology_lost(&self) {
        let topology = self.topology.lock().await;
        if topology.requests.is_none() && !self.is_closed() {
            self.state.send_replace(TopologyState::TopologyLost);
            warn!(service = %self.service_name, "Topology lost, waiting for reconnection");
        }
    }

    /// Signal every close subscriber, now and in the future.
    fn finish(&self) {
        let mut subscribers = self
            .close_subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.finished = true;
        for subscriber in subscribers.waiting.drain(..) {
            let _ = subscriber.send(());
        }
    }

    /// Reject a delivery without requeue, unless the broker acks for us.
    async fn reject(&self, delivery: &Delivery) {
        if self.options.auto_ack {
            return;
        }
        if let Err(e) = delivery.reject(false).await {
            error!(error = %e, "Failed to reject message");
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            supervisor.abort();
        }
    }
}

/// RPC server for one service.
///
/// Cheap to clone. Register methods and extensions before calling
/// [`Server::listen_and_serve`]; changing them while serving is unsupported.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server and set up its topology.
    ///
    /// Fails if the initial topology setup fails.
    pub async fn new(
        broker: Arc<dyn Broker>,
        service_name: impl Into<String>,
        options: ServerOptions,
    ) -> Result<Self> {
        let (state, _) = watch::channel(TopologyState::Uninitialized);
        let (closed, _) = watch::channel(false);
        let limiter = options
            .max_concurrent_requests
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));

        let inner = Arc::new(ServerInner {
            broker,
            service_name: service_name.into(),
            options,
            methods: RwLock::new(HashMap::new()),
            specs: RwLock::new(BTreeMap::new()),
            extensions: Arc::new(RwLock::new(Vec::new())),
            topology: tokio::sync::Mutex::new(Topology::default()),
            state,
            setups: AtomicUsize::new(0),
            limiter,
            closed,
            serving: AtomicBool::new(false),
            close_subscribers: Mutex::new(CloseSubscribers::default()),
            supervisor: Mutex::new(None),
        });

        // Subscribe before the first setup so no signal is missed.
        let reestablished = inner.broker.notify_reestablish();

        if let Err(e) = inner.setup_topology().await {
            error!(service = %inner.service_name, error = %e, "Failed to set up topology");
            return Err(e);
        }

        let supervisor = tokio::spawn(handle_reestablished_connection(
            Arc::downgrade(&inner),
            reestablished,
            inner.closed.subscribe(),
        ));
        *inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(supervisor);

        Ok(Self { inner })
    }

    /// Register a handler for `method`, wrapped by the server's extensions.
    pub fn register<H: MethodHandler>(&self, method: impl Into<String>, handler: H) {
        let wrapped = ExtendedHandler::new(Box::new(handler), self.inner.extensions.clone());
        self.inner
            .methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), Arc::new(wrapped));
    }

    /// Register a handler along with its spec.
    pub fn register_with_spec<H: MethodHandler>(
        &self,
        method: impl Into<String>,
        handler: H,
        spec: Spec,
    ) {
        let method = method.into();
        self.register(method.clone(), handler);
        self.inner
            .specs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method, spec);
    }

    /// Append an extension; hooks run in the order extensions were added.
    pub fn add_extension<E: Extension + 'static>(&self, extension: E) {
        self.inner
            .extensions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(extension));
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Specs of every method registered with one.
    pub fn specs(&self) -> BTreeMap<String, Spec> {
        self.inner
            .specs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Registered method names, sorted.
    pub fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self
            .inner
            .methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    pub fn topology_state(&self) -> TopologyState {
        *self.inner.state.borrow()
    }

    /// Number of successful topology setups, initial one included.
    pub fn topology_setups(&self) -> usize {
        self.inner.setups.load(Ordering::SeqCst)
    }

    pub(crate) fn broker(&self) -> Arc<dyn Broker> {
        self.inner.broker.clone()
    }

    /// Serve requests until the server is closed.
    ///
    /// Survives connection loss: while topology is absent it polls every
    /// [`SERVE_POLL_INTERVAL`] and resumes once setup succeeds again.
    pub async fn listen_and_serve(&self) {
        let inner = &self.inner;
        inner.serving.store(true, Ordering::SeqCst);
        let mut closed = inner.closed.subscribe();

        while !inner.is_closed() {
            let Some(mut requests) = inner.take_requests().await else {
                tokio::select! {
                    _ = tokio::time::sleep(SERVE_POLL_INTERVAL) => {}
                    _ = closed.changed() => {}
                }
                continue;
            };

            self.pipe_through_server_listening_extensions().await;
            self.log_registered_methods();
            info!(
                service = %inner.service_name,
                "Connected to the broker and waiting for incoming rpc requests"
            );

            while let Some(delivery) = requests.next().await {
                self.spawn_request(delivery).await;
            }

            inner.mark_topology_lost().await;
        }

        info!(service = %inner.service_name, "Server stopped serving");
        inner.finish();
    }

    /// Stop consuming and close the inbound channel. Returns immediately;
    /// in-flight requests finish on their own. Use [`Server::notify_close`]
    /// or [`Server::shutdown`] to wait for the serve loop to end.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.send_replace(true) {
            return;
        }

        if let Some(supervisor) = inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            supervisor.abort();
        }

        let channel = inner.topology.lock().await.channel.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(service = %inner.service_name, error = %e, "Failed to close channel");
            }
        }

        if !inner.serving.load(Ordering::SeqCst) {
            inner.finish();
        }
    }

    /// Close and wait until the serve loop has ended.
    pub async fn shutdown(&self) {
        let done = self.notify_close();
        self.close().await;
        let _ = done.await;
    }

    /// One-time notification fired when the server finishes closing.
    /// Any number of subscribers may wait; late subscribers fire at once.
    pub fn notify_close(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut subscribers = self
            .inner
            .close_subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if subscribers.finished {
            let _ = tx.send(());
        } else {
            subscribers.waiting.push(tx);
        }
        rx
    }

    async fn pipe_through_server_listening_extensions(&self) {
        let extensions: Vec<_> = self
            .inner
            .extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for extension in extensions {
            if let Err(e) = extension.server_listening(self).await {
                error!(
                    service = %self.inner.service_name,
                    error = %e,
                    "Extension failed on listen"
                );
            }
        }
    }

    fn log_registered_methods(&self) {
        info!(service = %self.inner.service_name, "Registered methods");
        for method in self.registered_methods() {
            info!(service = %self.inner.service_name, method = %method, ". {}", method);
        }
    }

    /// Spawn the task handling one delivery, waiting for a permit first when
    /// concurrency is capped.
    async fn spawn_request(&self, delivery: Delivery) {
        let permit = match &self.inner.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process_request(inner, delivery).await;
        });
    }
}

/// Re-run topology setup once per reestablishment signal until closed.
async fn handle_reestablished_connection(
    server: Weak<ServerInner>,
    mut reestablished: broadcast::Receiver<()>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_closed(&mut closed) => return,
            signal = reestablished.recv() => match signal {
                Ok(()) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Coalesced reestablishment signals");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }

        let Some(server) = server.upgrade() else {
            return;
        };
        if server.is_closed() {
            return;
        }

        if let Err(e) = server.setup_topology().await {
            error!(
                service = %server.service_name,
                error = %e,
                "Error setting up topology after reconnection"
            );
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Handle one delivery: resolve the method, run the wrapped handler and
/// write the response back.
async fn process_request(inner: Arc<ServerInner>, delivery: Delivery) {
    let envelope = match RequestEnvelope::from_properties(&delivery.properties) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(service = %inner.service_name, error = %e, "Rejecting malformed request");
            inner.reject(&delivery).await;
            return;
        }
    };

    let handler = inner
        .methods
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&envelope.method)
        .cloned();

    let Some(handler) = handler else {
        error!(
            service = %inner.service_name,
            method = %envelope.method,
            "Method not found"
        );
        inner.reject(&delivery).await;
        return;
    };

    // Replies never go out on the consumer channel.
    let channel = match inner.broker.open_channel().await {
        Ok(channel) => Some(channel),
        Err(e) => {
            error!(error = %e, "Error opening channel for response");
            None
        }
    };

    let request = Request::new(
        inner.service_name.clone(),
        envelope.method,
        delivery.properties.content_type.clone().unwrap_or_default(),
        delivery.body.clone(),
    );

    let outcome = AssertUnwindSafe(handler.call(request, Response::new()))
        .catch_unwind()
        .await;

    match outcome {
        Ok(response) => {
            let writer = ResponseWriter::new(delivery, channel.clone(), inner.options.auto_ack);
            if let Err(e) = writer.write(response).await {
                error!(service = %inner.service_name, error = %e, "Error writing response");
            }
        }
        Err(_) => {
            error!(service = %inner.service_name, "Handler panicked, rejecting request");
            inner.reject(&delivery).await;
        }
    }

    if let Some(channel) = channel {
        let _ = channel.close().await;
    }
}

#[cfg(test)]
mod tests;
