use super::*;
use crate::broker::{MemoryBroker, MessageProperties, OutboundMessage, METHOD_HEADER};
use crate::client::Client;
use crate::error::RpcError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Instant;

const SERVICE: &str = "calculator";

async fn server_for(broker: &MemoryBroker, options: ServerOptions) -> Server {
    let server = Server::new(Arc::new(broker.clone()), SERVICE, options)
        .await
        .expect("server");
    server.register("echo", |req: Request, mut res: Response| async move {
        if req.body().as_ref() == b"boom" {
            panic!("handler exploded");
        }
        res.raw(200, req.content_type().to_string(), req.body().clone());
        res
    });
    server
}

async fn client_for(broker: &MemoryBroker) -> Client {
    Client::new(Arc::new(broker.clone()), SERVICE, Duration::from_secs(2))
        .await
        .expect("client")
}

fn spawn_serve(server: &Server) -> JoinHandle<()> {
    let server = server.clone();
    tokio::spawn(async move { server.listen_and_serve().await })
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Publish a request straight to the service queue.
async fn publish_raw(broker: &MemoryBroker, method: Option<&str>) {
    let channel = broker.open_channel().await.unwrap();
    let mut properties = MessageProperties {
        correlation_id: Some("raw-1".to_string()),
        reply_to: Some("raw-replies".to_string()),
        ..Default::default()
    };
    if let Some(method) = method {
        properties.headers.set(METHOD_HEADER, method);
    }
    channel
        .publish(
            SERVICE,
            OutboundMessage {
                properties,
                body: "payload".into(),
            },
        )
        .await
        .unwrap();
}

struct Recorder {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(format!("{}:{}", self.name, event));
    }
}

#[async_trait]
impl Extension for Recorder {
    async fn server_listening(&self, server: &Server) -> Result<()> {
        self.push(format!("listening:{}", server.service_name()));
        Ok(())
    }

    async fn incoming_request(&self, request: &Request) {
        self.push(format!("in:{}", request.method()));
    }

    async fn outgoing_response(
        &self,
        request: &Request,
        _response: &Response,
        _elapsed: Duration,
        status_code: i16,
    ) {
        self.push(format!("out:{}:{}", request.method(), status_code));
    }
}

struct FailingOnListen;

#[async_trait]
impl Extension for FailingOnListen {
    async fn server_listening(&self, _server: &Server) -> Result<()> {
        Err(RpcError::Publish("announce failed".to_string()))
    }
}

#[tokio::test]
async fn test_new_sets_up_topology() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;

    assert_eq!(server.topology_state(), TopologyState::TopologySet);
    assert_eq!(server.topology_setups(), 1);
    assert!(broker.queue_exists(SERVICE));
    assert_eq!(broker.declare_count(SERVICE), 1);
}

#[tokio::test]
async fn test_new_fails_when_setup_fails() {
    let broker = MemoryBroker::new();
    broker.set_fail_open_channel(true);

    let result = Server::new(Arc::new(broker.clone()), SERVICE, ServerOptions::default()).await;

    assert!(result.is_err());
    assert!(!broker.queue_exists(SERVICE));
}

#[tokio::test]
async fn test_echo_round_trip() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    server.add_extension(LoggingExtension);
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;

    let response = client
        .call("echo")
        .with_body_content_type("hello", "text/plain")
        .sync()
        .await
        .unwrap();

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.content_type(), "text/plain");
    assert_eq!(response.body().as_ref(), b"hello");
    wait_until(|| broker.acked() == 1).await;
}

#[tokio::test]
async fn test_extensions_run_in_order_around_handler() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    server.register("create", |_req: Request, mut res: Response| async move {
        res.empty(201);
        res
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    server.add_extension(Recorder {
        name: "a",
        events: events.clone(),
    });
    server.add_extension(Recorder {
        name: "b",
        events: events.clone(),
    });
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;

    let response = client.call("create").sync().await.unwrap();
    assert_eq!(response.status_code(), 201);

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "a:listening:calculator",
            "b:listening:calculator",
            "a:in:create",
            "b:in:create",
            "a:out:create:201",
            "b:out:create:201",
        ]
    );
}

#[tokio::test]
async fn test_failing_listen_hook_does_not_stop_server() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    server.add_extension(FailingOnListen);
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;

    let response = client.call("echo").with_body("still up").sync().await.unwrap();
    assert_eq!(response.body().as_ref(), b"still up");
}

#[tokio::test]
async fn test_unknown_method_is_rejected_and_caller_times_out() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;
    client.call("echo").sync().await.unwrap();

    let started = Instant::now();
    let result = client
        .call("missing")
        .with_timeout(Duration::from_millis(50))
        .sync()
        .await;

    assert!(matches!(result, Err(RpcError::TimedOut)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(client.pending_calls(), 0);
    wait_until(|| broker.rejected() == 1).await;
    assert_eq!(broker.requeued(), 0);
    assert_eq!(broker.acked(), 1);
}

#[tokio::test]
async fn test_malformed_request_is_rejected() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let _serving = spawn_serve(&server);

    publish_raw(&broker, None).await;
    publish_raw(&broker, Some("")).await;

    wait_until(|| broker.rejected() == 2).await;
    assert_eq!(broker.acked(), 0);
    assert!(!broker.queue_exists("raw-replies"));
}

#[tokio::test]
async fn test_auto_ack_never_settles() {
    let broker = MemoryBroker::new();
    let options = ServerOptions {
        auto_ack: true,
        ..Default::default()
    };
    let server = server_for(&broker, options).await;
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;

    client.call("echo").with_body("x").sync().await.unwrap();
    publish_raw(&broker, Some("missing")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.acked(), 0);
    assert_eq!(broker.rejected(), 0);
}

#[tokio::test]
async fn test_void_request_is_acked_without_reply() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;

    client.call("echo").with_body("fire").void().await.unwrap();

    wait_until(|| broker.acked() == 1).await;
    assert_eq!(broker.unroutable(), 0);
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;
    client.call("echo").with_body("warm up").sync().await.unwrap();

    let result = client
        .call("echo")
        .with_body("boom")
        .with_timeout(Duration::from_millis(100))
        .sync()
        .await;
    assert!(matches!(result, Err(RpcError::TimedOut)));
    wait_until(|| broker.rejected() == 1).await;

    let response = client.call("echo").with_body("after").sync().await.unwrap();
    assert_eq!(response.body().as_ref(), b"after");
}

#[tokio::test]
async fn test_bounded_concurrency() {
    let broker = MemoryBroker::new();
    let options = ServerOptions {
        max_concurrent_requests: Some(2),
        ..Default::default()
    };
    let server = server_for(&broker, options).await;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (counter, high) = (in_flight.clone(), peak.clone());
    server.register("slow", move |_req: Request, mut res: Response| {
        let counter = counter.clone();
        let high = high.clone();
        async move {
            let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
            high.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            counter.fetch_sub(1, Ordering::SeqCst);
            res.empty(204);
            res
        }
    });
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;

    let calls = (0..6).map(|_| client.call("slow").sync());
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_reconnection_sets_up_topology_once_and_resumes() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let _serving = spawn_serve(&server);
    let client = client_for(&broker).await;
    client.call("echo").with_body("before").sync().await.unwrap();

    let old_reply_queue = client.reply_queue();
    broker.disconnect();
    wait_until(|| server.topology_state() == TopologyState::TopologyLost).await;

    broker.reestablish();
    wait_until(|| server.topology_setups() == 2).await;
    wait_until(|| client.reply_queue() != old_reply_queue).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(server.topology_setups(), 2);
    assert_eq!(broker.declare_count(SERVICE), 2);
    assert_eq!(server.topology_state(), TopologyState::TopologySet);

    // Serving resumes within one poll interval of the new topology.
    let response = client
        .call("echo")
        .with_body("after")
        .with_timeout(SERVE_POLL_INTERVAL * 2)
        .sync()
        .await
        .unwrap();
    assert_eq!(response.body().as_ref(), b"after");
}

#[tokio::test]
async fn test_failed_setup_after_reconnection_waits_for_next_signal() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let _serving = spawn_serve(&server);

    // Let the serve loop pick up the consumer.
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.disconnect();
    wait_until(|| server.topology_state() == TopologyState::TopologyLost).await;

    broker.set_fail_open_channel(true);
    broker.reestablish();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.topology_state(), TopologyState::TopologyLost);
    assert_eq!(server.topology_setups(), 1);

    broker.set_fail_open_channel(false);
    broker.reestablish();
    wait_until(|| server.topology_state() == TopologyState::TopologySet).await;
    assert_eq!(server.topology_setups(), 2);
}

#[tokio::test]
async fn test_close_ends_serving_and_notifies() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let serving = spawn_serve(&server);
    let closed = server.notify_close();
    let also_closed = server.notify_close();

    tokio::time::sleep(Duration::from_millis(20)).await;
    server.close().await;

    tokio::time::timeout(Duration::from_secs(1), closed)
        .await
        .expect("close notified")
        .unwrap();
    also_closed.await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), serving)
        .await
        .expect("serve loop ended")
        .unwrap();

    // Late subscribers fire at once.
    tokio::time::timeout(Duration::from_millis(10), server.notify_close())
        .await
        .expect("late subscriber notified")
        .unwrap();
}

#[tokio::test]
async fn test_close_before_serving() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;

    server.close().await;
    server.notify_close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), server.listen_and_serve())
        .await
        .expect("serve returns once closed");

    // Closing twice is harmless.
    server.close().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_serve_loop() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    let serving = spawn_serve(&server);
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), server.shutdown())
        .await
        .expect("shutdown completes");

    assert!(serving.await.is_ok());
}

#[tokio::test]
async fn test_registry_introspection() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    server.register_with_spec(
        "add",
        |_req: Request, res: Response| async move { res },
        Spec::new("application/json").with_description("Adds two numbers"),
    );

    assert_eq!(server.service_name(), SERVICE);
    assert_eq!(server.registered_methods(), vec!["add", "echo"]);

    let specs = server.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs["add"].description, "Adds two numbers");
}

#[tokio::test]
async fn test_spec_announcer_publishes_specs() {
    let broker = MemoryBroker::new();
    let server = server_for(&broker, ServerOptions::default()).await;
    server.register_with_spec(
        "add",
        |_req: Request, res: Response| async move { res },
        Spec::new("application/json").with_request(json!({ "type": "array" })),
    );
    server.add_extension(SpecAnnouncer::new("specs"));
    let _serving = spawn_serve(&server);

    wait_until(|| broker.queue_exists("specs")).await;
    let channel = broker.open_channel().await.unwrap();
    let mut announcements = channel.consume("specs", true).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), announcements.next())
        .await
        .expect("announcement published")
        .unwrap();

    let announcement: SpecAnnouncement = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(announcement.service, SERVICE);
    assert_eq!(announcement.specs.len(), 1);
    assert_eq!(announcement.specs["add"].request, Some(json!({ "type": "array" })));
}
