//! angzarr-rpc-echo: Demo RPC service
//!
//! Serves two methods on the configured service queue:
//! - `echo`: returns the request body and content type unchanged
//! - `add`: sums a JSON array of numbers
//!
//! ## Configuration
//! - ANGZARR_RPC_CONFIG: Path to a YAML config file (optional)
//! - ANGZARR_RPC__AMQP__URL: Broker URL (default: amqp://localhost:5672)
//! - ANGZARR_RPC__SERVER__SERVICE_NAME: Queue to serve (default: echo)
//! - ANGZARR_RPC_LOG: Log filter (default: info)
//!
//! Runs until interrupted with Ctrl-C.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use angzarr_rpc::broker::amqp::{AmqpBroker, AmqpBrokerConfig};
use angzarr_rpc::config::RpcConfig;
use angzarr_rpc::utils::bootstrap::{connect_with_retry, init_tracing};
use angzarr_rpc::{LoggingExtension, Request, Response, Server, Spec, SpecAnnouncer};

async fn echo(request: Request, mut response: Response) -> Response {
    response.raw(
        200,
        request.content_type().to_string(),
        request.body().clone(),
    );
    response
}

async fn add(request: Request, mut response: Response) -> Response {
    let summed = request
        .deserialize::<Vec<f64>>()
        .map(|numbers| numbers.iter().sum::<f64>());

    let written = match summed {
        Ok(sum) => response.json(200, &sum),
        Err(e) => response.json(400, &json!({ "error": e.to_string() })),
    };
    if let Err(e) = written {
        error!(error = %e, "Failed to encode response");
        response.empty(500);
    }
    response
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = RpcConfig::load(path.as_deref())?;

    let broker_config = AmqpBrokerConfig {
        url: config.amqp.url.clone(),
        pool_size: config.amqp.pool_size,
    };
    let broker =
        connect_with_retry("rabbitmq", || AmqpBroker::connect(broker_config.clone())).await?;

    let server = Server::new(
        Arc::new(broker),
        config.server.service_name.clone(),
        config.server.options(),
    )
    .await?;

    server.add_extension(LoggingExtension);
    server.add_extension(SpecAnnouncer::default());
    server.register_with_spec(
        "echo",
        echo,
        Spec::new("application/octet-stream").with_description("Returns the request body"),
    );
    server.register_with_spec(
        "add",
        add,
        Spec::new("application/json")
            .with_description("Sums a list of numbers")
            .with_request(json!({ "type": "array", "items": { "type": "number" } }))
            .with_response(json!({ "type": "number" })),
    );

    let serving = server.clone();
    let serve = tokio::spawn(async move { serving.listen_and_serve().await });

    info!(service = %config.server.service_name, "angzarr-rpc-echo started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.shutdown().await;
    serve.await?;

    Ok(())
}
