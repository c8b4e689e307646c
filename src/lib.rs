//! Angzarr RPC - request/response over AMQP
//!
//! A [`Client`] publishes calls to a service's durable queue and correlates
//! replies arriving on its exclusive reply queue. A [`Server`] consumes the
//! service queue, dispatches each request to a registered handler wrapped by
//! [`Extension`]s, and publishes the handler's [`Response`] back to the caller.
//!
//! Both sides run over the [`broker::Broker`] abstraction: RabbitMQ via
//! [`broker::amqp`] (feature `amqp`) or [`broker::MemoryBroker`] for tests.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
mod response;
pub mod server;
pub mod utils;

pub use client::{Call, Client, CorrelationId, Slot};
pub use error::{Result, RpcError};
pub use response::Response;
pub use server::{
    Extension, LoggingExtension, MethodHandler, Request, Server, ServerOptions, Spec,
    SpecAnnouncer, TopologyState,
};
