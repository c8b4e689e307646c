//! Method handlers and the extension pipeline wrapped around them.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::future::BoxFuture;

use super::extension::Extension;
use super::request::Request;
use crate::response::Response;

/// Handler for one remote method.
///
/// Receives the request and an empty response, and returns the response to
/// publish. Implemented for any matching async closure:
///
/// ```ignore
/// server.register("echo", |req: Request, mut res: Response| async move {
///     res.raw(200, req.content_type(), req.body().clone());
///     res
/// });
/// ```
pub trait MethodHandler: Send + Sync + 'static {
    fn handle(&self, request: Request, response: Response) -> BoxFuture<'static, Response>;
}

impl<F, Fut> MethodHandler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(&self, request: Request, response: Response) -> BoxFuture<'static, Response> {
        Box::pin(self(request, response))
    }
}

/// Extensions in registration order.
pub(crate) type Extensions = Arc<RwLock<Vec<Arc<dyn Extension>>>>;

/// A registered handler with the server's extensions around it.
///
/// Extensions are read at call time, so ones added after registration still
/// apply.
pub(crate) struct ExtendedHandler {
    handler: Box<dyn MethodHandler>,
    extensions: Extensions,
}

impl ExtendedHandler {
    pub(crate) fn new(handler: Box<dyn MethodHandler>, extensions: Extensions) -> Self {
        Self {
            handler,
            extensions,
        }
    }

    /// Run incoming hooks, the handler, then outgoing hooks with the elapsed
    /// handler time and final status code.
    pub(crate) async fn call(&self, request: Request, response: Response) -> Response {
        let extensions: Vec<_> = self
            .extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for extension in &extensions {
            extension.incoming_request(&request).await;
        }

        let started = Instant::now();
        let response = self.handler.handle(request.clone(), response).await;
        let elapsed = started.elapsed();

        for extension in &extensions {
            extension
                .outgoing_response(&request, &response, elapsed, response.status_code())
                .await;
        }

        response
    }
}
