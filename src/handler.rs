//! The request handler seam shared by middleware, backends and the router.

use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::future::Future;
use std::net::SocketAddr;

use crate::fingerprint::ConnectionFingerprint;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used for requests and responses throughout the proxy.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Something that turns a request into a response. Failures are expressed as
/// error responses, never as `Err`.
pub trait Handler: Send + Sync {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>>;
}

/// Per-connection facts attached to every request's extensions.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub tls: bool,
    pub fingerprint: ConnectionFingerprint,
}

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Adapt an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    HandlerFn(f)
}

pub struct HandlerFn<F>(F);

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin((self.0)(req))
    }
}
