//! Client fingerprints forwarded to backends as request headers.

pub mod client_hello;
mod http;
mod tcp;
mod tls;

pub use client_hello::{peek_client_hello, ClientHello};
pub use http::ja4h;
pub use tcp::{tcp_fingerprint, Ja4t};
pub use tls::{ja3n, ja4, TlsFingerprint};

use futures::future::BoxFuture;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::handler::{ConnectionInfo, Handler, ProxyBody};

pub const JA4H_HEADER: HeaderName = HeaderName::from_static("x-http-ja4h-fingerprint");
pub const JA3N_HEADER: HeaderName = HeaderName::from_static("x-tls-ja3n-fingerprint");
pub const JA4_HEADER: HeaderName = HeaderName::from_static("x-tls-ja4-fingerprint");
pub const JA4T_HEADER: HeaderName = HeaderName::from_static("x-tcp-ja4t-fingerprint");

const PEEK_TIMEOUT: Duration = Duration::from_secs(2);

/// Fingerprints captured once per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionFingerprint {
    pub tls: Option<TlsFingerprint>,
    pub tcp: Option<Ja4t>,
}

impl ConnectionFingerprint {
    /// Inspect a freshly accepted TLS connection before the handshake consumes it.
    pub async fn capture(stream: &TcpStream) -> Self {
        let tls = match tokio::time::timeout(PEEK_TIMEOUT, peek_client_hello(stream)).await {
            Ok(Some(record)) => match ClientHello::parse(&record) {
                Ok(hello) => Some(TlsFingerprint::from_client_hello(&hello)),
                Err(e) => {
                    debug!(error = %e, "can't parse ClientHello");
                    None
                }
            },
            _ => None,
        };

        let tcp = match tcp_fingerprint(stream) {
            Ok(fp) => Some(fp),
            Err(e) => {
                debug!(error = %e, "ja4t error");
                None
            }
        };

        Self { tls, tcp }
    }
}

/// Replace any client-supplied fingerprint headers with computed ones.
pub fn inject(headers: &mut HeaderMap, ja4h: &str, connection: Option<&ConnectionFingerprint>) {
    for name in [&JA4H_HEADER, &JA3N_HEADER, &JA4_HEADER, &JA4T_HEADER] {
        headers.remove(name);
    }

    let mut set = |name: &HeaderName, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name.clone(), value);
        }
    };

    set(&JA4H_HEADER, ja4h);

    let Some(connection) = connection else {
        return;
    };
    if let Some(tls) = &connection.tls {
        set(&JA3N_HEADER, &tls.ja3n);
        set(&JA4_HEADER, &tls.ja4);
    }
    if let Some(tcp) = &connection.tcp {
        set(&JA4T_HEADER, &tcp.to_string());
    }
}

/// Middleware adding fingerprint headers before the request is forwarded.
pub struct WithFingerprints {
    next: Arc<dyn Handler>,
}

impl WithFingerprints {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

impl Handler for WithFingerprints {
    fn call(&self, mut req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        let ja4h = ja4h(&req);
        let connection = req
            .extensions()
            .get::<Arc<ConnectionInfo>>()
            .map(|info| info.fingerprint.clone());
        inject(req.headers_mut(), &ja4h, connection.as_ref());
        self.next.call(req)
    }
}
