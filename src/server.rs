//! Accept loops for the plain HTTP, HTTPS and metrics listeners.

use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::fingerprint::ConnectionFingerprint;
use crate::handler::{full, BoxError, ConnectionInfo, Handler, ProxyBody};
use crate::router::{strip_port, Router};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// One listener and the handler behind it.
pub struct ProxyServer {
    name: &'static str,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
}

impl ProxyServer {
    pub fn new(name: &'static str, listener: TcpListener, handler: Arc<dyn Handler>) -> Self {
        Self {
            name,
            listener,
            tls_acceptor: None,
            handler,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `token` is cancelled. The listener and every open
    /// connection are closed on cancellation.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(server = self.name, addr = %addr, "listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let token = token.clone();
                            let name = self.name;

                            tokio::spawn(async move {
                                if let Err(e) = accept(stream, addr, tls_acceptor, handler, token).await {
                                    debug!(server = name, addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(server = self.name, error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = token.cancelled() => {
                    info!(server = self.name, "server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn accept(
    stream: TcpStream,
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let Some(acceptor) = tls_acceptor else {
        let info = ConnectionInfo {
            remote_addr: Some(addr),
            ..Default::default()
        };
        return handle_connection(stream, info, handler, token).await;
    };

    // The ClientHello must be peeked before the handshake consumes it.
    let fingerprint = ConnectionFingerprint::capture(&stream).await;
    let tls_stream = tokio::select! {
        result = acceptor.accept(stream) => result.map_err(|e| anyhow::anyhow!("TLS handshake failed: {e}"))?,
        _ = token.cancelled() => return Ok(()),
    };

    let info = ConnectionInfo {
        remote_addr: Some(addr),
        tls: true,
        fingerprint,
    };
    handle_connection(tls_stream, info, handler, token).await
}

async fn handle_connection<S>(
    stream: S,
    info: ConnectionInfo,
    handler: Arc<dyn Handler>,
    token: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let info = Arc::new(info);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let info = Arc::clone(&info);
        async move {
            let mut req = req.map(|body| body.map_err(BoxError::from).boxed());
            req.extensions_mut().insert(info);
            Ok::<_, Infallible>(handler.call(req).await)
        }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);
    let conn = builder.serve_connection_with_upgrades(io, service);

    tokio::select! {
        result = conn => result.map_err(|e| anyhow::anyhow!("connection error: {e}")),
        _ = token.cancelled() => Ok(()),
    }
}

/// Plain-HTTP front for the router: while autocert domains exist it answers
/// ACME HTTP-01 challenges and redirects everything else to HTTPS.
pub struct HttpEntry {
    router: Arc<Router>,
    https_port: u16,
}

impl HttpEntry {
    pub fn new(router: Arc<Router>, https_port: u16) -> Self {
        Self { router, https_port }
    }
}

impl Handler for HttpEntry {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        let Some((store, redirect_code)) = self.router.autocert() else {
            return self.router.call(req);
        };

        let resp = match req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            Some(token) => match store.http01_key_authorization(token) {
                Some(key_auth) => {
                    debug!(token, "responding to ACME HTTP-01 challenge");
                    plain(StatusCode::OK, key_auth)
                }
                None => plain(StatusCode::NOT_FOUND, "unknown challenge token"),
            },
            None => build_https_redirect(&req, self.https_port, redirect_code),
        };
        Box::pin(async move { resp })
    }
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full(body.into()))
        .expect("valid response with StatusCode enum and static headers")
}

fn build_https_redirect<B>(req: &Request<B>, https_port: u16, code: StatusCode) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .map(strip_port)
        .unwrap_or("localhost");

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    };

    Response::builder()
        .status(code)
        .header(LOCATION, location)
        .header(CONTENT_TYPE, "text/plain")
        .body(full("Redirecting to HTTPS"))
        .expect("valid redirect response")
}
