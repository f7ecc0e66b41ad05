//! Backend dispatch: one reverse proxy per domain, speaking HTTP/1.1 (plain or
//! TLS), cleartext HTTP/2 or HTTP/1.1 over a Unix domain socket.

use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::certs::crypto_provider;
use crate::config::{unix_socket_path, Domain, ResolvedTimeouts, ValidationError};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::handler::{BoxError, ConnectionInfo, Handler, ProxyBody};
use crate::limits::is_body_limit_error;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const MAX_IDLE_PER_HOST: usize = 10;

const HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid target URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported target scheme: {0}")]
    UnsupportedScheme(String),

    #[error("target {0} has no host")]
    MissingHost(String),

    #[error("h2c target must have a host")]
    H2cMissingHost,

    #[error("h2c target must use http:// or h2c:// scheme, got: {0}")]
    H2cScheme(String),

    #[error("unix target has an empty socket path")]
    EmptySocketPath,

    #[error("invalid target authority {authority}: {reason}")]
    InvalidAuthority { authority: String, reason: String },

    #[error(transparent)]
    Timeouts(#[from] ValidationError),

    #[error("can't configure backend TLS: {0}")]
    Tls(#[from] rustls::Error),
}

/// Where requests are rewritten to point.
#[derive(Debug, Clone)]
struct Target {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl Target {
    fn from_url(url: &Url, scheme: Scheme, default_port: Option<u16>) -> Result<Self, BackendError> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BackendError::MissingHost(url.to_string()))?;

        let authority = match url.port().or(default_port) {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let authority = authority
            .parse::<Authority>()
            .map_err(|e| BackendError::InvalidAuthority {
                authority: authority.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            scheme,
            authority,
            base_path: url.path().to_string(),
            base_query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// Target path prefix joined with the request path; queries merged with `&`.
    fn path_and_query(&self, uri: &Uri) -> String {
        let path = join_path(&self.base_path, uri.path());
        let query = match (self.base_query.as_deref(), uri.query().filter(|q| !q.is_empty())) {
            (Some(base), Some(query)) => Some(format!("{base}&{query}")),
            (Some(base), None) => Some(base.to_string()),
            (None, query) => query.map(str::to_string),
        };
        match query {
            Some(query) => format!("{path}?{query}"),
            None => path,
        }
    }
}

fn join_path(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;
type H2cClient = Client<HttpConnector, ProxyBody>;

enum Transport {
    Http(HttpClient),
    H2c(H2cClient),
    Unix(PathBuf),
}

impl Transport {
    fn kind(&self) -> &'static str {
        match self {
            Transport::Http(_) => "http",
            Transport::H2c(_) => "h2c",
            Transport::Unix(_) => "unix",
        }
    }
}

/// Reverse proxy to a single domain's backend.
pub struct ReverseProxy {
    domain: String,
    target: Target,
    host_header: Option<HeaderValue>,
    transport: Transport,
    response_header_timeout: Option<Duration>,
}

impl ReverseProxy {
    /// Pick the dispatch strategy from the target's scheme.
    pub fn new(name: &str, domain: &Domain) -> Result<Self, BackendError> {
        if let Some(path) = unix_socket_path(&domain.target) {
            return Self::unix(name, path);
        }

        let url = Url::parse(&domain.target).map_err(|e| BackendError::InvalidUrl {
            url: domain.target.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Self::http(
                name,
                &url,
                domain.insecure_skip_verify,
                domain.timeouts.resolve()?,
            ),
            "h2c" => Self::h2c(name, &url),
            other => Err(BackendError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn http(
        name: &str,
        url: &Url,
        insecure_skip_verify: bool,
        timeouts: ResolvedTimeouts,
    ) -> Result<Self, BackendError> {
        let (scheme, default_port) = match url.scheme() {
            "https" => (Scheme::HTTPS, None),
            "http" => (Scheme::HTTP, None),
            other => return Err(BackendError::UnsupportedScheme(other.to_string())),
        };
        let target = Target::from_url(url, scheme, default_port)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(timeouts.dial);

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_client_config(insecure_skip_verify)?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(timeouts.idle)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_timer(TokioTimer::new())
            .build(https);

        Ok(Self {
            domain: name.to_string(),
            host_header: HeaderValue::from_str(target.authority.as_str()).ok(),
            target,
            transport: Transport::Http(client),
            response_header_timeout: timeouts.response_header,
        })
    }

    /// Prior-knowledge HTTP/2 over plain TCP. No TLS and no ALPN.
    pub fn h2c(name: &str, url: &Url) -> Result<Self, BackendError> {
        match url.scheme() {
            "http" | "h2c" => {}
            other => return Err(BackendError::H2cScheme(other.to_string())),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(BackendError::H2cMissingHost);
        }
        let target = Target::from_url(url, Scheme::HTTP, Some(80))?;

        let mut http = HttpConnector::new();
        http.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .pool_timer(TokioTimer::new())
            .build(http);

        Ok(Self {
            domain: name.to_string(),
            target,
            host_header: None,
            transport: Transport::H2c(client),
            response_header_timeout: None,
        })
    }

    /// HTTP/1.1 over a Unix domain socket; the backend sees the domain as Host.
    pub fn unix(name: &str, socket: &str) -> Result<Self, BackendError> {
        if socket.is_empty() {
            return Err(BackendError::EmptySocketPath);
        }

        Ok(Self {
            domain: name.to_string(),
            target: Target {
                scheme: Scheme::HTTP,
                authority: Authority::from_static("localhost"),
                base_path: String::new(),
                base_query: None,
            },
            host_header: HeaderValue::from_str(name).ok(),
            transport: Transport::Unix(PathBuf::from(socket)),
            response_header_timeout: None,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.transport.kind()
    }

    fn rewrite(&self, mut req: Request<ProxyBody>, upgrade: Option<HeaderValue>) -> Request<ProxyBody> {
        let info = req.extensions().get::<Arc<ConnectionInfo>>().cloned();
        let original_host = req.headers().get(HOST).cloned().or_else(|| {
            req.uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

        let path_and_query = PathAndQuery::try_from(self.target.path_and_query(req.uri()))
            .unwrap_or_else(|_| PathAndQuery::from_static("/"));
        let mut parts = hyper::http::uri::Parts::default();
        parts.path_and_query = Some(path_and_query);
        if !matches!(self.transport, Transport::Unix(_)) {
            parts.scheme = Some(self.target.scheme.clone());
            parts.authority = Some(self.target.authority.clone());
        }
        if let Ok(uri) = Uri::from_parts(parts) {
            *req.uri_mut() = uri;
        }

        *req.version_mut() = match self.transport {
            Transport::H2c(_) => Version::HTTP_2,
            _ => Version::HTTP_11,
        };

        let headers = req.headers_mut();
        remove_hop_by_hop(headers);
        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol);
        }

        match &self.host_header {
            Some(host) => {
                headers.insert(HOST, host.clone());
            }
            None => {
                headers.remove(HOST);
            }
        }

        // Overwritten, never appended: this proxy is the first trusted hop.
        if let Some(addr) = info.as_ref().and_then(|i| i.remote_addr) {
            if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        } else {
            headers.remove(X_FORWARDED_FOR);
        }
        match original_host {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, host);
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
        let proto = if info.is_some_and(|i| i.tls) { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        if !headers.contains_key(X_REQUEST_ID) {
            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                headers.insert(X_REQUEST_ID, value);
            }
        }

        req
    }

    async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, BoxError> {
        match &self.transport {
            Transport::Http(client) => client.request(req).await.map_err(BoxError::from),
            Transport::H2c(client) => client.request(req).await.map_err(BoxError::from),
            Transport::Unix(path) => send_unix(path.clone(), req).await,
        }
    }

    async fn forward(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let client_upgrade = match (&self.transport, upgrade_protocol(&req)) {
            (Transport::Http(_) | Transport::Unix(_), Some(protocol)) => {
                Some((protocol, hyper::upgrade::on(&mut req)))
            }
            _ => None,
        };
        let (protocol, client_upgrade) = match client_upgrade {
            Some((protocol, on)) => (Some(protocol), Some(on)),
            None => (None, None),
        };

        let req = self.rewrite(req, protocol);
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        debug!(
            domain = %self.domain,
            backend = self.kind(),
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "forwarding request"
        );

        let sent = self.send(req);
        let result = match self.response_header_timeout {
            Some(limit) => match tokio::time::timeout(limit, sent).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        domain = %self.domain,
                        request_id,
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "backend response timed out"
                    );
                    return json_error_response(
                        ProxyErrorCode::GatewayTimeout,
                        "Backend did not respond in time",
                    );
                }
            },
            None => sent.await,
        };

        let mut resp = match result {
            Ok(resp) => resp,
            Err(e) => return self.error_response(&request_id, e),
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client) = client_upgrade {
                let backend = hyper::upgrade::on(&mut resp);
                tokio::spawn(splice(client, backend, self.domain.clone(), request_id));
            }
        } else {
            remove_hop_by_hop(resp.headers_mut());
        }

        resp.map(|body| body.map_err(BoxError::from).boxed())
    }

    fn error_response(&self, request_id: &str, err: BoxError) -> Response<ProxyBody> {
        if is_body_limit_error(&*err) {
            debug!(domain = %self.domain, request_id, "request body exceeded limit");
            return json_error_response(ProxyErrorCode::PayloadTooLarge, "Payload Too Large");
        }

        warn!(domain = %self.domain, request_id, error = %err, "backend request failed");
        json_error_response(ProxyErrorCode::BadGateway, "Failed to reach backend")
    }
}

impl Handler for ReverseProxy {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin(self.forward(req))
    }
}

#[cfg(unix)]
async fn send_unix(path: PathBuf, req: Request<ProxyBody>) -> Result<Response<Incoming>, BoxError> {
    let stream = tokio::net::UnixStream::connect(&path).await?;
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, ProxyBody>(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(socket = %path.display(), error = %e, "unix backend connection error");
        }
    });

    Ok(sender.send_request(req).await?)
}

#[cfg(not(unix))]
async fn send_unix(_path: PathBuf, _req: Request<ProxyBody>) -> Result<Response<Incoming>, BoxError> {
    Err("unix socket backends are not supported on this platform".into())
}

/// The requested protocol when the client asks for an HTTP/1.1 upgrade.
fn upgrade_protocol<B>(req: &Request<B>) -> Option<HeaderValue> {
    let wants_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        req.headers().get(UPGRADE).cloned()
    } else {
        None
    }
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

async fn splice(client: OnUpgrade, backend: OnUpgrade, domain: String, request_id: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(domain, request_id, error = %e, "upgrade failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                domain,
                request_id,
                client_to_backend,
                backend_to_client,
                "upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(domain, request_id, error = %e, "upgraded connection closed with error");
        }
    }
}

fn native_roots() -> Arc<RootCertStore> {
    static ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    ROOTS
        .get_or_init(|| {
            let result = rustls_native_certs::load_native_certs();
            for e in &result.errors {
                warn!(error = %e, "can't load native root certificate");
            }
            let mut store = RootCertStore::empty();
            let (added, ignored) = store.add_parsable_certificates(result.certs);
            debug!(added, ignored, "loaded native root certificates");
            Arc::new(store)
        })
        .clone()
}

fn tls_client_config(insecure_skip_verify: bool) -> Result<ClientConfig, BackendError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(native_roots())
            .with_no_client_auth()
    };
    Ok(config)
}

/// Accepts any backend certificate but still checks handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
