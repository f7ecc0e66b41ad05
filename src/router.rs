//! Host-based routing with an atomically swapped table.
//!
//! A [`Table`] holds every domain's handler chain and certificate. It is built
//! completely from a validated configuration and only then published, so a
//! request or handshake always sees one consistent table, never a mix of two.

use anyhow::Context as _;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};
use metrics::{counter, gauge, histogram};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::backend::{BackendError, ReverseProxy};
use crate::certs::{load_certified_key, AutocertStore, KeypairError};
use crate::config::{Domain, Toplevel, ValidationError};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::fingerprint::WithFingerprints;
use crate::handler::{BoxError, ConnectionInfo, Handler, ProxyBody};
use crate::limits::WithLimits;
use crate::logging::access::{AccessEntry, AccessLog};
use crate::logging::filter::{CompiledFilter, LogFilters};
use crate::metrics::{
    CERTIFICATE_MISSES, CONFIG_RELOADS, REQUEST_COUNT, RESPONSE_TIME, UNRESOLVED_REQUESTS,
};

/// Longest valid DNS name
const MAX_HOSTNAME_LEN: usize = 253;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("this server does not have a certificate for that domain")]
    NoCertificate,
}

/// Why one domain could not be compiled into the table.
#[derive(Debug, thiserror::Error)]
pub enum DomainBuildError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Keypair(#[from] KeypairError),

    #[error("domain is configured more than once")]
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid domain {name}: {source}")]
pub struct DomainError {
    pub name: String,
    #[source]
    pub source: DomainBuildError,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("can't compile config to routing map:\n{}", list(.0))]
    Domains(Vec<DomainError>),

    #[error("can't compile log filters: {0}")]
    Filters(ValidationError),
}

fn list(errs: &[DomainError]) -> String {
    errs.iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl BuildError {
    /// Names of the domains that failed to build.
    pub fn domains(&self) -> Vec<&str> {
        match self {
            BuildError::Domains(errs) => errs.iter().map(|e| e.name.as_str()).collect(),
            BuildError::Filters(_) => Vec::new(),
        }
    }
}

/// Routes and certificates for one configuration generation.
pub struct Table {
    routes: HashMap<String, Arc<dyn Handler>>,
    certs: HashMap<String, Arc<CertifiedKey>>,
    autocert: Option<Arc<AutocertStore>>,
    redirect_code: StatusCode,
    access_log: Option<Arc<AccessLog>>,
    filters: Vec<CompiledFilter>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            certs: HashMap::new(),
            autocert: None,
            redirect_code: StatusCode::MOVED_PERMANENTLY,
            access_log: None,
            filters: Vec::new(),
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("routes", &self.domains())
            .field("certs", &self.certs.len())
            .field("autocert", &self.autocert)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Compile every domain. Any failure discards the whole table and the
    /// error lists every failing domain.
    pub fn build(config: &Toplevel) -> Result<Self, BuildError> {
        let mut table = Table::default();
        let mut errs = Vec::new();

        for domain in &config.domains {
            if let Err(source) = table.add_domain(config, domain) {
                errs.push(DomainError {
                    name: domain.name.clone(),
                    source,
                });
            }
        }
        if !errs.is_empty() {
            return Err(BuildError::Domains(errs));
        }

        table.filters = config
            .logging
            .compile_filters()
            .map_err(BuildError::Filters)?;

        if let Some(autocert) = &config.autocert {
            let hosts = config.autocert_hosts();
            if !hosts.is_empty() {
                table.autocert = Some(Arc::new(AutocertStore::new(&autocert.cache_dir, hosts)));
            }
            table.redirect_code = StatusCode::from_u16(autocert.http_redirect_code)
                .unwrap_or(StatusCode::MOVED_PERMANENTLY);
        }

        table.access_log = AccessLog::from_config(&config.logging).map(Arc::new);
        Ok(table)
    }

    fn add_domain(&mut self, config: &Toplevel, domain: &Domain) -> Result<(), DomainBuildError> {
        domain.valid()?;
        let name = domain.ascii_name()?;
        if self.routes.contains_key(&name) {
            return Err(DomainBuildError::Duplicate);
        }
        if domain.tls.autocert && config.autocert.is_none() {
            return Err(ValidationError::AutocertNotConfigured(domain.name.clone()).into());
        }

        let proxy = ReverseProxy::new(&name, domain)?;
        debug!(domain = %name, backend = proxy.kind(), target = %domain.target, "compiled route");

        let handler: Arc<dyn Handler> = Arc::new(WithLimits::new(
            name.clone(),
            &domain.limits,
            Arc::new(WithFingerprints::new(Arc::new(proxy))),
        ));

        if let (Some(cert), Some(key)) = (&domain.tls.cert, &domain.tls.key) {
            self.certs.insert(name.clone(), load_certified_key(cert, key)?);
        }
        self.routes.insert(name, handler);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routed domain names, sorted.
    pub fn domains(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Add a handler directly, bypassing configuration.
    pub fn insert_route(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.insert(name.into(), handler);
    }

    pub fn set_access_log(&mut self, log: Option<Arc<AccessLog>>) {
        self.access_log = log;
    }
}

/// Counters readable without a metrics recorder.
#[derive(Debug, Default)]
pub struct RouterStats {
    unresolved_requests: AtomicU64,
    certificate_misses: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
}

impl RouterStats {
    pub fn unresolved_requests(&self) -> u64 {
        self.unresolved_requests.load(Ordering::Relaxed)
    }

    pub fn certificate_misses(&self) -> u64 {
        self.certificate_misses.load(Ordering::Relaxed)
    }

    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn reload_failures(&self) -> u64 {
        self.reload_failures.load(Ordering::Relaxed)
    }
}

pub struct Router {
    table: ArcSwap<Table>,
    log_filters: LogFilters,
    stats: RouterStats,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("table", &**self.table.load())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_log_filters(LogFilters::default())
    }

    /// A router that publishes each table's log filters into `log_filters`.
    pub fn with_log_filters(log_filters: LogFilters) -> Self {
        Self {
            table: ArcSwap::from_pointee(Table::default()),
            log_filters,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn domains(&self) -> Vec<String> {
        self.table
            .load()
            .domains()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Build a table from `config` and publish it. On error the live table is untouched.
    pub fn set_config(&self, config: &Toplevel) -> Result<usize, BuildError> {
        let table = Table::build(config)?;
        let routes = table.len();
        self.swap(table);
        Ok(routes)
    }

    /// Publish a fully built table in one atomic step.
    pub fn swap(&self, mut table: Table) {
        self.log_filters.replace(std::mem::take(&mut table.filters));
        let old = self.table.swap(Arc::new(table));
        if let Some(log) = &old.access_log {
            log.rotate();
        }
    }

    /// Read, validate, build and swap the configuration at `path`.
    pub fn reload(&self, path: &Path) -> anyhow::Result<usize> {
        let result = Toplevel::load(path)
            .map_err(anyhow::Error::from)
            .and_then(|config| self.set_config(&config).map_err(anyhow::Error::from))
            .with_context(|| format!("can't reload configuration from {}", path.display()));

        match &result {
            Ok(routes) => {
                self.stats.reloads.fetch_add(1, Ordering::Relaxed);
                counter!(CONFIG_RELOADS, "result" => "success").increment(1);
                info!(path = %path.display(), routes, "configuration reloaded");
            }
            Err(e) => {
                self.stats.reload_failures.fetch_add(1, Ordering::Relaxed);
                counter!(CONFIG_RELOADS, "result" => "failure").increment(1);
                error!(path = %path.display(), error = %format_args!("{e:#}"), "configuration reload failed");
            }
        }
        result
    }

    /// Certificate for a TLS server name. Never falls back to another domain's.
    pub fn lookup_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, RouterError> {
        let name = server_name.to_ascii_lowercase();
        let table = self.table.load();

        if let Some(cert) = table.certs.get(&name) {
            return Ok(cert.clone());
        }
        if let Some(cert) = table.autocert.as_ref().and_then(|s| s.certificate(&name)) {
            return Ok(cert);
        }

        self.stats.certificate_misses.fetch_add(1, Ordering::Relaxed);
        counter!(CERTIFICATE_MISSES).increment(1);
        debug!(server_name, "no certificate for server name");
        Err(RouterError::NoCertificate)
    }

    /// The autocert store and redirect status, when any domain uses autocert.
    pub fn autocert(&self) -> Option<(Arc<AutocertStore>, StatusCode)> {
        let table = self.table.load();
        let store = table.autocert.clone()?;
        Some((store, table.redirect_code))
    }

    pub async fn serve_request(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let host = request_host(&req);
        let (handler, access_log) = {
            let table = self.table.load();
            let handler = host.as_ref().and_then(|h| table.routes.get(h).cloned());
            (handler, table.access_log.clone())
        };

        let (Some(host), Some(handler)) = (host, handler) else {
            let unresolved = self.stats.unresolved_requests.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!(UNRESOLVED_REQUESTS).set(unresolved as f64);
            debug!(host = ?req.headers().get(HOST), uri = %req.uri(), "no route for host");
            return json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host");
        };

        let access = access_log.map(|log| {
            let remote_addr = req
                .extensions()
                .get::<Arc<ConnectionInfo>>()
                .and_then(|info| info.remote_addr);
            (log, AccessEntry::from_request(&req, &host, remote_addr))
        });
        let method = req.method().to_string();
        let started = Instant::now();

        let resp = handler.call(req).await;

        let status = resp.status().as_u16();
        resp.map(|inner| {
            ProxyBody::new(ObservedBody {
                inner,
                host,
                method,
                status,
                bytes: 0,
                started,
                access,
            })
        })
    }
}

impl Handler for Router {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin(self.serve_request(req))
    }
}

impl ResolvesServerCert for Router {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.lookup_certificate(server_name).ok()
    }
}

/// Lowercase host from the Host header (or the request target for HTTP/2),
/// port removed. `None` when absent or malformed.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let host = strip_port(raw.trim());
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    let valid = if host.starts_with('[') {
        host.ends_with(']')
            && host[1..host.len() - 1]
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    } else {
        host.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    };
    valid.then(|| host.to_ascii_lowercase())
}

pub(crate) fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Response body that records request metrics and the access log line once
/// the body has been fully sent or abandoned.
struct ObservedBody {
    inner: ProxyBody,
    host: String,
    method: String,
    status: u16,
    bytes: u64,
    started: Instant,
    access: Option<(Arc<AccessLog>, AccessEntry)>,
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &poll {
            if let Some(data) = frame.data_ref() {
                this.bytes += data.len() as u64;
            }
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        counter!(
            REQUEST_COUNT,
            "domain" => self.host.clone(),
            "method" => std::mem::take(&mut self.method),
            "status" => self.status.to_string()
        )
        .increment(1);
        histogram!(RESPONSE_TIME, "domain" => std::mem::take(&mut self.host))
            .record(elapsed.as_secs_f64() * 1000.0);

        if let Some((log, entry)) = &self.access {
            log.write(&entry.format(self.status, self.bytes, elapsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testutil::write_keypair;
    use crate::handler::{full, handler_fn};
    use crate::logging::access::RotationPolicy;
    use http_body_util::BodyExt;

    fn ok_handler(body: &'static str) -> Arc<dyn Handler> {
        Arc::new(handler_fn(move |_req: Request<ProxyBody>| async move {
            Response::new(full(body))
        }))
    }

    fn request(host: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri("/")
            .header(HOST, host)
            .body(full(""))
            .unwrap()
    }

    async fn body_string(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn domain_toml(name: &str, target: &str, cert: &Path, key: &Path) -> String {
        format!(
            r#"
[[domain]]
name = "{name}"
target = "{target}"
health_target = "{target}"
allow_private_target = true

[domain.tls]
cert = "{}"
key = "{}"
"#,
            cert.display(),
            key.display()
        )
    }

    #[test]
    fn test_request_host() {
        assert_eq!(request_host(&request("A.Example:8080")).as_deref(), Some("a.example"));
        assert_eq!(request_host(&request("[::1]:443")).as_deref(), Some("[::1]"));
        assert_eq!(request_host(&request("a.example")).as_deref(), Some("a.example"));
        assert_eq!(request_host(&request("bad host")), None);
        assert_eq!(request_host(&request("")), None);

        let h2 = Request::builder()
            .uri("https://b.example:8443/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&h2).as_deref(), Some("b.example"));
    }

    #[tokio::test]
    async fn test_routes_by_host() {
        let router = Router::new();
        let mut table = Table::default();
        table.insert_route("a.example", ok_handler("A"));
        table.insert_route("b.example", ok_handler("B"));
        router.swap(table);

        let resp = router.serve_request(request("a.example:80")).await;
        assert_eq!(body_string(resp).await, "A");
        let resp = router.serve_request(request("B.EXAMPLE")).await;
        assert_eq!(body_string(resp).await, "B");
    }

    #[tokio::test]
    async fn test_unknown_host_counts_once() {
        let router = Router::new();
        let mut table = Table::default();
        table.insert_route("a.example", ok_handler("A"));
        router.swap(table);

        let resp = router.serve_request(request("c.example")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["x-proxy-error"], "UNKNOWN_HOST");
        assert_eq!(router.stats().unresolved_requests(), 1);

        let resp = router.serve_request(request("bad host")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(router.stats().unresolved_requests(), 2);

        router.serve_request(request("a.example")).await;
        assert_eq!(router.stats().unresolved_requests(), 2);
    }

    #[test]
    fn test_build_fails_on_any_invalid_domain() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_keypair(dir.path(), "a.example");
        let toml = format!(
            "{}{}{}",
            domain_toml("a.example", "http://127.0.0.1:3000", &cert, &key),
            domain_toml("broken.example", "ftp://127.0.0.1:21", &cert, &key),
            domain_toml("c.example", "h2c://127.0.0.1:3001", &cert, &key),
        );
        let config: Toplevel = toml::from_str(&toml).unwrap();

        let router = Router::new();
        let mut old = Table::default();
        old.insert_route("old.example", ok_handler("old"));
        router.swap(old);

        let err = router.set_config(&config).unwrap_err();
        assert_eq!(err.domains(), vec!["broken.example"]);
        let message = err.to_string();
        assert!(message.starts_with("can't compile config to routing map"), "{message}");
        assert!(message.contains("invalid domain broken.example"), "{message}");

        assert_eq!(router.domains(), vec!["old.example".to_string()]);
    }

    #[test]
    fn test_build_and_lookup_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_keypair(dir.path(), "a.example");
        let config: Toplevel = toml::from_str(&domain_toml(
            "a.example",
            "http://127.0.0.1:3000",
            &cert,
            &key,
        ))
        .unwrap();

        let router = Router::new();
        assert_eq!(router.set_config(&config).unwrap(), 1);
        assert!(router.lookup_certificate("A.example").is_ok());

        let err = router.lookup_certificate("unknown.example").unwrap_err();
        assert_eq!(
            err.to_string(),
            "this server does not have a certificate for that domain"
        );
        assert_eq!(router.stats().certificate_misses(), 1);
    }

    #[test]
    fn test_swap_publishes_log_filters() {
        let filters = LogFilters::default();
        let router = Router::with_log_filters(filters.clone());

        let config: Toplevel = toml::from_str(
            r#"
[[logging.filter]]
name = "quiet"
expression = 'level == "DEBUG"'
"#,
        )
        .unwrap();
        router.set_config(&config).unwrap();
        assert_eq!(filters.len(), 1);

        router.set_config(&Toplevel::default()).unwrap();
        assert!(filters.is_empty());
    }

    #[test]
    fn test_reload_failure_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostgate.toml");
        std::fs::write(&path, "[bind]\nhttp = \"nonsense\"\n").unwrap();

        let router = Router::new();
        let mut table = Table::default();
        table.insert_route("a.example", ok_handler("A"));
        router.swap(table);

        assert!(router.reload(&path).is_err());
        assert_eq!(router.stats().reload_failures(), 1);
        assert_eq!(router.domains(), vec!["a.example".to_string()]);

        std::fs::write(&path, "").unwrap();
        assert_eq!(router.reload(&path).unwrap(), 0);
        assert_eq!(router.stats().reloads(), 1);
        assert!(router.domains().is_empty());
    }

    #[tokio::test]
    async fn test_access_log_written_when_body_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = Arc::new(AccessLog::new(
            &path,
            RotationPolicy {
                max_size_bytes: 1024 * 1024,
                max_age: None,
                max_backups: 0,
                compress: false,
            },
        ));

        let router = Router::new();
        let mut table = Table::default();
        table.insert_route("a.example", ok_handler("hello"));
        table.set_access_log(Some(log));
        router.swap(table);

        let resp = router.serve_request(request("a.example")).await;
        assert!(!path.exists());
        assert_eq!(body_string(resp).await, "hello");

        let line = std::fs::read_to_string(&path).unwrap();
        assert!(line.starts_with("a.example - - - ["), "{line}");
        assert!(line.contains("\"GET / HTTP/1.1\" 200 5 "), "{line}");
    }

    #[tokio::test]
    async fn test_response_time_covers_streamed_body() {
        let router = Router::new();
        let mut table = Table::default();
        table.insert_route(
            "slow.example",
            Arc::new(handler_fn(|_req: Request<ProxyBody>| async move {
                let late = futures::stream::once(async {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Ok::<_, BoxError>(Frame::data(Bytes::from_static(b"late")))
                });
                Response::new(ProxyBody::new(http_body_util::StreamBody::new(late)))
            })),
        );
        router.swap(table);

        let mut body = router.serve_request(request("slow.example")).await.into_body();
        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }

        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        metrics::with_local_recorder(&recorder, || drop(body));

        let rendered = recorder.handle().render();
        let sum: f64 = rendered
            .lines()
            .find(|l| l.starts_with(&format!("{RESPONSE_TIME}_sum{{domain=\"slow.example\"}}")))
            .and_then(|l| l.rsplit(' ').next())
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| panic!("no response time recorded:\n{rendered}"));
        assert!(sum >= 200.0, "{sum}");
        assert!(rendered.contains(&format!(
            "{REQUEST_COUNT}{{domain=\"slow.example\",method=\"GET\",status=\"200\"}} 1"
        )));
    }
}
