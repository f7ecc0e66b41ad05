//! Process lifecycle: bind the listeners, serve, reload, shut down together.

use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::certs::server_config;
use crate::config::{listen_address, Toplevel};
use crate::health::{HealthRegistry, ServingStatus, SERVICE_NAME};
use crate::logging::filter::LogFilters;
use crate::metrics::{self, MetricsService};
use crate::router::Router;
use crate::server::{HttpEntry, ProxyServer};

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    pub reload_interval: Duration,
}

impl Options {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
        }
    }
}

/// Requests an immediate configuration reload.
#[derive(Debug, Clone, Default)]
pub struct ReloadHandle {
    notify: Arc<Notify>,
}

impl ReloadHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddrs {
    pub http: SocketAddr,
    pub https: SocketAddr,
    pub metrics: SocketAddr,
}

/// A configured process with its listeners bound but not yet serving.
pub struct Entrypoint {
    options: Options,
    router: Arc<Router>,
    health: HealthRegistry,
    metrics_handle: PrometheusHandle,
    reload: ReloadHandle,
    addrs: LocalAddrs,
    servers: [ProxyServer; 3],
}

impl Entrypoint {
    /// Load the configuration, build the router and bind every listener.
    /// Any failure here is fatal.
    pub async fn bind(
        options: Options,
        health: HealthRegistry,
        log_filters: LogFilters,
    ) -> anyhow::Result<Self> {
        health.set_serving_status(SERVICE_NAME, ServingStatus::NotServing);

        let config = Toplevel::load(&options.config_path)?;
        let router = Arc::new(Router::with_log_filters(log_filters));
        let routes = router.set_config(&config)?;
        info!(path = %options.config_path.display(), routes, "configuration loaded");

        let metrics_handle = metrics::install().context("can't install metrics recorder")?;

        let http = bind_listener("HTTP", &config.bind.http).await?;
        let https = bind_listener("HTTPS", &config.bind.https).await?;
        let metrics_listener = bind_listener("metrics", &config.bind.metrics).await?;

        let addrs = LocalAddrs {
            http: http.local_addr()?,
            https: https.local_addr()?,
            metrics: metrics_listener.local_addr()?,
        };

        let tls = server_config(router.clone()).context("can't build TLS configuration")?;

        let servers = [
            ProxyServer::new(
                "http",
                http,
                Arc::new(HttpEntry::new(router.clone(), addrs.https.port())),
            ),
            ProxyServer::new("https", https, router.clone())
                .with_tls(TlsAcceptor::from(Arc::new(tls))),
            ProxyServer::new(
                "metrics",
                metrics_listener,
                Arc::new(MetricsService::new(
                    metrics_handle.clone(),
                    health.clone(),
                    SERVICE_NAME,
                )),
            ),
        ];

        Ok(Self {
            options,
            router,
            health,
            metrics_handle,
            reload: ReloadHandle::default(),
            addrs,
            servers,
        })
    }

    pub fn local_addrs(&self) -> LocalAddrs {
        self.addrs
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Serve until `token` is cancelled or any listener fails; either way all
    /// of them stop. Returns the first failure.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let Entrypoint {
            options,
            router,
            health,
            metrics_handle,
            reload,
            servers,
            ..
        } = self;

        let mut set = JoinSet::new();
        for server in servers {
            set.spawn(server.run(token.clone()));
        }

        let upkeep = tokio::spawn(metrics::run_upkeep(metrics_handle, token.clone()));
        let reloader = tokio::spawn(reload_loop(router, options, reload, token.clone()));

        health.set_serving_status(SERVICE_NAME, ServingStatus::Serving);

        let mut first_error = None;
        while let Some(result) = set.join_next().await {
            token.cancel();

            let result = result
                .map_err(anyhow::Error::from)
                .and_then(|r| r)
                .context("server stopped");
            if let Err(e) = result {
                error!(error = %format_args!("{e:#}"), "server failed");
                first_error.get_or_insert(e);
            }
        }

        health.set_serving_status(SERVICE_NAME, ServingStatus::NotServing);
        let _ = upkeep.await;
        let _ = reloader.await;
        info!("all servers stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn bind_listener(kind: &str, addr: &str) -> anyhow::Result<TcpListener> {
    let addr = listen_address(addr)
        .map_err(|e| anyhow::anyhow!("({kind}) invalid listen address {addr}: {e}"))?;
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("({kind}) can't bind to tcp {addr}"))
}

/// Reload on the interval, on SIGHUP or on [`ReloadHandle::trigger`], one at a time.
async fn reload_loop(
    router: Arc<Router>,
    options: Options,
    reload: ReloadHandle,
    token: CancellationToken,
) {
    let period = if options.reload_interval.is_zero() {
        DEFAULT_RELOAD_INTERVAL
    } else {
        options.reload_interval
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut hangup = Hangup::install();

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
            _ = reload.notify.notified() => {}
            _ = hangup.recv() => {
                info!(path = %options.config_path.display(), "received SIGHUP, reloading configuration");
            }
        }

        let router = router.clone();
        let path = options.config_path.clone();
        // Decode, validation and keypair loading touch the filesystem.
        if let Err(e) = tokio::task::spawn_blocking(move || router.reload(&path)).await {
            error!(error = %e, "reload task failed");
        }
    }
}

#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(s) => Hangup(Some(s)),
            Err(e) => {
                warn!(error = %e, "can't install SIGHUP handler");
                Hangup(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = self.0.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn install() -> Self {
        Hangup
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
