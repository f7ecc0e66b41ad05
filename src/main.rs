use hostgate::entrypoint::{Entrypoint, Options};
use hostgate::health::HealthRegistry;
use hostgate::logging::{self, filter::LogFilters};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CONFIG_ENV: &str = "HOSTGATE_CONFIG";
const DEFAULT_CONFIG: &str = "hostgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filters = LogFilters::default();
    logging::init(filters.clone());

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %config_path.display(),
        "starting hostgate"
    );

    let entrypoint = Entrypoint::bind(Options::new(&config_path), HealthRegistry::default(), filters)
        .await
        .map_err(|e| {
            error!(path = %config_path.display(), error = %format_args!("{e:#}"), "startup failed");
            e
        })?;

    let addrs = entrypoint.local_addrs();
    info!(
        http = %addrs.http,
        https = %addrs.https,
        metrics = %addrs.metrics,
        "listeners bound"
    );

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    entrypoint.run(token).await
}

async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let ctrl_c = tokio::signal::ctrl_c();
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!(error = %e, "can't install SIGTERM handler");
                let _ = ctrl_c.await;
                info!("received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }

    token.cancel();
}
