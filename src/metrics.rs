//! Metric names, the Prometheus recorder and the metrics listener's handler.

use futures::future::BoxFuture;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::handler::{full, Handler, ProxyBody};
use crate::health::HealthRegistry;

pub const REQUEST_COUNT: &str = "hostgate_requests_total";
pub const RESPONSE_TIME: &str = "hostgate_response_time_ms";
pub const UNRESOLVED_REQUESTS: &str = "hostgate_unresolved_requests";
pub const REQUESTS_REJECTED_BY_LIMITS: &str = "hostgate_requests_rejected_by_limits_total";
pub const CERTIFICATE_MISSES: &str = "hostgate_tls_certificate_misses_total";
pub const CONFIG_RELOADS: &str = "hostgate_config_reloads_total";
pub const LOG_FILTER_INVOCATIONS: &str = "hostgate_log_filter_invocations_total";
pub const LOG_FILTER_EXECUTION_TIME: &str = "hostgate_log_filter_execution_time_us";
pub const LOG_FILTER_ERRORS: &str = "hostgate_log_filter_errors_total";

const RESPONSE_TIME_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

static RECORDER: Mutex<Option<PrometheusHandle>> = parking_lot::const_mutex(None);

/// Install the process-wide recorder on first use and return its handle.
pub fn install() -> Result<PrometheusHandle, BuildError> {
    let mut slot = RECORDER.lock();
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(RESPONSE_TIME.to_string()),
            &RESPONSE_TIME_BUCKETS,
        )?
        .install_recorder()?;
    describe();

    *slot = Some(handle.clone());
    Ok(handle)
}

fn describe() {
    describe_counter!(
        REQUEST_COUNT,
        "Requests served, by domain, method and status code"
    );
    describe_histogram!(
        RESPONSE_TIME,
        Unit::Milliseconds,
        "Time until the response body was fully sent, by domain"
    );
    describe_gauge!(
        UNRESOLVED_REQUESTS,
        "Requests whose Host matched no configured domain"
    );
    describe_counter!(
        REQUESTS_REJECTED_BY_LIMITS,
        "Requests rejected by per-domain limits, by domain and reason"
    );
    describe_counter!(
        CERTIFICATE_MISSES,
        "TLS handshakes for a server name without a certificate"
    );
    describe_counter!(CONFIG_RELOADS, "Configuration reload attempts, by result");
    describe_counter!(LOG_FILTER_INVOCATIONS, "Log filter evaluations, by filter");
    describe_histogram!(
        LOG_FILTER_EXECUTION_TIME,
        Unit::Microseconds,
        "Log filter evaluation time, by filter"
    );
    describe_counter!(LOG_FILTER_ERRORS, "Log filter evaluation errors, by filter");
}

/// Drain histogram buckets periodically until cancelled.
pub async fn run_upkeep(handle: PrometheusHandle, token: CancellationToken) {
    let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => handle.run_upkeep(),
            _ = token.cancelled() => return,
        }
    }
}

/// `/metrics`, `/healthz` and `/readyz`.
pub struct MetricsService {
    handle: PrometheusHandle,
    health: HealthRegistry,
    service: String,
}

impl MetricsService {
    pub fn new(handle: PrometheusHandle, health: HealthRegistry, service: impl Into<String>) -> Self {
        Self {
            handle,
            health,
            service: service.into(),
        }
    }

    pub fn respond(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        if method != Method::GET && method != Method::HEAD {
            return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }

        match path {
            "/metrics" => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(full(self.handle.render()))
                .expect("valid response with static headers"),
            "/healthz" => {
                let (status, body) = self.health.healthz();
                text(status, body)
            }
            "/readyz" => {
                let (status, body) = self.health.readyz(&self.service);
                text(status, body)
            }
            _ => text(StatusCode::NOT_FOUND, "not found\n"),
        }
    }
}

impl Handler for MetricsService {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        let resp = self.respond(req.method(), req.uri().path());
        Box::pin(async move { resp })
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body.into()))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ServingStatus;
    use http_body_util::BodyExt;

    async fn body_string(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_endpoints() {
        let handle = install().unwrap();
        metrics::counter!(REQUEST_COUNT, "domain" => "metrics-test.example").increment(1);

        let health = HealthRegistry::default();
        let service = MetricsService::new(handle, health.clone(), "hostgate");

        let resp = service.respond(&Method::GET, "/metrics");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("metrics-test.example"));

        let resp = service.respond(&Method::GET, "/readyz");
        assert_eq!(resp.status(), StatusCode::EXPECTATION_FAILED);

        health.set_serving_status("hostgate", ServingStatus::Serving);
        let resp = service.respond(&Method::GET, "/readyz");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "OK");

        let resp = service.respond(&Method::GET, "/nope");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = service.respond(&Method::POST, "/metrics");
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_install_is_idempotent() {
        install().unwrap();
        install().unwrap();
    }
}
