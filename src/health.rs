//! Serving status of the named services in this process.

use dashmap::DashMap;
use hyper::StatusCode;
use std::fmt;
use std::sync::Arc;

/// Name under which the proxy itself reports readiness.
pub const SERVICE_NAME: &str = "hostgate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServingStatus::Unknown => "UNKNOWN",
            ServingStatus::Serving => "SERVING",
            ServingStatus::NotServing => "NOT_SERVING",
        })
    }
}

/// Shared, cloneable registry of service statuses.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    services: Arc<DashMap<String, ServingStatus>>,
}

impl HealthRegistry {
    pub fn set_serving_status(&self, service: &str, status: ServingStatus) {
        self.services.insert(service.to_string(), status);
    }

    pub fn status(&self, service: &str) -> Option<ServingStatus> {
        self.services.get(service).map(|s| *s)
    }

    /// Readiness of one service: 200 `OK`, 500 `NOT OK`, 417 when never registered.
    pub fn readyz(&self, service: &str) -> (StatusCode, String) {
        match self.status(service) {
            Some(ServingStatus::Serving) => (StatusCode::OK, "OK".to_string()),
            Some(_) => (StatusCode::INTERNAL_SERVER_ERROR, "NOT OK".to_string()),
            None => (
                StatusCode::EXPECTATION_FAILED,
                format!("service {service} is not registered"),
            ),
        }
    }

    /// Every service as `name: STATUS`, sorted; 500 unless all are serving.
    pub fn healthz(&self) -> (StatusCode, String) {
        let mut entries: Vec<(String, ServingStatus)> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let healthy = entries.iter().all(|(_, s)| *s == ServingStatus::Serving);
        let body: String = entries
            .iter()
            .map(|(name, status)| format!("{name}: {status}\n"))
            .collect();

        let status = if healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readyz() {
        let health = HealthRegistry::default();
        assert_eq!(health.readyz(SERVICE_NAME).0, StatusCode::EXPECTATION_FAILED);

        health.set_serving_status(SERVICE_NAME, ServingStatus::NotServing);
        assert_eq!(
            health.readyz(SERVICE_NAME),
            (StatusCode::INTERNAL_SERVER_ERROR, "NOT OK".to_string())
        );

        health.set_serving_status(SERVICE_NAME, ServingStatus::Serving);
        assert_eq!(health.readyz(SERVICE_NAME), (StatusCode::OK, "OK".to_string()));
    }

    #[test]
    fn test_healthz_requires_every_service() {
        let health = HealthRegistry::default();
        health.set_serving_status("hostgate", ServingStatus::Serving);
        health.set_serving_status("acme", ServingStatus::Unknown);

        let (status, body) = health.healthz();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "acme: UNKNOWN\nhostgate: SERVING\n");

        health.set_serving_status("acme", ServingStatus::Serving);
        assert_eq!(health.healthz().0, StatusCode::OK);
    }
}
