//! JSON error responses generated by the router itself

use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::handler::{full, ProxyBody};

/// Why the router answered instead of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route for the request host
    UnknownHost,
    /// More header fields than the domain allows
    TooManyHeaders,
    /// Header block larger than the domain allows
    HeadersTooLarge,
    /// Request body larger than the domain allows
    PayloadTooLarge,
    /// Backend connection or protocol failure
    BadGateway,
    /// Backend did not send response headers in time
    GatewayTimeout,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::TooManyHeaders => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProxyErrorCode::HeadersTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::TooManyHeaders => "TOO_MANY_HEADERS",
            ProxyErrorCode::HeadersTooLarge => "HEADERS_TOO_LARGE",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// JSON error body with an X-Proxy-Error header naming the code.
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::TooManyHeaders.status_code().as_u16(), 431);
        assert_eq!(ProxyErrorCode::HeadersTooLarge.status_code().as_u16(), 431);
        assert_eq!(ProxyErrorCode::PayloadTooLarge.status_code().as_u16(), 413);
        assert_eq!(ProxyErrorCode::BadGateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyErrorCode::GatewayTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, "no route for b.example");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"no route for b.example\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::TooManyHeaders, "Too Many Headers");

        assert_eq!(response.status().as_u16(), 431);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "TOO_MANY_HEADERS"
        );
    }
}
