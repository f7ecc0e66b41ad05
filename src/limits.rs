//! Per-domain request size limits applied before anything reaches a backend.

use futures::future::BoxFuture;
use http_body_util::{BodyExt, Limited};
use hyper::header::CONTENT_LENGTH;
use hyper::{Request, Response};
use metrics::counter;
use std::sync::Arc;
use tracing::warn;

use crate::config::Limits;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::handler::{Handler, ProxyBody};
use crate::metrics::REQUESTS_REJECTED_BY_LIMITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    TooManyHeaders,
    HeadersTooLarge,
    RequestBodyTooLarge,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::TooManyHeaders => "too_many_headers",
            LimitReason::HeadersTooLarge => "headers_too_large",
            LimitReason::RequestBodyTooLarge => "request_body_too_large",
        }
    }
}

/// Rejects oversized requests and caps the body of the rest.
pub struct WithLimits {
    domain: String,
    max_body: u64,
    max_header_size: u64,
    max_header_count: usize,
    next: Arc<dyn Handler>,
}

impl WithLimits {
    pub fn new(domain: impl Into<String>, limits: &Limits, next: Arc<dyn Handler>) -> Self {
        Self {
            domain: domain.into(),
            max_body: limits.max_request_body_bytes(),
            max_header_size: limits.max_header_size_bytes(),
            max_header_count: limits.max_header_count(),
            next,
        }
    }

    /// Header checks and the declared content length, cheapest first.
    pub fn check<B>(&self, req: &Request<B>) -> Result<(), LimitReason> {
        let count = req.headers().keys_len();
        if count > self.max_header_count {
            warn!(
                domain = %self.domain,
                header_count = count,
                max_header_count = self.max_header_count,
                "request rejected: too many headers"
            );
            return Err(LimitReason::TooManyHeaders);
        }

        let size = header_size_bytes(req);
        if size > self.max_header_size {
            warn!(
                domain = %self.domain,
                header_size = size,
                max_header_size = self.max_header_size,
                "request rejected: headers too large"
            );
            return Err(LimitReason::HeadersTooLarge);
        }

        if let Some(length) = content_length(req) {
            if length > self.max_body {
                warn!(
                    domain = %self.domain,
                    content_length = length,
                    max_body_size = self.max_body,
                    "request rejected: request body too large"
                );
                return Err(LimitReason::RequestBodyTooLarge);
            }
        }

        Ok(())
    }

    fn reject(&self, reason: LimitReason) -> Response<ProxyBody> {
        counter!(
            REQUESTS_REJECTED_BY_LIMITS,
            "domain" => self.domain.clone(),
            "reason" => reason.as_str()
        )
        .increment(1);

        match reason {
            LimitReason::TooManyHeaders => {
                json_error_response(ProxyErrorCode::TooManyHeaders, "Too Many Headers")
            }
            LimitReason::HeadersTooLarge => json_error_response(
                ProxyErrorCode::HeadersTooLarge,
                "Request Header Fields Too Large",
            ),
            LimitReason::RequestBodyTooLarge => {
                json_error_response(ProxyErrorCode::PayloadTooLarge, "Payload Too Large")
            }
        }
    }
}

impl Handler for WithLimits {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin(async move {
            if let Err(reason) = self.check(&req) {
                return self.reject(reason);
            }

            let max = usize::try_from(self.max_body).unwrap_or(usize::MAX);
            let req = req.map(|body| Limited::new(body, max).boxed());
            self.next.call(req).await
        })
    }
}

fn content_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Approximate wire size: `name: ` once per field, `value\r\n` per value, the
/// request line and the terminating blank line.
pub fn header_size_bytes<B>(req: &Request<B>) -> u64 {
    let headers = req.headers();
    let mut size: u64 = 0;
    for name in headers.keys() {
        size += name.as_str().len() as u64 + 2;
        for value in headers.get_all(name) {
            size += value.len() as u64 + 2;
        }
    }

    let proto = format!("{:?}", req.version());
    size += (req.method().as_str().len() + 1 + req.uri().path().len() + 1 + proto.len() + 2) as u64;
    size + 2
}

/// Whether a body read failed because it passed the configured maximum.
pub fn is_body_limit_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{full, handler_fn, BoxError};
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spy() -> (Arc<AtomicUsize>, Arc<dyn Handler>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |req: Request<ProxyBody>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match req.into_body().collect().await {
                    Ok(body) => Response::new(full(body.to_bytes())),
                    Err(e) if is_body_limit_error(&*e) => {
                        json_error_response(ProxyErrorCode::PayloadTooLarge, "Payload Too Large")
                    }
                    Err(_) => json_error_response(ProxyErrorCode::BadGateway, "read failed"),
                }
            }
        });
        (calls, Arc::new(handler))
    }

    fn limits(body: &str, header_size: &str, count: i64) -> Limits {
        Limits {
            max_request_body: Some(body.to_string()),
            max_header_size: Some(header_size.to_string()),
            max_header_count: Some(count),
        }
    }

    #[tokio::test]
    async fn test_too_many_headers_never_calls_next() {
        let (calls, next) = spy();
        let mw = WithLimits::new("a.example", &limits("1MB", "1MB", 2), next);

        let req = Request::builder()
            .uri("/")
            .header("a", "1")
            .header("b", "2")
            .header("c", "3")
            .body(full(""))
            .unwrap();

        let resp = mw.call(req).await;
        assert_eq!(resp.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_headers_too_large() {
        let (calls, next) = spy();
        let mw = WithLimits::new("a.example", &limits("1MB", "64B", 100), next);

        let req = Request::builder()
            .uri("/")
            .header("x-big", "v".repeat(100))
            .body(full(""))
            .unwrap();

        assert_eq!(mw.check(&req), Err(LimitReason::HeadersTooLarge));
        let resp = mw.call(req).await;
        assert_eq!(resp.status().as_u16(), 431);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_declared_body_too_large() {
        let (calls, next) = spy();
        let mw = WithLimits::new("a.example", &limits("10B", "1MB", 100), next);

        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(CONTENT_LENGTH, "11")
            .body(full("hello world"))
            .unwrap();

        let resp = mw.call(req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undeclared_body_is_capped() {
        let (calls, next) = spy();
        let mw = WithLimits::new("a.example", &limits("10B", "1MB", 100), next);

        let chunks: Vec<Result<hyper::body::Frame<hyper::body::Bytes>, BoxError>> = vec![
            Ok(hyper::body::Frame::data("hello ".into())),
            Ok(hyper::body::Frame::data("world!".into())),
        ];
        let body = http_body_util::StreamBody::new(futures::stream::iter(chunks)).boxed();
        let req = Request::builder().method("POST").uri("/").body(body).unwrap();

        let resp = mw.call(req).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_within_limits_passes_through() {
        let (calls, next) = spy();
        let mw = WithLimits::new("a.example", &Limits::default(), next);

        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("x-one", "1")
            .body(full("payload"))
            .unwrap();

        let resp = mw.call(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn test_header_size_estimate() {
        let req = Request::builder()
            .uri("/abc")
            .header("host", "a.example")
            .header("accept", "*/*")
            .header("accept", "text/html")
            .body(())
            .unwrap();

        // host: 6 + 11, accept: 8 + 5 + 11, "GET /abc HTTP/1.1\r\n" = 19, final CRLF 2
        assert_eq!(header_size_bytes(&req), 17 + 24 + 19 + 2);
    }
}
