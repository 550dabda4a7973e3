//! Axum middleware that publishes every request into the metrics
//! singleton: a request counter labeled by method/path/status and a
//! latency histogram, mirroring the request-id span set up in
//! [`crate::tracing_setup`].

use std::time::Instant;

use axum::{body::Body, extract::Request, middleware::Next, response::Response};

use crate::metrics::global_metrics;

/// Records `api_requests_total{method,path,status}` and
/// `api_request_duration_seconds` for every request that passes through it.
pub async fn request_metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let elapsed = start.elapsed().as_secs_f64();

    let metrics = global_metrics();
    metrics.increment_counter(
        "api_requests_total",
        &[
            ("method", method.as_str()),
            ("path", path.as_str()),
            ("status", status.as_str()),
        ],
    );
    metrics.record_histogram("api_request_duration_seconds", elapsed);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[tokio::test]
    async fn middleware_records_request_count_and_latency() {
        let app = Router::new()
            .route("/widgets", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_metrics_middleware));

        let before = global_metrics().get_counter(
            "api_requests_total",
            &[("method", "GET"), ("path", "/widgets"), ("status", "200")],
        );

        let req = axum::http::Request::builder()
            .uri("/widgets")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        let after = global_metrics().get_counter(
            "api_requests_total",
            &[("method", "GET"), ("path", "/widgets"), ("status", "200")],
        );
        assert_eq!(after, before + 1);
    }
}
