use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

pub fn app(liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route(
            "/metrics",
            get(move || match metrics {
                Some(ref recorder_handle) => ready(recorder_handle.render()),
                None => ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "state exporter"
}

pub async fn listen(app: Router, bind: String) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

/// Installs the global prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_index() {
        let (status, body) = get_path(app(HealthRegistry::new("liveness"), None), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "state exporter");
    }

    #[tokio::test]
    async fn test_liveness_follows_registry() {
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness.register("exporter", Duration::seconds(60));

        let (status, _) = get_path(app(liveness.clone(), None), "/_liveness").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        handle.report_healthy();
        let (status, body) = get_path(app(liveness, None), "/_liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("exporter"));
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (status, body) = get_path(app(HealthRegistry::new("liveness"), None), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "no metrics recorder installed");
    }
}
