use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;

pub const SERVICE_BANNER: &str = "Stream Host API";

async fn root() -> &'static str {
    SERVICE_BANNER
}

async fn healthcheck() -> &'static str {
    "ok"
}

/// Liveness routes. Server and billing controllers live elsewhere.
pub fn service_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthcheck", get(healthcheck))
}

/// Adds `/metrics` and request instrumentation to `router`.
///
/// Installs the global Prometheus recorder, so call it once per process.
pub fn with_metrics(router: Router) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    router
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer)
}
