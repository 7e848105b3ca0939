use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::future::ready;
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::error;

/// Health and metrics endpoints. `/metrics` is only routed when a recorder
/// handle is given.
pub fn router(liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(|| async { "wikistats service" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move {
                    let status = liveness.get_status();
                    if !status.healthy {
                        let unhealthy: Vec<String> = status
                            .components
                            .iter()
                            .filter(|(_, component)| !component.is_healthy())
                            .map(|(name, component)| format!("{name}: {component:?}"))
                            .collect();
                        error!(
                            "Health check FAILED - unhealthy components: [{}]",
                            unhealthy.join(", ")
                        );
                    }
                    status
                }
            }),
        );

    match metrics {
        Some(handle) => router
            .route("/metrics", get(move || ready(handle.render())))
            .layer(axum::middleware::from_fn(track_metrics)),
        None => router,
    }
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
