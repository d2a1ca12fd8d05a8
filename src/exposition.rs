use crate::models::{metric_name, MetricKind, SeriesKey};
use crate::registry::CounterRegistry;
use crate::telemetry::SelfMetrics;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// (kinds rendered in the family, help text prefix)
const FAMILIES: &[(&[MetricKind], &str)] = &[
    (&[MetricKind::Requests], "Total API requests to"),
    (&[MetricKind::TokensIn, MetricKind::TokensOut], "Total tokens used via"),
    (&[MetricKind::CostUsd], "Total cost in USD for"),
];

const INDEX: &str = r#"<html>
<head><title>robotheus</title></head>
<body>
<h1>robotheus</h1>
<p>AI provider usage and cost exporter</p>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct AppState {
    registry: Arc<CounterRegistry>,
    metrics: Arc<SelfMetrics>,
}

impl AppState {
    pub fn new(registry: Arc<CounterRegistry>, metrics: Arc<SelfMetrics>) -> Self {
        Self { registry, metrics }
    }
}

/// Render every registered provider's counters in the text exposition format.
pub fn render(registry: &CounterRegistry) -> String {
    let snapshot = registry.snapshot();
    let mut out = String::new();

    for provider in registry.providers() {
        for (kinds, help) in FAMILIES {
            let name = metric_name(&provider, kinds[0]);
            out.push_str(&format!("# HELP {} {} {}\n", name, help, provider));
            out.push_str(&format!("# TYPE {} counter\n", name));

            for (key, value) in snapshot
                .iter()
                .filter(|(k, _)| k.provider == provider && kinds.contains(&k.metric_kind))
            {
                out.push_str(&sample_line(&name, key, *value));
            }
        }
    }

    out
}

fn sample_line(name: &str, key: &SeriesKey, value: f64) -> String {
    let mut pairs: Vec<String> = key
        .labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    if let Some(direction) = key.metric_kind.direction() {
        pairs.push(format!("direction=\"{}\"", direction));
    }

    if pairs.is_empty() {
        format!("{} {}\n", name, value)
    } else {
        format!("{}{{{}}} {}\n", name, pairs.join(","), value)
    }
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Html(INDEX) }))
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = render(&state.registry);
    body.push_str(&state.metrics.render());
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "metrics server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::DeltaBatch;
    use pretty_assertions::assert_eq;

    fn key(kind: MetricKind, pairs: &[(&str, &str)]) -> SeriesKey {
        SeriesKey::new("openai", kind, pairs.iter().copied())
    }

    #[test]
    fn test_render_families() {
        let registry = CounterRegistry::new();
        registry.register_provider("openai");
        let usage = [("api_key", "key-1"), ("model", "gpt-4o"), ("project", "web")];
        registry.increment(&key(MetricKind::Requests, &usage), 3.0).unwrap();
        registry.increment(&key(MetricKind::TokensIn, &usage), 120.0).unwrap();
        registry.increment(&key(MetricKind::TokensOut, &usage), 45.0).unwrap();
        registry
            .increment(&key(MetricKind::CostUsd, &[("project", "web")]), 0.75)
            .unwrap();

        let expected = "\
# HELP robotheus_openai_requests_total Total API requests to openai
# TYPE robotheus_openai_requests_total counter
robotheus_openai_requests_total{api_key=\"key-1\",model=\"gpt-4o\",project=\"web\"} 3
# HELP robotheus_openai_tokens_total Total tokens used via openai
# TYPE robotheus_openai_tokens_total counter
robotheus_openai_tokens_total{api_key=\"key-1\",model=\"gpt-4o\",project=\"web\",direction=\"input\"} 120
robotheus_openai_tokens_total{api_key=\"key-1\",model=\"gpt-4o\",project=\"web\",direction=\"output\"} 45
# HELP robotheus_openai_cost_usd_total Total cost in USD for openai
# TYPE robotheus_openai_cost_usd_total counter
robotheus_openai_cost_usd_total{project=\"web\"} 0.75
";
        assert_eq!(render(&registry), expected);
    }

    #[test]
    fn test_registered_provider_without_samples_has_headers() {
        let registry = CounterRegistry::new();
        registry.register_provider("openai");
        let text = render(&registry);
        assert!(text.contains("# TYPE robotheus_openai_cost_usd_total counter"));
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 0);
    }

    #[test]
    fn test_zero_counter_exposed() {
        let registry = CounterRegistry::new();
        let mut batch = DeltaBatch::default();
        batch.touched.insert(key(MetricKind::Requests, &[("model", "gpt-4o")]));
        registry.apply(&batch).unwrap();
        assert!(render(&registry).contains("robotheus_openai_requests_total{model=\"gpt-4o\"} 0\n"));
    }

    #[test]
    fn test_label_values_escaped() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = Arc::new(CounterRegistry::new());
        registry
            .increment(&key(MetricKind::CostUsd, &[("project", "web")]), 2.5)
            .unwrap();
        let state = AppState::new(registry, Arc::new(SelfMetrics::new().unwrap()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, router(state))
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            })
        };

        let response = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            CONTENT_TYPE
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("robotheus_openai_cost_usd_total{project=\"web\"} 2.5"));

        let health = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
