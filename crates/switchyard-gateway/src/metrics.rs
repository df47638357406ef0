//! Prometheus metrics recording and endpoint.

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use switchyard_agent::TurnOutcome;
use switchyard_core::error::SwitchyardError;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Record an HTTP request with its duration.
pub fn record_request(route: &str, duration_secs: f64) {
    let labels = [("route", route.to_string())];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_request_duration_seconds", &labels).record(duration_secs);
}

/// Middleware timing each request by its route template. Streaming bodies
/// are timed to the response head.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let start = Instant::now();
    let response = next.run(request).await;
    record_request(&route, start.elapsed().as_secs_f64());
    response
}

/// Record a turn starting.
pub fn record_turn_start() {
    metrics::gauge!("turns_active").increment(1.0);
}

/// Record a finished turn, successful or not.
pub fn record_turn_end(result: &Result<TurnOutcome, SwitchyardError>, duration_secs: f64) {
    metrics::gauge!("turns_active").decrement(1.0);
    metrics::histogram!("turn_duration_seconds").record(duration_secs);
    match result {
        Ok(outcome) => {
            let labels = [("stop_reason", format!("{:?}", outcome.stop_reason))];
            metrics::counter!("turns_total", &labels).increment(1);
            metrics::histogram!("turn_rounds").record(outcome.rounds as f64);
            metrics::counter!("tool_calls_total").increment(outcome.tool_calls as u64);
            metrics::histogram!("turn_cost").record(outcome.cost);
            metrics::counter!("tokens_total", "direction" => "input")
                .increment(outcome.usage.input_tokens);
            metrics::counter!("tokens_total", "direction" => "output")
                .increment(outcome.usage.output_tokens);
        }
        Err(e) => record_error(e.kind().as_str()),
    }
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
