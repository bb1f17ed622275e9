//! Prometheus metrics surface.
//!
//! Built on the `metrics` facade plus `metrics-exporter-prometheus`: call
//! sites anywhere in the crate use the plain `metrics::counter!`/`histogram!`
//! macros, and `install()` wires the global recorder once at startup so
//! those calls land somewhere. `render()` is what the axum `/metrics` route
//! calls to produce the text-exposition body.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const PREFIX: &str = "tgp_operator";

/// Installs the global Prometheus recorder. Must be called exactly once,
/// before any `metrics::*!` call site fires — typically the first line of
/// `main`.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder installs exactly once at startup")
}

/// Maps a free-form string (a provider name, an outcome, a phase) onto a
/// closed label vocabulary, falling back to `"unknown"`
/// for anything the operator doesn't recognize. Keeps cardinality
/// bounded regardless of what a misbehaving adapter reports.
pub fn label(value: &str, allowed: &[&str]) -> String {
    if allowed.contains(&value) {
        value.to_string()
    } else {
        "unknown".to_string()
    }
}

pub const PROVIDERS: &[&str] = &["vastai", "runpod", "hetzner", "fake"];
pub const PHASES: &[&str] = &["pending", "provisioning", "ready", "unmet", "deprovisioning"];
pub const OUTCOMES: &[&str] = &["success", "error"];
pub const HEALTH_RESULTS: &[&str] = &["healthy", "degraded", "unreachable"];

pub fn provider_label(provider: &str) -> String {
    label(provider, PROVIDERS)
}

pub fn phase_label(phase: &str) -> String {
    label(phase, PHASES)
}

pub fn outcome_label(outcome: &str) -> String {
    label(outcome, OUTCOMES)
}

pub fn record_gpu_request(provider: &str, gpu_type: &str, phase: &str) {
    metrics::counter!(
        format!("{PREFIX}_gpu_requests_total"),
        "provider" => provider_label(provider),
        "gpu_type" => gpu_type.to_string(),
        "phase" => phase_label(phase),
    )
    .increment(1);
}

pub fn record_provider_call(provider: &str, outcome: &str) {
    metrics::counter!(
        format!("{PREFIX}_provider_calls_total"),
        "provider" => provider_label(provider),
        "outcome" => outcome_label(outcome),
    )
    .increment(1);
}

pub fn record_health_check(provider: &str, result: &str) {
    let result = label(result, HEALTH_RESULTS);
    metrics::counter!(
        format!("{PREFIX}_health_checks_total"),
        "provider" => provider_label(provider),
        "result" => result,
    )
    .increment(1);
}

pub fn record_idle_timeout(provider: &str, gpu_type: &str) {
    metrics::counter!(
        format!("{PREFIX}_idle_timeouts_total"),
        "provider" => provider_label(provider),
        "gpu_type" => gpu_type.to_string(),
    )
    .increment(1);
}

pub fn record_launch_duration(provider: &str, seconds: f64) {
    metrics::histogram!(
        format!("{PREFIX}_instance_launch_duration_seconds"),
        "provider" => provider_label(provider),
    )
    .record(seconds);
}

pub fn set_active_instances(provider: &str, count: i64) {
    metrics::gauge!(
        format!("{PREFIX}_active_instances"),
        "provider" => provider_label(provider),
    )
    .set(count as f64);
}

pub fn set_instance_hourly_cost(provider: &str, instance_id: &str, cost: f64) {
    metrics::gauge!(
        format!("{PREFIX}_instance_hourly_cost"),
        "provider" => provider_label(provider),
        "instance_id" => instance_id.to_string(),
    )
    .set(cost);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_provider_label_passes_through() {
        assert_eq!(provider_label("vastai"), "vastai");
    }

    #[test]
    fn unknown_provider_label_falls_back_to_unknown() {
        assert_eq!(provider_label("some-new-backend"), "unknown");
    }

    #[test]
    fn known_phase_label_passes_through() {
        assert_eq!(phase_label("provisioning"), "provisioning");
    }

    #[test]
    fn unrecognized_phase_falls_back_to_unknown() {
        assert_eq!(phase_label("bogus"), "unknown");
    }
}
