//! The provider abstraction layer: a uniform interface over
//! heterogeneous GPU cloud backends, dispatched through a closed `Provider`
//! enum rather than a trait object — unknown provider names are a
//! validation error at the factory, not a runtime dispatch failure.

pub mod circuit_breaker;
pub mod fake;
pub mod factory;
pub mod hetzner;
pub mod retry;
pub mod runpod;
pub mod vastai;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::offering::{BillingGranularity, GpuModel, GpuOffer, NormalizedPricing, Region};

/// Per-call timeout budget plus the shutdown token every wire adapter races
/// its call against, so an operator shutdown aborts an in-flight call rather
/// than leaving a reconciler blocked on it. Built once from
/// [`crate::config::OperatorConfig`] and cloned into each adapter the
/// factory constructs.
#[derive(Clone)]
pub struct AdapterHandle {
    pub call_timeout: Duration,
    pub launch_timeout: Duration,
    pub shutdown: CancellationToken,
}

impl AdapterHandle {
    pub fn new(call_timeout: Duration, launch_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            call_timeout,
            launch_timeout,
            shutdown,
        }
    }
}

impl Default for AdapterHandle {
    /// Matches `OperatorConfig`'s own defaults (30s/300s) with a token that
    /// never fires — the right shape for adapters built directly in tests
    /// rather than through the factory.
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(300),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Identifies a launched cloud instance. Opaque outside the adapter that
/// created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(pub String);

/// Instance lifecycle state as observed through the adapter. Backends
/// that report an undocumented/unknown state map to `Unknown`
/// rather than failing `GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceAddresses {
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GpuInstance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub addresses: InstanceAddresses,
    pub created_at: DateTime<Utc>,
}

/// Request to launch one GPU instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub gpu_type: GpuModel,
    pub region: Region,
    /// The rendered, opaque node-init payload — delivered via the
    /// backend's user-data/cloud-init/metadata field.
    pub node_init_payload: String,
    pub labels: BTreeMap<String, String>,
    pub spot_preference: bool,
    pub max_price: Option<f64>,
}

/// Filters for `ListAvailable`. All optional; an empty filter set
/// returns the full catalogue.
#[derive(Debug, Clone, Default)]
pub struct OfferFilters {
    pub gpu_type: Option<GpuModel>,
    pub region: Option<Region>,
    pub max_price: Option<f64>,
    pub spot_only: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub supported_regions: Vec<Region>,
    pub supported_gpu_types: Vec<GpuModel>,
    pub supports_spot: bool,
    pub billing_granularity: BillingGranularity,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub burst: u32,
}

/// A client-side token-bucket limiter built from an adapter's own declared
/// [`RateLimits`]. Every REST/GraphQL/SDK adapter waits on one of these
/// before a wire call is attempted,
/// so the operator self-throttles instead of relying solely on the backend
/// to return 429s.
pub type AdapterRateLimiter = governor::DefaultDirectRateLimiter;

/// Builds a limiter from a [`RateLimits`] descriptor, refilling at
/// `requests_per_second` with burst capacity `burst`.
pub fn rate_limiter(limits: &RateLimits) -> AdapterRateLimiter {
    let per_second = std::num::NonZeroU32::new(limits.requests_per_second.max(1))
        .expect("requests_per_second floored to at least 1");
    let burst = std::num::NonZeroU32::new(limits.burst.max(1)).expect("burst floored to at least 1");
    governor::RateLimiter::direct(governor::Quota::per_second(per_second).allow_burst(burst))
}

/// Closed enumeration of provider backends. Adding a backend means
/// adding a variant here and to `ProviderName`/the factory — there is no
/// open-ended registration mechanism by design.
pub enum Provider {
    VastAi(vastai::VastAiAdapter),
    RunPod(runpod::RunPodAdapter),
    Hetzner(hetzner::HetznerAdapter),
    Fake(fake::FakeProvider),
}

impl Provider {
    pub fn name(&self) -> &str {
        match self {
            Self::VastAi(p) => p.name(),
            Self::RunPod(p) => p.name(),
            Self::Hetzner(p) => p.name(),
            Self::Fake(p) => p.name(),
        }
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<GpuInstance, ProviderError> {
        match self {
            Self::VastAi(p) => p.launch(request).await,
            Self::RunPod(p) => p.launch(request).await,
            Self::Hetzner(p) => p.launch(request).await,
            Self::Fake(p) => p.launch(request).await,
        }
    }

    /// Idempotent: a "not found" response from the backend is success.
    pub async fn terminate(&self, id: &InstanceId) -> Result<(), ProviderError> {
        match self {
            Self::VastAi(p) => p.terminate(id).await,
            Self::RunPod(p) => p.terminate(id).await,
            Self::Hetzner(p) => p.terminate(id).await,
            Self::Fake(p) => p.terminate(id).await,
        }
    }

    pub async fn get_status(&self, id: &InstanceId) -> Result<InstanceState, ProviderError> {
        match self {
            Self::VastAi(p) => p.get_status(id).await,
            Self::RunPod(p) => p.get_status(id).await,
            Self::Hetzner(p) => p.get_status(id).await,
            Self::Fake(p) => p.get_status(id).await,
        }
    }

    /// Errors classify the same way every other adapter call does; the
    /// caller decides whether an empty catalogue from a healthy call and a
    /// failed call are worth distinguishing.
    pub async fn list_available(&self, filters: &OfferFilters) -> Result<Vec<GpuOffer>, ProviderError> {
        match self {
            Self::VastAi(p) => p.list_available(filters).await,
            Self::RunPod(p) => p.list_available(filters).await,
            Self::Hetzner(p) => p.list_available(filters).await,
            Self::Fake(p) => p.list_available(filters).await,
        }
    }

    pub async fn get_normalized_pricing(
        &self,
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Result<NormalizedPricing, ProviderError> {
        match self {
            Self::VastAi(p) => p.get_normalized_pricing(gpu_type, region).await,
            Self::RunPod(p) => p.get_normalized_pricing(gpu_type, region).await,
            Self::Hetzner(p) => p.get_normalized_pricing(gpu_type, region).await,
            Self::Fake(p) => p.get_normalized_pricing(gpu_type, region).await,
        }
    }

    pub fn get_provider_info(&self) -> ProviderInfo {
        match self {
            Self::VastAi(p) => p.get_provider_info(),
            Self::RunPod(p) => p.get_provider_info(),
            Self::Hetzner(p) => p.get_provider_info(),
            Self::Fake(p) => p.get_provider_info(),
        }
    }

    pub fn get_rate_limits(&self) -> RateLimits {
        match self {
            Self::VastAi(p) => p.get_rate_limits(),
            Self::RunPod(p) => p.get_rate_limits(),
            Self::Hetzner(p) => p.get_rate_limits(),
            Self::Fake(p) => p.get_rate_limits(),
        }
    }

    pub fn translate_gpu_type(&self, standard: &GpuModel) -> String {
        match self {
            Self::VastAi(p) => p.translate_gpu_type(standard),
            Self::RunPod(p) => p.translate_gpu_type(standard),
            Self::Hetzner(p) => p.translate_gpu_type(standard),
            Self::Fake(p) => p.translate_gpu_type(standard),
        }
    }

    pub fn translate_region(&self, standard: &Region) -> String {
        match self {
            Self::VastAi(p) => p.translate_region(standard),
            Self::RunPod(p) => p.translate_region(standard),
            Self::Hetzner(p) => p.translate_region(standard),
            Self::Fake(p) => p.translate_region(standard),
        }
    }
}

/// Maps a `GetStatus` outcome onto the closed health-check vocabulary: a
/// successful call reporting a live or cleanly-terminated state is healthy,
/// one reporting `Failed`/`Unknown`/`Terminating` is degraded, and a failed
/// call itself is unreachable.
pub fn health_check_result(result: &Result<InstanceState, ProviderError>) -> &'static str {
    match result {
        Ok(InstanceState::Running | InstanceState::Pending | InstanceState::Terminated) => "healthy",
        Ok(InstanceState::Failed | InstanceState::Unknown | InstanceState::Terminating) => "degraded",
        Err(_) => "unreachable",
    }
}

/// Classifies a wire-level failure into the provider error taxonomy by string-match on
/// the error text plus an optional HTTP status. Shared by every REST/GraphQL
/// backend; the `hcloud` SDK backend additionally consults its own typed
/// error before falling back to this.
pub fn classify_http_error(provider: &str, status: Option<u16>, message: &str) -> ProviderError {
    let lower = message.to_ascii_lowercase();
    match status {
        Some(401) | Some(403) => ProviderError::Auth {
            provider: provider.to_string(),
            message: message.to_string(),
        },
        Some(429) => ProviderError::RateLimit {
            provider: provider.to_string(),
            message: message.to_string(),
        },
        _ if lower.contains("insufficient") && (lower.contains("credit") || lower.contains("balance") || lower.contains("quota")) => {
            ProviderError::Billing {
                provider: provider.to_string(),
                message: message.to_string(),
            }
        }
        _ if lower.contains("rate limit") || lower.contains("too many requests") => {
            ProviderError::RateLimit {
                provider: provider.to_string(),
                message: message.to_string(),
            }
        }
        _ if lower.contains("unauthorized") || lower.contains("invalid api key") || lower.contains("forbidden") => {
            ProviderError::Auth {
                provider: provider.to_string(),
                message: message.to_string(),
            }
        }
        _ if lower.contains("no capacity") || lower.contains("unavailable") || lower.contains("sold out") => {
            ProviderError::Availability {
                provider: provider.to_string(),
                gpu_type: "unknown".to_string(),
                region: "unknown".to_string(),
                message: message.to_string(),
            }
        }
        _ if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection reset")
            || lower.contains("dns") =>
        {
            ProviderError::Network {
                provider: provider.to_string(),
                message: message.to_string(),
            }
        }
        _ if lower.contains("decode") || lower.contains("parse") || lower.contains("deserialize") => {
            ProviderError::Schema {
                provider: provider.to_string(),
                message: message.to_string(),
            }
        }
        _ => ProviderError::Unknown {
            provider: provider.to_string(),
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_rate_limit() {
        assert!(matches!(
            classify_http_error("vastai", Some(429), "too many requests"),
            ProviderError::RateLimit { .. }
        ));
    }

    #[test]
    fn classifies_401_as_auth() {
        assert!(matches!(
            classify_http_error("vastai", Some(401), "nope"),
            ProviderError::Auth { .. }
        ));
    }

    #[test]
    fn classifies_quota_message_as_billing() {
        assert!(matches!(
            classify_http_error("vastai", None, "insufficient credit balance"),
            ProviderError::Billing { .. }
        ));
    }

    #[test]
    fn classifies_timeout_as_network() {
        assert!(matches!(
            classify_http_error("vastai", None, "request timed out"),
            ProviderError::Network { .. }
        ));
    }

    #[test]
    fn unmatched_message_is_unknown() {
        assert!(matches!(
            classify_http_error("vastai", None, "the server exploded"),
            ProviderError::Unknown { .. }
        ));
    }
}
