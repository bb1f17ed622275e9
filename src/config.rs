//! Operator process configuration, loaded from the environment.
//!
//! Durations are plain seconds on the wire (`envconfig` doesn't know how to
//! parse `Duration` itself) and converted once at startup.

use envconfig::Envconfig;
use std::time::Duration;

#[derive(Envconfig, Debug, Clone)]
pub struct OperatorConfig {
    /// Port the `/metrics` and `/healthz` HTTP endpoints listen on.
    #[envconfig(from = "TGP_OPERATOR_METRICS_PORT", default = "8080")]
    pub metrics_port: u16,

    /// Pricing cache TTL in seconds. 0 disables caching (every call fetches
    /// fresh).
    #[envconfig(from = "TGP_OPERATOR_PRICING_CACHE_TTL_SECS", default = "60")]
    pub pricing_cache_ttl_secs: u64,

    /// Requeue interval for a healthy NodeClass reconcile.
    #[envconfig(from = "TGP_OPERATOR_NODECLASS_REQUEUE_SECS", default = "600")]
    pub nodeclass_requeue_secs: u64,

    /// Requeue interval for a healthy NodePool reconcile.
    #[envconfig(from = "TGP_OPERATOR_NODEPOOL_REQUEUE_SECS", default = "600")]
    pub nodepool_requeue_secs: u64,

    /// Requeue interval when a NodeClass deletion is blocked by live
    /// NodePool references.
    #[envconfig(from = "TGP_OPERATOR_DELETION_BLOCKED_REQUEUE_SECS", default = "30")]
    pub deletion_blocked_requeue_secs: u64,

    /// Requeue interval when a NodePool's referenced NodeClass is missing.
    #[envconfig(from = "TGP_OPERATOR_MISSING_NODECLASS_REQUEUE_SECS", default = "60")]
    pub missing_nodeclass_requeue_secs: u64,

    /// Requeue interval after an auth failure.
    #[envconfig(from = "TGP_OPERATOR_AUTH_ERROR_REQUEUE_SECS", default = "300")]
    pub auth_error_requeue_secs: u64,

    /// Per-call timeout for list/status/pricing provider calls.
    #[envconfig(from = "TGP_OPERATOR_PROVIDER_CALL_TIMEOUT_SECS", default = "30")]
    pub provider_call_timeout_secs: u64,

    /// Per-call timeout for launch calls.
    #[envconfig(from = "TGP_OPERATOR_LAUNCH_TIMEOUT_SECS", default = "300")]
    pub launch_timeout_secs: u64,

    /// Inter-call pacing between per-provider inventory refresh calls within
    /// one NodeClass reconcile.
    #[envconfig(from = "TGP_OPERATOR_INVENTORY_PACING_MS", default = "100")]
    pub inventory_pacing_ms: u64,

    /// Log format: "json" or "pretty".
    #[envconfig(from = "TGP_OPERATOR_LOG_FORMAT", default = "pretty")]
    pub log_format: String,
}

impl OperatorConfig {
    pub fn load() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }

    pub fn pricing_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pricing_cache_ttl_secs)
    }

    pub fn nodeclass_requeue(&self) -> Duration {
        Duration::from_secs(self.nodeclass_requeue_secs)
    }

    pub fn nodepool_requeue(&self) -> Duration {
        Duration::from_secs(self.nodepool_requeue_secs)
    }

    pub fn deletion_blocked_requeue(&self) -> Duration {
        Duration::from_secs(self.deletion_blocked_requeue_secs)
    }

    pub fn missing_nodeclass_requeue(&self) -> Duration {
        Duration::from_secs(self.missing_nodeclass_requeue_secs)
    }

    pub fn auth_error_requeue(&self) -> Duration {
        Duration::from_secs(self.auth_error_requeue_secs)
    }

    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_call_timeout_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn inventory_pacing(&self) -> Duration {
        Duration::from_millis(self.inventory_pacing_ms)
    }
}
