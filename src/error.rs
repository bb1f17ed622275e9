//! Error types for the operator.
//!
//! Library code returns `crate::error::Result<T>` (`OperatorError`). The
//! binary entrypoint converts to `anyhow::Result` at the top level so it can
//! attach free-form context without infecting the library's typed errors.
//!
//! `ProviderError` is a separate, narrower taxonomy: every adapter call
//! that touches the wire classifies its failure into one
//! of its variants, and `is_retryable()` drives the retry policy in
//! `provider::retry`.

use thiserror::Error;

/// Top-level operator error.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("template rendering failed: {0}")]
    Template(#[from] TemplateError),

    #[error("validation error: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("resource not found: {resource_type} {name}")]
    NotFound { resource_type: String, name: String },

    #[error("config error: {0}")]
    Config(#[from] envconfig::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OperatorError>;

/// Wire-facing error taxonomy every provider adapter classifies into.
///
/// Classification happens by string-match on error text plus HTTP status.
/// The taxonomy drives retry eligibility: only `RateLimit`,
/// `Network`, and `Availability` are retried by the adapter's retry policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Credit/quota exhausted. Not retryable; the provider is skipped for
    /// selection until the next reconcile.
    #[error("billing error on {provider}: {message}")]
    Billing { provider: String, message: String },

    /// HTTP 429 or equivalent. Retryable with backoff.
    #[error("rate limited by {provider}: {message}")]
    RateLimit { provider: String, message: String },

    /// HTTP 401/403 or equivalent. Not retryable.
    #[error("auth error on {provider}: {message}")]
    Auth { provider: String, message: String },

    /// Capacity/region unavailable. Retryable, but typically means "try a
    /// different offering/provider" rather than "try again now".
    #[error("{gpu_type} unavailable on {provider} in {region}: {message}")]
    Availability {
        provider: String,
        gpu_type: String,
        region: String,
        message: String,
    },

    /// Timeout, DNS failure, connection reset. Retryable.
    #[error("network error on {provider}: {message}")]
    Network { provider: String, message: String },

    /// Response failed to decode into the expected shape. Not retryable —
    /// retrying won't fix a backend that changed its response shape.
    #[error("schema error on {provider}: {message}")]
    Schema { provider: String, message: String },

    /// The circuit breaker is open; the call was rejected without touching
    /// the wire.
    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String },

    /// Didn't match any of the above by string/status. Not retryable by
    /// default — an adapter that can't classify a new failure mode should
    /// fail loud rather than spin.
    #[error("unknown error on {provider}: {message}")]
    Unknown { provider: String, message: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::Billing { provider, .. }
            | Self::RateLimit { provider, .. }
            | Self::Auth { provider, .. }
            | Self::Availability { provider, .. }
            | Self::Network { provider, .. }
            | Self::Schema { provider, .. }
            | Self::CircuitOpen { provider }
            | Self::Unknown { provider, .. } => provider,
        }
    }

    /// Distinct `reason` string drawn from a closed enumeration, for
    /// surfacing on CR conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Billing { .. } => "BillingError",
            Self::RateLimit { .. } => "RateLimited",
            Self::Auth { .. } => "CredentialError",
            Self::Availability { .. } => "AvailabilityError",
            Self::Network { .. } => "NetworkError",
            Self::Schema { .. } => "SchemaError",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::Unknown { .. } => "UnknownError",
        }
    }
}

/// Whether a provider error is eligible for the adapter's internal retry
/// policy. Mirrors the `IsRetryable` split used elsewhere in the corpus:
/// only transient, wire-level failures are retried.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Network { .. } | Self::Availability { .. }
        )
    }
}

/// Fatal for the launch operation; never retried, requires a user fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template is missing required variable `{0}`")]
    MissingRequiredVariable(&'static str),

    #[error("rendered template is not valid YAML: {0}")]
    InvalidYaml(String),

    #[error("rendered template is missing required top-level key `{0}`")]
    MissingTopLevelKey(&'static str),

    #[error("no template was supplied and the NodeClass has no default")]
    NoTemplate,
}
