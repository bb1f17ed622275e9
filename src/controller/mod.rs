//! Reconciler wiring for the two watched kinds.
//!
//! Each submodule owns one kind's reconcile function and error policy; both
//! share a [`Context`] carrying the `kube::Client`, the process config, and
//! the pricing cache (mutated by either reconciler, guarded by a single
//! reader-writer lock — here a `PricingCache` wrapping its own `RwLock`,
//! handed out by `Arc` so both controllers' work queues share one instance).

pub mod nodeclass;
pub mod nodepool;

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::pricing::PricingCache;
use crate::provider::AdapterHandle;

/// Shared reconciler context. Cheap to clone — everything behind it is
/// already `Arc`/cheaply-cloneable, matching `kube::runtime::Controller`'s
/// expectation that `Ctx` be `Arc<Context>`.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub pricing: PricingCache,
    /// Cancelled on operator shutdown; every provider adapter constructed
    /// through [`Context::adapter_handle`] races its wire calls against it.
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Arc<Self> {
        let pricing = PricingCache::new(config.pricing_cache_ttl());
        Arc::new(Self {
            client,
            config,
            pricing,
            shutdown: CancellationToken::new(),
        })
    }

    /// The timeout/shutdown handle every provider adapter built during this
    /// reconcile should carry.
    pub fn adapter_handle(&self) -> AdapterHandle {
        AdapterHandle::new(
            self.config.provider_call_timeout(),
            self.config.launch_timeout(),
            self.shutdown.clone(),
        )
    }
}
