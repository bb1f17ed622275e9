//! A deterministic, in-memory provider adapter for reconciler and resilience
//! tests. Each call to `launch()`/`terminate()` pops the next scripted
//! behaviour from a queue; when the queue is empty, the configured default
//! applies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::error::ProviderError;
use crate::offering::{BillingGranularity, GpuModel, GpuOffer, NormalizedPricing, Region};
use crate::provider::{
    GpuInstance, InstanceAddresses, InstanceId, InstanceState, LaunchRequest, OfferFilters,
    ProviderInfo, RateLimits,
};

/// What happens on the next `launch()` call.
#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    Succeed,
    SucceedAfterDelay(Duration),
    Unavailable,
    Billing(String),
    RateLimited,
    Auth(String),
    Network(String),
}

/// What happens on the next `terminate()` call.
#[derive(Debug, Clone)]
pub enum TerminateBehavior {
    Succeed,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct LaunchCall {
    pub request_gpu_type: GpuModel,
    pub request_region: Region,
    pub result_instance_id: Option<InstanceId>,
}

#[derive(Debug, Clone)]
pub struct TerminateCall {
    pub instance_id: InstanceId,
}

struct State {
    offerings: Vec<GpuOffer>,
    list_available_error: Option<ProviderError>,
    pricing: std::collections::HashMap<(String, String), f64>,
    pricing_delay: Option<Duration>,
    pricing_calls: u32,
    launch_behaviors: VecDeque<LaunchBehavior>,
    terminate_behaviors: VecDeque<TerminateBehavior>,
    default_launch: LaunchBehavior,
    default_terminate: TerminateBehavior,
    launch_calls: Vec<LaunchCall>,
    terminate_calls: Vec<TerminateCall>,
}

/// In-memory scripted provider. Cheap to `Clone` — state lives behind an
/// `Arc<Mutex<_>>` so the same fake can be shared across concurrent
/// reconciles in a test.
#[derive(Clone)]
pub struct FakeProvider {
    name: String,
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State {
                offerings: Vec::new(),
                list_available_error: None,
                pricing: std::collections::HashMap::new(),
                pricing_delay: None,
                pricing_calls: 0,
                launch_behaviors: VecDeque::new(),
                terminate_behaviors: VecDeque::new(),
                default_launch: LaunchBehavior::Succeed,
                default_terminate: TerminateBehavior::Succeed,
                launch_calls: Vec::new(),
                terminate_calls: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_offerings(self, offerings: Vec<GpuOffer>) -> Self {
        self.state.lock().unwrap().offerings = offerings;
        self
    }

    /// Makes every subsequent `list_available()` call fail with `err`
    /// instead of returning the configured offerings.
    pub fn with_list_available_error(self, err: ProviderError) -> Self {
        self.state.lock().unwrap().list_available_error = Some(err);
        self
    }

    /// Sets the price `get_normalized_pricing` returns for a given
    /// (gpu_type, region) pair.
    pub fn with_price(self, gpu_type: &GpuModel, region: &Region, price_per_hour: f64) -> Self {
        self.state
            .lock()
            .unwrap()
            .pricing
            .insert((gpu_type.to_string(), region.0.clone()), price_per_hour);
        self
    }

    /// Makes `get_normalized_pricing` sleep for `delay` before returning,
    /// so tests can exercise the pricing cache's concurrent-fetch dedup:
    /// a cache hit after concurrent fetches should call the underlying
    /// adapter exactly once.
    pub fn with_pricing_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().pricing_delay = Some(delay);
        self
    }

    /// Number of times `get_normalized_pricing` has actually executed
    /// (i.e. not served from the cache sitting in front of this adapter).
    pub fn pricing_calls(&self) -> u32 {
        self.state.lock().unwrap().pricing_calls
    }

    pub fn on_next_launch(self, behavior: LaunchBehavior) -> Self {
        self.state.lock().unwrap().launch_behaviors.push_back(behavior);
        self
    }

    pub fn on_next_terminate(self, behavior: TerminateBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .terminate_behaviors
            .push_back(behavior);
        self
    }

    pub fn with_default_launch(self, behavior: LaunchBehavior) -> Self {
        self.state.lock().unwrap().default_launch = behavior;
        self
    }

    pub fn launch_calls(&self) -> Vec<LaunchCall> {
        self.state.lock().unwrap().launch_calls.clone()
    }

    pub fn terminate_calls(&self) -> Vec<TerminateCall> {
        self.state.lock().unwrap().terminate_calls.clone()
    }

    fn next_instance_id(&self) -> InstanceId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        InstanceId(format!("{}-instance-{n}", self.name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<GpuInstance, ProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .launch_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_launch.clone())
        };

        let result = match behavior {
            LaunchBehavior::Succeed => Ok(GpuInstance {
                id: self.next_instance_id(),
                state: InstanceState::Pending,
                addresses: InstanceAddresses::default(),
                created_at: Utc::now(),
            }),
            LaunchBehavior::SucceedAfterDelay(d) => {
                tokio::time::sleep(d).await;
                Ok(GpuInstance {
                    id: self.next_instance_id(),
                    state: InstanceState::Pending,
                    addresses: InstanceAddresses::default(),
                    created_at: Utc::now(),
                })
            }
            LaunchBehavior::Unavailable => Err(ProviderError::Availability {
                provider: self.name.clone(),
                gpu_type: request.gpu_type.to_string(),
                region: request.region.0.clone(),
                message: "no capacity".to_string(),
            }),
            LaunchBehavior::Billing(msg) => Err(ProviderError::Billing {
                provider: self.name.clone(),
                message: msg,
            }),
            LaunchBehavior::RateLimited => Err(ProviderError::RateLimit {
                provider: self.name.clone(),
                message: "429".to_string(),
            }),
            LaunchBehavior::Auth(msg) => Err(ProviderError::Auth {
                provider: self.name.clone(),
                message: msg,
            }),
            LaunchBehavior::Network(msg) => Err(ProviderError::Network {
                provider: self.name.clone(),
                message: msg,
            }),
        };

        let result_instance_id = result.as_ref().ok().map(|i| i.id.clone());
        self.state.lock().unwrap().launch_calls.push(LaunchCall {
            request_gpu_type: request.gpu_type.clone(),
            request_region: request.region.clone(),
            result_instance_id,
        });

        result
    }

    pub async fn terminate(&self, id: &InstanceId) -> Result<(), ProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .terminate_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_terminate.clone())
        };

        self.state
            .lock()
            .unwrap()
            .terminate_calls
            .push(TerminateCall {
                instance_id: id.clone(),
            });

        match behavior {
            TerminateBehavior::Succeed => Ok(()),
            TerminateBehavior::Fail(msg) => Err(ProviderError::Unknown {
                provider: self.name.clone(),
                message: msg,
            }),
        }
    }

    pub async fn get_status(&self, _id: &InstanceId) -> Result<InstanceState, ProviderError> {
        Ok(InstanceState::Running)
    }

    pub async fn list_available(&self, filters: &OfferFilters) -> Result<Vec<GpuOffer>, ProviderError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.list_available_error {
            return Err(err.clone());
        }
        Ok(state
            .offerings
            .iter()
            .filter(|o| {
                filters
                    .gpu_type
                    .as_ref()
                    .is_none_or(|t| &o.gpu_type == t)
                    && filters.region.as_ref().is_none_or(|r| &o.region == r)
                    && filters.max_price.is_none_or(|m| o.hourly_price <= m)
                    && (!filters.spot_only || o.is_spot)
            })
            .cloned()
            .collect())
    }

    pub async fn get_normalized_pricing(
        &self,
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Result<NormalizedPricing, ProviderError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.pricing_calls += 1;
            state.pricing_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        state
            .pricing
            .get(&(gpu_type.to_string(), region.0.clone()))
            .map(|&price| NormalizedPricing::from_hourly(price, BillingGranularity::PerHour, Utc::now()))
            .ok_or_else(|| ProviderError::Availability {
                provider: self.name.clone(),
                gpu_type: gpu_type.to_string(),
                region: region.0.clone(),
                message: "no pricing configured for this pair".to_string(),
            })
    }

    pub fn get_provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            supported_regions: vec![Region("us-east-1".into())],
            supported_gpu_types: vec![GpuModel::NvidiaA100, GpuModel::NvidiaH100],
            supports_spot: true,
            billing_granularity: BillingGranularity::PerHour,
        }
    }

    pub fn get_rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 100,
            requests_per_minute: 1000,
            burst: 50,
        }
    }

    pub fn translate_gpu_type(&self, standard: &GpuModel) -> String {
        standard.to_string()
    }

    pub fn translate_region(&self, standard: &Region) -> String {
        standard.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LaunchRequest {
        LaunchRequest {
            gpu_type: GpuModel::NvidiaA100,
            region: Region("us-east-1".into()),
            node_init_payload: "payload".into(),
            labels: Default::default(),
            spot_preference: false,
            max_price: None,
        }
    }

    #[tokio::test]
    async fn default_launch_succeeds() {
        let provider = FakeProvider::new("fake");
        let result = provider.launch(&request()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn queued_behaviors_consumed_in_order() {
        let provider = FakeProvider::new("fake")
            .on_next_launch(LaunchBehavior::Unavailable)
            .on_next_launch(LaunchBehavior::Succeed);

        assert!(provider.launch(&request()).await.is_err());
        assert!(provider.launch(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn terminate_on_missing_instance_is_success() {
        let provider = FakeProvider::new("fake");
        let result = provider.terminate(&InstanceId("does-not-exist".into())).await;
        assert!(result.is_ok());
        assert_eq!(provider.terminate_calls().len(), 1);
    }

    #[tokio::test]
    async fn pricing_lookup_returns_configured_price() {
        let provider = FakeProvider::new("fake").with_price(
            &GpuModel::NvidiaA100,
            &Region("us-east-1".into()),
            2.21,
        );
        let pricing = provider
            .get_normalized_pricing(&GpuModel::NvidiaA100, &Region("us-east-1".into()))
            .await
            .unwrap();
        assert_eq!(pricing.price_per_hour, 2.21);
    }

    #[tokio::test]
    async fn list_available_filters_by_gpu_type_and_price() {
        let provider = FakeProvider::new("fake").with_offerings(vec![
            GpuOffer {
                id: "a".into(),
                provider: "fake".into(),
                gpu_type: GpuModel::NvidiaA100,
                region: Region("us-east-1".into()),
                hourly_price: 2.0,
                spot_price: None,
                memory_mib: 0,
                storage_gib: None,
                available: true,
                is_spot: false,
            },
            GpuOffer {
                id: "b".into(),
                provider: "fake".into(),
                gpu_type: GpuModel::NvidiaH100,
                region: Region("us-east-1".into()),
                hourly_price: 5.0,
                spot_price: None,
                memory_mib: 0,
                storage_gib: None,
                available: true,
                is_spot: false,
            },
        ]);
        let filtered = provider
            .list_available(&OfferFilters {
                gpu_type: Some(GpuModel::NvidiaA100),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "a");
    }

    #[tokio::test]
    async fn list_available_propagates_the_scripted_error() {
        let provider = FakeProvider::new("fake").with_list_available_error(ProviderError::RateLimit {
            provider: "fake".into(),
            message: "too many requests".into(),
        });
        let result = provider.list_available(&OfferFilters::default()).await;
        assert!(matches!(result, Err(ProviderError::RateLimit { .. })));
    }
}
