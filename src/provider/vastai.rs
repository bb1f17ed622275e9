//! REST adapter for a Vast.ai-shaped GPU marketplace API.
//!
//! Every wire call goes through the shared [`CircuitBreaker`] and
//! [`RetryPolicy`]: the breaker gates the call before it's attempted, the
//! retry policy wraps the HTTP round trip, and failures are classified via
//! [`classify_http_error`] before either of those sees them.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::error::ProviderError;
use crate::offering::{BillingGranularity, GpuModel, GpuOffer, NormalizedPricing, Region};
use crate::provider::circuit_breaker::CircuitBreaker;
use crate::provider::retry::RetryPolicy;
use crate::provider::{
    classify_http_error, health_check_result, rate_limiter, AdapterHandle, AdapterRateLimiter,
    GpuInstance, InstanceAddresses, InstanceId, InstanceState, LaunchRequest, OfferFilters,
    ProviderInfo, RateLimits,
};

const DEFAULT_BASE_URL: &str = "https://console.vast.ai/api/v0";

pub struct VastAiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    limiter: AdapterRateLimiter,
    handle: AdapterHandle,
}

impl VastAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self::with_handle(api_key, AdapterHandle::default())
    }

    pub fn with_handle(api_key: String, handle: AdapterHandle) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), api_key, handle)
    }

    pub fn with_base_url(base_url: String, api_key: String, handle: AdapterHandle) -> Self {
        let rate_limits = RateLimits {
            requests_per_second: 10,
            requests_per_minute: 300,
            burst: 20,
        };
        Self {
            name: "vastai".to_string(),
            base_url,
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with static config"),
            breaker: CircuitBreaker::new(),
            retry: RetryPolicy::default(),
            limiter: rate_limiter(&rate_limits),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<T, F, Fut>(&self, timeout: Duration, f: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        if !self.breaker.allow() {
            return Err(ProviderError::CircuitOpen {
                provider: self.name.clone(),
            });
        }
        fail::fail_point!("provider::vastai::call");
        self.limiter.until_ready().await;

        let outcome = tokio::select! {
            biased;
            _ = self.handle.shutdown.cancelled() => Err(ProviderError::Network {
                provider: self.name.clone(),
                message: "operator shutting down".to_string(),
            }),
            attempt = tokio::time::timeout(timeout, self.retry.execute(&self.name, &f)) => {
                attempt.unwrap_or_else(|_| Err(ProviderError::Network {
                    provider: self.name.clone(),
                    message: format!("call timed out after {timeout:?}"),
                }))
            }
        };

        crate::metrics::record_provider_call(&self.name, if outcome.is_ok() { "success" } else { "error" });
        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(e) if !matches!(e, ProviderError::CircuitOpen { .. }) => {
                self.breaker.record_failure()
            }
            Err(_) => {}
        }
        outcome
    }

    fn classify_reqwest_error(&self, err: &reqwest::Error) -> ProviderError {
        let status = err.status().map(|s| s.as_u16());
        classify_http_error(&self.name, status, &err.to_string())
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<GpuInstance, ProviderError> {
        self.call(self.handle.launch_timeout, || async {
            let body = LaunchBody {
                gpu_name: self.translate_gpu_type(&request.gpu_type),
                region: self.translate_region(&request.region),
                onstart: request.node_init_payload.clone(),
                price: request.max_price,
            };

            let response = self
                .client
                .post(format!("{}/asks/", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.classify_reqwest_error(&e))?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                return Err(classify_http_error(&self.name, Some(status), &text));
            }

            let parsed: LaunchResponse = response
                .json()
                .await
                .map_err(|e| self.classify_reqwest_error(&e))?;

            Ok(GpuInstance {
                id: InstanceId(parsed.new_contract.to_string()),
                state: InstanceState::Pending,
                addresses: InstanceAddresses::default(),
                created_at: Utc::now(),
            })
        })
        .await
    }

    pub async fn terminate(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.call(self.handle.call_timeout, || async {
            let response = self
                .client
                .delete(format!("{}/instances/{}/", self.base_url, id.0))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| self.classify_reqwest_error(&e))?;

            if response.status().is_success() || response.status().as_u16() == 404 {
                return Ok(());
            }
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            Err(classify_http_error(&self.name, Some(status), &text))
        })
        .await
    }

    pub async fn get_status(&self, id: &InstanceId) -> Result<InstanceState, ProviderError> {
        let result = self
            .call(self.handle.call_timeout, || async {
                let response = self
                    .client
                    .get(format!("{}/instances/{}/", self.base_url, id.0))
                    .bearer_auth(&self.api_key)
                    .send()
                    .await
                    .map_err(|e| self.classify_reqwest_error(&e))?;

                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    return Err(classify_http_error(&self.name, Some(status), &text));
                }

                let parsed: StatusResponse = response
                    .json()
                    .await
                    .map_err(|e| self.classify_reqwest_error(&e))?;

                Ok(match parsed.actual_status.as_str() {
                    "loading" => InstanceState::Pending,
                    "running" => InstanceState::Running,
                    "exited" => InstanceState::Terminated,
                    "offline" => InstanceState::Failed,
                    _ => InstanceState::Unknown,
                })
            })
            .await;
        crate::metrics::record_health_check(&self.name, health_check_result(&result));
        result
    }

    pub async fn list_available(&self, filters: &OfferFilters) -> Result<Vec<GpuOffer>, ProviderError> {
        let query_region = filters.region.clone();
        let offers = self
            .call(self.handle.call_timeout, || async {
                let mut req = self
                    .client
                    .get(format!("{}/bundles/", self.base_url))
                    .bearer_auth(&self.api_key);
                if let Some(r) = &query_region {
                    req = req.query(&[("region", self.translate_region(r))]);
                }
                let response = req
                    .send()
                    .await
                    .map_err(|e| self.classify_reqwest_error(&e))?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    return Err(classify_http_error(&self.name, Some(status), &text));
                }
                let parsed: OffersResponse = response
                    .json()
                    .await
                    .map_err(|e| self.classify_reqwest_error(&e))?;
                Ok(parsed.offers)
            })
            .await?;

        Ok(offers
            .into_iter()
            .map(|o| GpuOffer {
                id: o.id.to_string(),
                provider: self.name.clone(),
                gpu_type: GpuModel::from_standard_name(&o.gpu_name),
                region: Region(o.geolocation),
                hourly_price: o.dph_total,
                spot_price: None,
                memory_mib: (o.gpu_ram * 1024.0) as u32,
                storage_gib: Some(o.disk_space as u32),
                available: o.rentable,
                is_spot: false,
            })
            .filter(|offer| {
                filters.gpu_type.as_ref().is_none_or(|t| &offer.gpu_type == t)
                    && filters.max_price.is_none_or(|m| offer.hourly_price <= m)
            })
            .collect())
    }

    pub async fn get_normalized_pricing(
        &self,
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Result<NormalizedPricing, ProviderError> {
        let filters = OfferFilters {
            gpu_type: Some(gpu_type.clone()),
            region: Some(region.clone()),
            max_price: None,
            spot_only: false,
        };
        let offers = self.list_available(&filters).await?;
        let cheapest = offers
            .iter()
            .filter(|o| o.available)
            .min_by(|a, b| a.hourly_price.total_cmp(&b.hourly_price))
            .ok_or_else(|| ProviderError::Availability {
                provider: self.name.clone(),
                gpu_type: gpu_type.to_string(),
                region: region.0.clone(),
                message: "no matching offers".to_string(),
            })?;
        Ok(NormalizedPricing::from_hourly(
            cheapest.hourly_price,
            BillingGranularity::PerHour,
            Utc::now(),
        ))
    }

    pub fn get_provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            supported_regions: vec![
                Region("North_America".into()),
                Region("Europe".into()),
                Region("Asia".into()),
            ],
            supported_gpu_types: vec![
                GpuModel::NvidiaT4,
                GpuModel::NvidiaL4,
                GpuModel::NvidiaA10G,
                GpuModel::NvidiaA100,
                GpuModel::NvidiaH100,
            ],
            supports_spot: false,
            billing_granularity: BillingGranularity::PerHour,
        }
    }

    pub fn get_rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 10,
            requests_per_minute: 300,
            burst: 20,
        }
    }

    pub fn translate_gpu_type(&self, standard: &GpuModel) -> String {
        match standard {
            GpuModel::NvidiaT4 => "Tesla T4".to_string(),
            GpuModel::NvidiaL4 => "L4".to_string(),
            GpuModel::NvidiaA10G => "A10".to_string(),
            GpuModel::NvidiaA100 => "A100".to_string(),
            GpuModel::NvidiaH100 => "H100 SXM".to_string(),
            GpuModel::Other(s) => s.clone(),
        }
    }

    pub fn translate_region(&self, standard: &Region) -> String {
        standard.0.clone()
    }
}

#[derive(serde::Serialize)]
struct LaunchBody {
    gpu_name: String,
    region: String,
    onstart: String,
    price: Option<f64>,
}

#[derive(Deserialize)]
struct LaunchResponse {
    new_contract: u64,
}

#[derive(Deserialize)]
struct StatusResponse {
    actual_status: String,
}

#[derive(Deserialize)]
struct OffersResponse {
    offers: Vec<OfferEntry>,
}

#[derive(Deserialize)]
struct OfferEntry {
    id: u64,
    gpu_name: String,
    geolocation: String,
    dph_total: f64,
    gpu_ram: f64,
    disk_space: f64,
    rentable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_standard_gpu_names_to_vastai_vocabulary() {
        let adapter = VastAiAdapter::new("key".into());
        assert_eq!(adapter.translate_gpu_type(&GpuModel::NvidiaT4), "Tesla T4");
        assert_eq!(adapter.translate_gpu_type(&GpuModel::NvidiaH100), "H100 SXM");
    }

    #[test]
    fn passes_through_unrecognized_gpu_names() {
        let adapter = VastAiAdapter::new("key".into());
        assert_eq!(
            adapter.translate_gpu_type(&GpuModel::Other("RTX4090".into())),
            "RTX4090"
        );
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_before_the_wire() {
        let adapter = VastAiAdapter::new("key".into());
        for _ in 0..5 {
            adapter.breaker.record_failure();
        }
        let result = adapter
            .terminate(&InstanceId("does-not-matter".into()))
            .await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen { .. })));
    }
}
