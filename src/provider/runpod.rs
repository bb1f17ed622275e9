//! GraphQL-over-HTTP adapter for a RunPod-shaped API.
//!
//! RunPod exposes a single GraphQL endpoint rather than REST resources;
//! every operation below is a query or mutation string posted to that one
//! endpoint. GPU type and region vocabulary follow RunPod's own naming
//! (e.g. `"NVIDIA A100 80GB PCIe"`) via `translate_gpu_type`.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::error::ProviderError;
use crate::offering::{BillingGranularity, GpuModel, GpuOffer, NormalizedPricing, Region};
use crate::provider::circuit_breaker::CircuitBreaker;
use crate::provider::retry::RetryPolicy;
use crate::provider::{
    classify_http_error, health_check_result, rate_limiter, AdapterHandle, AdapterRateLimiter,
    GpuInstance, InstanceAddresses, InstanceId, InstanceState, LaunchRequest, OfferFilters,
    ProviderInfo, RateLimits,
};

const DEFAULT_ENDPOINT: &str = "https://api.runpod.io/graphql";

pub struct RunPodAdapter {
    name: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    limiter: AdapterRateLimiter,
    handle: AdapterHandle,
}

impl RunPodAdapter {
    pub fn new(api_key: String) -> Self {
        Self::with_handle(api_key, AdapterHandle::default())
    }

    pub fn with_handle(api_key: String, handle: AdapterHandle) -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT.to_string(), api_key, handle)
    }

    pub fn with_endpoint(endpoint: String, api_key: String, handle: AdapterHandle) -> Self {
        let rate_limits = RateLimits {
            requests_per_second: 5,
            requests_per_minute: 120,
            burst: 10,
        };
        Self {
            name: "runpod".to_string(),
            endpoint,
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
        fail::fail_point!("provider::runpod::call");
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

    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("api_key", self.api_key.as_str())])
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| classify_http_error(&self.name, e.status().map(|s| s.as_u16()), &e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(&self.name, Some(status), &text));
        }

        let envelope: GraphQlEnvelope<T> = response
            .json()
            .await
            .map_err(|e| classify_http_error(&self.name, None, &e.to_string()))?;

        if let Some(errors) = envelope.errors {
            let message = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(classify_http_error(&self.name, None, &message));
        }

        envelope.data.ok_or_else(|| ProviderError::Schema {
            provider: self.name.clone(),
            message: "graphql response had neither data nor errors".to_string(),
        })
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<GpuInstance, ProviderError> {
        self.call(self.handle.launch_timeout, || async {
            let variables = json!({
                "input": {
                    "gpuTypeId": self.translate_gpu_type(&request.gpu_type),
                    "cloudType": "SECURE",
                    "dockerArgs": request.node_init_payload,
                    "containerDiskInGb": 20,
                }
            });
            let data: PodDeployData = self
                .graphql(PODCREATE_MUTATION, variables)
                .await?;
            Ok(GpuInstance {
                id: InstanceId(data.pod_find_and_deploy_on_demand.id),
                state: InstanceState::Pending,
                addresses: InstanceAddresses::default(),
                created_at: Utc::now(),
            })
        })
        .await
    }

    pub async fn terminate(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.call(self.handle.call_timeout, || async {
            let variables = json!({ "input": { "podId": id.0 } });
            let _: PodTerminateData = self.graphql(PODTERMINATE_MUTATION, variables).await?;
            Ok(())
        })
        .await
    }

    pub async fn get_status(&self, id: &InstanceId) -> Result<InstanceState, ProviderError> {
        let result = self
            .call(self.handle.call_timeout, || async {
                let variables = json!({ "input": { "podId": id.0 } });
                let data: PodQueryData = self.graphql(POD_QUERY, variables).await?;
                Ok(match data.pod.desired_status.as_str() {
                    "RUNNING" => InstanceState::Running,
                    "EXITED" => InstanceState::Terminated,
                    "TERMINATED" => InstanceState::Terminated,
                    "RESTARTING" | "CREATED" => InstanceState::Pending,
                    _ => InstanceState::Unknown,
                })
            })
            .await;
        crate::metrics::record_health_check(&self.name, health_check_result(&result));
        result
    }

    pub async fn list_available(&self, filters: &OfferFilters) -> Result<Vec<GpuOffer>, ProviderError> {
        let types = self
            .call(self.handle.call_timeout, || async {
                let data: GpuTypesData = self.graphql(GPU_TYPES_QUERY, json!({})).await?;
                Ok(data.gpu_types)
            })
            .await?;

        Ok(types
            .into_iter()
            .map(|t| GpuOffer {
                id: t.id.clone(),
                provider: self.name.clone(),
                gpu_type: GpuModel::from_standard_name(&normalize_runpod_name(&t.id)),
                region: Region("any".into()),
                hourly_price: t.secure_price,
                spot_price: t.community_price,
                memory_mib: (t.memory_in_gb * 1024.0) as u32,
                storage_gib: None,
                available: t.secure_price > 0.0,
                is_spot: false,
            })
            .filter(|offer| {
                filters.gpu_type.as_ref().is_none_or(|g| &offer.gpu_type == g)
                    && filters.max_price.is_none_or(|m| offer.hourly_price <= m)
            })
            .collect())
    }

    pub async fn get_normalized_pricing(
        &self,
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Result<NormalizedPricing, ProviderError> {
        let offers = self
            .list_available(&OfferFilters {
                gpu_type: Some(gpu_type.clone()),
                region: None,
                max_price: None,
                spot_only: false,
            })
            .await?;
        let cheapest = offers
            .into_iter()
            .min_by(|a, b| a.hourly_price.total_cmp(&b.hourly_price))
            .ok_or_else(|| ProviderError::Availability {
                provider: self.name.clone(),
                gpu_type: gpu_type.to_string(),
                region: region.0.clone(),
                message: "no matching gpu types".to_string(),
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
            supported_regions: vec![Region("any".into())],
            supported_gpu_types: vec![
                GpuModel::NvidiaA10G,
                GpuModel::NvidiaA100,
                GpuModel::NvidiaH100,
            ],
            supports_spot: true,
            billing_granularity: BillingGranularity::PerHour,
        }
    }

    pub fn get_rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 5,
            requests_per_minute: 120,
            burst: 10,
        }
    }

    pub fn translate_gpu_type(&self, standard: &GpuModel) -> String {
        match standard {
            GpuModel::NvidiaT4 => "NVIDIA Tesla T4".to_string(),
            GpuModel::NvidiaL4 => "NVIDIA L4".to_string(),
            GpuModel::NvidiaA10G => "NVIDIA A10".to_string(),
            GpuModel::NvidiaA100 => "NVIDIA A100 80GB PCIe".to_string(),
            GpuModel::NvidiaH100 => "NVIDIA H100 80GB HBM3".to_string(),
            GpuModel::Other(s) => s.clone(),
        }
    }

    pub fn translate_region(&self, _standard: &Region) -> String {
        "any".to_string()
    }
}

/// RunPod's GPU type IDs aren't the vendor display names; fold the ones this
/// adapter is expected to encounter back to the standard enum's vocabulary.
fn normalize_runpod_name(id: &str) -> String {
    let upper = id.to_ascii_uppercase();
    if upper.contains("H100") {
        "H100".to_string()
    } else if upper.contains("A100") {
        "A100".to_string()
    } else if upper.contains("A10") {
        "A10G".to_string()
    } else if upper.contains("L4") {
        "L4".to_string()
    } else if upper.contains("T4") {
        "T4".to_string()
    } else {
        id.to_string()
    }
}

const PODCREATE_MUTATION: &str = "mutation podFindAndDeployOnDemand($input: PodFindAndDeployOnDemandInput!) { podFindAndDeployOnDemand(input: $input) { id } }";
const PODTERMINATE_MUTATION: &str =
    "mutation podTerminate($input: PodTerminateInput!) { podTerminate(input: $input) }";
const POD_QUERY: &str = "query pod($input: PodFilter!) { pod(input: $input) { id desiredStatus } }";
const GPU_TYPES_QUERY: &str = "query gpuTypes { gpuTypes { id memoryInGb secureCloud communityCloud securePrice communityPrice } }";

#[derive(Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct PodDeployData {
    #[serde(rename = "podFindAndDeployOnDemand")]
    pod_find_and_deploy_on_demand: PodRef,
}

#[derive(Deserialize)]
struct PodRef {
    id: String,
}

#[derive(Deserialize)]
struct PodTerminateData {
    #[serde(rename = "podTerminate")]
    #[allow(dead_code)]
    pod_terminate: Option<bool>,
}

#[derive(Deserialize)]
struct PodQueryData {
    pod: PodStatusRef,
}

#[derive(Deserialize)]
struct PodStatusRef {
    #[serde(rename = "desiredStatus")]
    desired_status: String,
}

#[derive(Deserialize)]
struct GpuTypesData {
    #[serde(rename = "gpuTypes")]
    gpu_types: Vec<GpuTypeEntry>,
}

#[derive(Deserialize)]
struct GpuTypeEntry {
    id: String,
    #[serde(rename = "memoryInGb")]
    memory_in_gb: f64,
    #[serde(rename = "securePrice")]
    secure_price: f64,
    #[serde(rename = "communityPrice")]
    community_price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_standard_names_to_runpod_vocabulary() {
        let adapter = RunPodAdapter::new("key".into());
        assert_eq!(
            adapter.translate_gpu_type(&GpuModel::NvidiaH100),
            "NVIDIA H100 80GB HBM3"
        );
    }

    #[test]
    fn normalizes_runpod_ids_back_to_standard_names() {
        assert_eq!(normalize_runpod_name("NVIDIA A100 80GB PCIe"), "A100");
        assert_eq!(normalize_runpod_name("some-unrecognized-id"), "some-unrecognized-id");
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_before_the_wire() {
        let adapter = RunPodAdapter::new("key".into());
        for _ in 0..5 {
            adapter.breaker.record_failure();
        }
        let result = adapter
            .terminate(&InstanceId("does-not-matter".into()))
            .await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen { .. })));
    }
}
