//! Cloud-SDK adapter over Hetzner Cloud, using the generated `hcloud` client
//! rather than hand-rolled REST calls — the one backend in this operator that
//! talks to its provider through a typed SDK instead of a bespoke HTTP
//! client.

use chrono::Utc;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::servers_api;
use hcloud::apis::Error as HcloudError;
use hcloud::models::{CreateServerRequest, ServerTypeServerType};

use crate::error::ProviderError;
use crate::offering::{BillingGranularity, GpuModel, GpuOffer, NormalizedPricing, Region};
use crate::provider::circuit_breaker::CircuitBreaker;
use crate::provider::retry::RetryPolicy;
use crate::provider::{
    classify_http_error, health_check_result, rate_limiter, AdapterHandle, AdapterRateLimiter,
    GpuInstance, InstanceAddresses, InstanceId, InstanceState, LaunchRequest, OfferFilters,
    ProviderInfo, RateLimits,
};
use std::time::Duration;

/// Hetzner's dedicated GPU server type family as of this writing. Only two
/// sizes exist; `translate_gpu_type` maps the standard enum onto them by
/// VRAM band rather than a 1:1 name correspondence.
const SERVER_TYPE_GPU_SMALL: &str = "ccx63-gpu";
const SERVER_TYPE_GPU_LARGE: &str = "ccx83-gpu";

pub struct HetznerAdapter {
    name: String,
    config: Configuration,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    limiter: AdapterRateLimiter,
    handle: AdapterHandle,
}

impl HetznerAdapter {
    pub fn new(api_token: String) -> Self {
        Self::with_handle(api_token, AdapterHandle::default())
    }

    pub fn with_handle(api_token: String, handle: AdapterHandle) -> Self {
        let mut config = Configuration::new();
        config.bearer_access_token = Some(api_token);
        let rate_limits = RateLimits {
            requests_per_second: 3,
            requests_per_minute: 3600,
            burst: 10,
        };
        Self {
            name: "hetzner".to_string(),
            config,
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
        fail::fail_point!("provider::hetzner::call");
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

    fn classify_hcloud_error<E: std::fmt::Debug>(&self, err: &HcloudError<E>) -> ProviderError {
        let status = match err {
            HcloudError::ResponseError(r) => Some(r.status.as_u16()),
            _ => None,
        };
        classify_http_error(&self.name, status, &format!("{err:?}"))
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<GpuInstance, ProviderError> {
        self.call(self.handle.launch_timeout, || async {
            let server_type = self.translate_gpu_type(&request.gpu_type);
            let body = CreateServerRequest {
                name: format!("tgp-{}", uuid::Uuid::new_v4()),
                server_type,
                location: Some(self.translate_region(&request.region)),
                user_data: Some(request.node_init_payload.clone()),
                ..Default::default()
            };
            let response = servers_api::create_server(&self.config, body)
                .await
                .map_err(|e| self.classify_hcloud_error(&e))?;
            let server = *response.server;
            Ok(GpuInstance {
                id: InstanceId(server.id.to_string()),
                state: InstanceState::Pending,
                addresses: InstanceAddresses {
                    public_ip: server
                        .public_net
                        .ipv4
                        .and_then(|n| n.ip.parse().ok()),
                    private_ip: None,
                },
                created_at: Utc::now(),
            })
        })
        .await
    }

    pub async fn terminate(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.call(self.handle.call_timeout, || async {
            let server_id: i64 = id.0.parse().map_err(|_| ProviderError::Schema {
                provider: self.name.clone(),
                message: format!("instance id `{}` is not a hetzner server id", id.0),
            })?;
            match servers_api::delete_server(&self.config, server_id).await {
                Ok(_) => Ok(()),
                Err(HcloudError::ResponseError(r)) if r.status.as_u16() == 404 => Ok(()),
                Err(e) => Err(self.classify_hcloud_error(&e)),
            }
        })
        .await
    }

    pub async fn get_status(&self, id: &InstanceId) -> Result<InstanceState, ProviderError> {
        let result = self
            .call(self.handle.call_timeout, || async {
                let server_id: i64 = id.0.parse().map_err(|_| ProviderError::Schema {
                    provider: self.name.clone(),
                    message: format!("instance id `{}` is not a hetzner server id", id.0),
                })?;
                let response = servers_api::get_server(&self.config, server_id)
                    .await
                    .map_err(|e| self.classify_hcloud_error(&e))?;
                Ok(match response.server.status {
                    hcloud::models::server::Status::Running => InstanceState::Running,
                    hcloud::models::server::Status::Initializing
                    | hcloud::models::server::Status::Starting => InstanceState::Pending,
                    hcloud::models::server::Status::Stopping
                    | hcloud::models::server::Status::Off => InstanceState::Terminating,
                    hcloud::models::server::Status::Deleting => InstanceState::Terminating,
                    _ => InstanceState::Unknown,
                })
            })
            .await;
        crate::metrics::record_health_check(&self.name, health_check_result(&result));
        result
    }

    /// Hetzner has no spot/availability query endpoint analogous to the
    /// marketplace-style adapters; this returns the fixed catalogue of GPU
    /// server types, all treated as permanently available.
    pub async fn list_available(&self, filters: &OfferFilters) -> Result<Vec<GpuOffer>, ProviderError> {
        let offers: Vec<GpuOffer> = self
            .call(self.handle.call_timeout, || async {
                let response = servers_api::list_server_types(&self.config, Default::default())
                    .await
                    .map_err(|e| self.classify_hcloud_error(&e))?;
                Ok(response
                    .server_types
                    .into_iter()
                    .filter(|t| matches!(t.r#type, ServerTypeServerType::Dedicated) && t.name.ends_with("-gpu"))
                    .map(|t| GpuOffer {
                        id: t.name.clone(),
                        provider: self.name.clone(),
                        gpu_type: gpu_model_for_server_type(&t.name),
                        region: Region("fsn1".into()),
                        hourly_price: t
                            .prices
                            .first()
                            .and_then(|p| p.price_hourly.gross.parse::<f64>().ok())
                            .unwrap_or(0.0),
                        spot_price: None,
                        memory_mib: (t.memory * 1024.0) as u32,
                        storage_gib: Some(t.disk as u32),
                        available: true,
                        is_spot: false,
                    })
                    .collect())
            })
            .await?;

        Ok(offers
            .into_iter()
            .filter(|o| {
                filters.gpu_type.as_ref().is_none_or(|g| &o.gpu_type == g)
                    && filters.max_price.is_none_or(|m| o.hourly_price <= m)
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
        let offer = offers
            .first()
            .ok_or_else(|| ProviderError::Availability {
                provider: self.name.clone(),
                gpu_type: gpu_type.to_string(),
                region: region.0.clone(),
                message: "no matching server type in catalogue".to_string(),
            })?;
        Ok(NormalizedPricing::from_hourly(
            offer.hourly_price,
            BillingGranularity::PerHour,
            Utc::now(),
        ))
    }

    pub fn get_provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            supported_regions: vec![
                Region("fsn1".into()),
                Region("nbg1".into()),
                Region("hel1".into()),
            ],
            supported_gpu_types: vec![GpuModel::NvidiaA100, GpuModel::NvidiaH100],
            supports_spot: false,
            billing_granularity: BillingGranularity::PerHour,
        }
    }

    pub fn get_rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 3,
            requests_per_minute: 3600,
            burst: 10,
        }
    }

    /// Hetzner has exactly two GPU server types; pick by VRAM band rather
    /// than a true name translation.
    pub fn translate_gpu_type(&self, standard: &GpuModel) -> String {
        if standard.typical_vram_gib() >= 80 {
            SERVER_TYPE_GPU_LARGE.to_string()
        } else {
            SERVER_TYPE_GPU_SMALL.to_string()
        }
    }

    pub fn translate_region(&self, standard: &Region) -> String {
        standard.0.clone()
    }
}

fn gpu_model_for_server_type(name: &str) -> GpuModel {
    if name == SERVER_TYPE_GPU_LARGE {
        GpuModel::NvidiaH100
    } else if name == SERVER_TYPE_GPU_SMALL {
        GpuModel::NvidiaA100
    } else {
        GpuModel::Other(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_by_vram_band_not_name() {
        let adapter = HetznerAdapter::new("token".into());
        assert_eq!(adapter.translate_gpu_type(&GpuModel::NvidiaH100), SERVER_TYPE_GPU_LARGE);
        assert_eq!(adapter.translate_gpu_type(&GpuModel::NvidiaT4), SERVER_TYPE_GPU_SMALL);
    }

    #[test]
    fn reverse_maps_known_server_types() {
        assert_eq!(gpu_model_for_server_type(SERVER_TYPE_GPU_LARGE), GpuModel::NvidiaH100);
        assert_eq!(gpu_model_for_server_type(SERVER_TYPE_GPU_SMALL), GpuModel::NvidiaA100);
        assert_eq!(
            gpu_model_for_server_type("unknown-type"),
            GpuModel::Other("unknown-type".to_string())
        );
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_before_the_wire() {
        let adapter = HetznerAdapter::new("token".into());
        for _ in 0..5 {
            adapter.breaker.record_failure();
        }
        let result = adapter.terminate(&InstanceId("123".into())).await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen { .. })));
    }
}
