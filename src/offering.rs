//! Value objects shared across the provider layer, pricing cache, and
//! reconcilers: GPU/region/instance-type newtypes, resource descriptions,
//! and the normalized offer/pricing shapes adapters return.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

/// Where an offer physically lives. Region and zone are kept as distinct
/// types so a caller can't accidentally pass one where the other belongs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Zone(pub String);

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The provider's native identifier for an instance/pod type. Opaque to the
/// caller — only the owning adapter interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceType(pub String);

/// Canonical GPU model. `Other` lets an adapter surface a model this
/// enumeration hasn't caught up with yet without failing outright.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuModel {
    NvidiaT4,
    NvidiaL4,
    NvidiaA10G,
    NvidiaA100,
    NvidiaH100,
    Other(String),
}

impl fmt::Display for GpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NvidiaT4 => write!(f, "T4"),
            Self::NvidiaL4 => write!(f, "L4"),
            Self::NvidiaA10G => write!(f, "A10G"),
            Self::NvidiaA100 => write!(f, "A100"),
            Self::NvidiaH100 => write!(f, "H100"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

impl GpuModel {
    /// Parse the vendor-agnostic GPU type string carried on
    /// `tgp.io/gpu-type` selectors. Unrecognized values fall through to
    /// `Other` rather than failing — new hardware shouldn't break matching.
    pub fn from_standard_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "T4" => Self::NvidiaT4,
            "L4" => Self::NvidiaL4,
            "A10G" => Self::NvidiaA10G,
            "A100" => Self::NvidiaA100,
            "H100" => Self::NvidiaH100,
            other => Self::Other(other.to_string()),
        }
    }

    /// Rough VRAM capacity used for the VRAM-band lookup table. Not
    /// authoritative pricing data — just enough to rank "smallest/mid/largest".
    pub fn typical_vram_gib(&self) -> u32 {
        match self {
            Self::NvidiaT4 => 16,
            Self::NvidiaL4 => 24,
            Self::NvidiaA10G => 24,
            Self::NvidiaA100 => 80,
            Self::NvidiaH100 => 80,
            Self::Other(_) => 0,
        }
    }
}

/// Resources an instance type/pod request carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Resources {
    pub cpu: u32,
    /// Memory in MiB, not GiB — avoids the 0.5 GiB rounding problem.
    pub memory_mib: u32,
    pub ephemeral_storage_gib: Option<u32>,
    pub gpu: u32,
    pub gpu_model: Option<GpuModel>,
}

/// Billing increment a provider meters usage in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingGranularity {
    PerSecond,
    PerMinute,
    PerHour,
}

/// Normalized per-provider price for a (gpu-type, region) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPricing {
    pub price_per_hour: f64,
    pub price_per_second: f64,
    pub currency: String,
    pub billing_granularity: BillingGranularity,
    pub last_updated: DateTime<Utc>,
}

impl NormalizedPricing {
    pub fn from_hourly(price_per_hour: f64, granularity: BillingGranularity, now: DateTime<Utc>) -> Self {
        Self {
            price_per_hour,
            price_per_second: price_per_hour / 3600.0,
            currency: "USD".to_string(),
            billing_granularity: granularity,
            last_updated: now,
        }
    }
}

/// A provider's advertised GPU instance offer, as returned by `ListAvailable`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuOffer {
    pub id: String,
    pub provider: String,
    pub gpu_type: GpuModel,
    pub region: Region,
    pub hourly_price: f64,
    pub spot_price: Option<f64>,
    pub memory_mib: u32,
    pub storage_gib: Option<u32>,
    pub available: bool,
    pub is_spot: bool,
}

impl GpuOffer {
    /// Whether this offer satisfies a demand's resource footprint and price
    /// ceiling. Used to filter `ListAvailable` results against a
    /// `LaunchRequest`'s max-price.
    pub fn satisfies(&self, gpu_type: &GpuModel, max_price: Option<f64>) -> bool {
        self.available
            && &self.gpu_type == gpu_type
            && max_price.is_none_or(|max| self.hourly_price <= max)
    }
}

/// Identifies a pod across namespace boundaries for logging/assertions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A GPU resource key the operator recognizes on pending pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuResourceKey {
    Nvidia,
    Amd,
    VendorAgnostic,
}

impl GpuResourceKey {
    const NVIDIA: &'static str = "nvidia.com/gpu";
    const AMD: &'static str = "amd.com/gpu";
    const AGNOSTIC: &'static str = "tgp.io/gpu";

    fn from_key(key: &str) -> Option<Self> {
        match key {
            Self::NVIDIA => Some(Self::Nvidia),
            Self::AMD => Some(Self::Amd),
            Self::AGNOSTIC => Some(Self::VendorAgnostic),
            _ => None,
        }
    }
}

/// Resource demand extracted from a single pending pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodResources {
    pub id: PodId,
    pub resources: Resources,
    /// Present when the pod requested via the vendor-agnostic key and
    /// annotated a minimum VRAM; drives the VRAM-band lookup.
    pub min_vram_gib: Option<u32>,
    /// Present when the pod annotated a vendor preference alongside the
    /// vendor-agnostic GPU key.
    pub vendor_preference: Option<String>,
    pub node_selector: BTreeMap<String, String>,
}

const MIN_VRAM_ANNOTATION: &str = "tgp.io/min-vram-gib";
const VENDOR_PREFERENCE_ANNOTATION: &str = "tgp.io/gpu-vendor";

impl PodResources {
    /// Sum container resource requests on a pod into one `PodResources`.
    /// Callers are expected to have already filtered to GPU-requesting pods
    /// via `has_gpu_request`; this still succeeds for non-GPU pods (with
    /// `resources.gpu == 0`) so it composes with generic pod listing code.
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let metadata = &pod.metadata;
        let id = PodId {
            namespace: metadata.namespace.clone().unwrap_or_default(),
            name: metadata
                .name
                .clone()
                .ok_or_else(|| anyhow!("pod has no name"))?,
        };

        let mut cpu = 0u32;
        let mut memory_mib = 0u32;
        let mut gpu = 0u32;

        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or(&[]);

        for container in containers {
            let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            else {
                continue;
            };
            for (key, quantity) in requests {
                match key.as_str() {
                    "cpu" => cpu += parse_cpu_quantity(&quantity.0),
                    "memory" => memory_mib += parse_memory_mib(&quantity.0),
                    other if GpuResourceKey::from_key(other).is_some() => {
                        gpu += quantity.0.parse::<u32>().unwrap_or(0)
                    }
                    _ => {}
                }
            }
        }

        let annotations = metadata.annotations.clone().unwrap_or_default();
        let min_vram_gib = annotations
            .get(MIN_VRAM_ANNOTATION)
            .and_then(|v| v.parse::<u32>().ok());
        let vendor_preference = annotations.get(VENDOR_PREFERENCE_ANNOTATION).cloned();

        let node_selector = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_selector.clone())
            .unwrap_or_default();

        Ok(Self {
            id,
            resources: Resources {
                cpu,
                memory_mib,
                ephemeral_storage_gib: None,
                gpu,
                gpu_model: None,
            },
            min_vram_gib,
            vendor_preference,
            node_selector,
        })
    }

    /// Whether this demand requested a GPU via any recognized resource key.
    pub fn wants_gpu(&self) -> bool {
        self.resources.gpu > 0
    }
}

/// Whether any container on the pod requests a known GPU resource key.
pub fn has_gpu_request(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[])
        .iter()
        .any(|c| {
            c.resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .is_some_and(|reqs| reqs.keys().any(|k| GpuResourceKey::from_key(k).is_some()))
        })
}

/// Parses a Kubernetes CPU quantity (`"2"`, `"500m"`) into whole cores,
/// rounding fractional cores up so capacity checks stay conservative.
fn parse_cpu_quantity(raw: &str) -> u32 {
    if let Some(milli) = raw.strip_suffix('m') {
        let m: f64 = milli.parse().unwrap_or(0.0);
        (m / 1000.0).ceil() as u32
    } else {
        raw.parse::<f64>().map(|v| v.ceil() as u32).unwrap_or(0)
    }
}

/// Parses a Kubernetes memory quantity into MiB. Supports the binary (Ki/Mi/
/// Gi/Ti) and decimal (k/M/G) suffixes Kubernetes accepts.
fn parse_memory_mib(raw: &str) -> u32 {
    let (number, multiplier_mib) = if let Some(n) = raw.strip_suffix("Ki") {
        (n, 1.0 / 1024.0)
    } else if let Some(n) = raw.strip_suffix("Mi") {
        (n, 1.0)
    } else if let Some(n) = raw.strip_suffix("Gi") {
        (n, 1024.0)
    } else if let Some(n) = raw.strip_suffix("Ti") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = raw.strip_suffix('k') {
        (n, 1000.0 / (1024.0 * 1024.0))
    } else if let Some(n) = raw.strip_suffix('M') {
        (n, 1_000_000.0 / (1024.0 * 1024.0))
    } else if let Some(n) = raw.strip_suffix('G') {
        (n, 1_000_000_000.0 / (1024.0 * 1024.0))
    } else {
        (raw, 1.0 / (1024.0 * 1024.0))
    };
    let value: f64 = number.parse().unwrap_or(0.0);
    (value * multiplier_mib).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn pod_with(requests: Vec<(&str, &str)>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c".into(),
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            requests
                                .into_iter()
                                .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn parses_cpu_and_memory() {
        let pod = pod_with(vec![("cpu", "2"), ("memory", "4096Mi")]);
        let resources = PodResources::from_pod(&pod).unwrap();
        assert_eq!(resources.resources.cpu, 2);
        assert_eq!(resources.resources.memory_mib, 4096);
    }

    #[test]
    fn fractional_cpu_rounds_up() {
        let pod = pod_with(vec![("cpu", "1500m")]);
        let resources = PodResources::from_pod(&pod).unwrap();
        assert_eq!(resources.resources.cpu, 2);
    }

    #[test]
    fn detects_nvidia_gpu_request() {
        let pod = pod_with(vec![("nvidia.com/gpu", "1")]);
        assert!(has_gpu_request(&pod));
        let resources = PodResources::from_pod(&pod).unwrap();
        assert!(resources.wants_gpu());
        assert_eq!(resources.resources.gpu, 1);
    }

    #[test]
    fn detects_vendor_agnostic_gpu_request() {
        let pod = pod_with(vec![("tgp.io/gpu", "1")]);
        assert!(has_gpu_request(&pod));
    }

    #[test]
    fn no_gpu_request_detected_for_plain_pod() {
        let pod = pod_with(vec![("cpu", "1")]);
        assert!(!has_gpu_request(&pod));
    }

    #[test]
    fn gpu_model_roundtrip_through_standard_name() {
        for model in [
            GpuModel::NvidiaT4,
            GpuModel::NvidiaL4,
            GpuModel::NvidiaA10G,
            GpuModel::NvidiaA100,
            GpuModel::NvidiaH100,
        ] {
            let name = model.to_string();
            assert_eq!(GpuModel::from_standard_name(&name), model);
        }
    }

    #[test]
    fn unknown_gpu_model_falls_back_to_other() {
        assert_eq!(
            GpuModel::from_standard_name("RTX4090"),
            GpuModel::Other("RTX4090".to_string())
        );
    }

    #[test]
    fn offer_satisfies_checks_price_ceiling() {
        let offer = GpuOffer {
            id: "o1".into(),
            provider: "vastai".into(),
            gpu_type: GpuModel::NvidiaA100,
            region: Region("us-east-1".into()),
            hourly_price: 2.5,
            spot_price: None,
            memory_mib: 0,
            storage_gib: None,
            available: true,
            is_spot: false,
        };
        assert!(offer.satisfies(&GpuModel::NvidiaA100, Some(3.0)));
        assert!(!offer.satisfies(&GpuModel::NvidiaA100, Some(2.0)));
        assert!(!offer.satisfies(&GpuModel::NvidiaH100, Some(3.0)));
    }
}
