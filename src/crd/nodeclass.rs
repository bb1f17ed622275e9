//! `NodeClass`: the cluster-scoped infrastructure template enumerating
//! providers, credentials, and launch constraints. Reconciled in
//! `controller::nodeclass`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::conditions::Condition;
use crate::offering::GpuModel;

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One entry in `NodeClass.spec.providers`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Must be one of the closed enumeration resolved by
    /// `provider::factory::ProviderName` — validated at reconcile time, not
    /// by the CRD schema.
    pub name: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub credentials_ref: SecretKeyRef,
    #[serde(default)]
    pub regions: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequirements {
    #[serde(default)]
    pub gpu_types: Vec<String>,
    #[serde(default)]
    pub min_gpu_memory_gib: Option<u32>,
    #[serde(default)]
    pub min_memory_gib: Option<u32>,
    #[serde(default)]
    pub min_vcpu: Option<u32>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub spot_allowed: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassLimits {
    pub max_nodes: Option<u32>,
    pub max_hourly_cost: Option<f64>,
}

/// Node-init templating configuration. Named after
/// the immutable-OS bootstrap format this operator targets; the template
/// itself is opaque to the operator beyond the fixed-variable substitution
/// described in `template::render`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TalosConfig {
    pub image: Option<String>,
    pub kubelet_image: Option<String>,
    pub machine_config_template: Option<String>,
    pub machine_config_secret_ref: Option<SecretKeyRef>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "tgp.io", version = "v1", kind = "NodeClass")]
#[kube(status = "NodeClassStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodeClassSpec {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub instance_requirements: InstanceRequirements,
    #[serde(default)]
    pub limits: NodeClassLimits,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub talos_config: TalosConfig,
}

impl NodeClassSpec {
    /// Invariant: at least one enabled provider.
    pub fn has_enabled_provider(&self) -> bool {
        self.providers.iter().any(|p| p.enabled)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Whether `gpu_type` is compatible with this class's requirements. An
    /// empty `gpuTypes` list means "no restriction".
    pub fn allows_gpu_type(&self, gpu_type: &GpuModel) -> bool {
        self.instance_requirements.gpu_types.is_empty()
            || self
                .instance_requirements
                .gpu_types
                .iter()
                .any(|g| GpuModel::from_standard_name(g) == *gpu_type)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInventoryStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderInventoryStatus>,
    #[serde(default)]
    pub available_gpus: BTreeMap<String, Vec<String>>,
    pub last_inventory_update: Option<DateTime<Utc>>,
    pub next_inventory_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_nodes: u32,
    #[serde(default)]
    pub total_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn provider(name: &str, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            priority: 0,
            enabled,
            credentials_ref: SecretKeyRef {
                name: "creds".into(),
                key: name.to_string(),
                namespace: None,
            },
            regions: vec![],
        }
    }

    #[test]
    fn crd_generates_expected_names() {
        let crd = NodeClass::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("nodeclasses.tgp.io"));
        assert_eq!(crd.spec.group, "tgp.io");
        assert_eq!(crd.spec.names.kind, "NodeClass");
        assert!(crd.spec.scope == "Cluster" || crd.spec.scope.is_empty());
    }

    #[test]
    fn has_enabled_provider_requires_at_least_one() {
        let spec = NodeClassSpec {
            providers: vec![provider("vastai", false), provider("runpod", true)],
            instance_requirements: InstanceRequirements::default(),
            limits: NodeClassLimits::default(),
            tags: BTreeMap::new(),
            talos_config: TalosConfig::default(),
        };
        assert!(spec.has_enabled_provider());
        assert_eq!(spec.enabled_providers().count(), 1);
    }

    #[test]
    fn no_enabled_providers_fails_invariant() {
        let spec = NodeClassSpec {
            providers: vec![provider("vastai", false)],
            instance_requirements: InstanceRequirements::default(),
            limits: NodeClassLimits::default(),
            tags: BTreeMap::new(),
            talos_config: TalosConfig::default(),
        };
        assert!(!spec.has_enabled_provider());
    }

    #[test]
    fn empty_gpu_types_allows_anything() {
        let spec = NodeClassSpec {
            providers: vec![provider("vastai", true)],
            instance_requirements: InstanceRequirements::default(),
            limits: NodeClassLimits::default(),
            tags: BTreeMap::new(),
            talos_config: TalosConfig::default(),
        };
        assert!(spec.allows_gpu_type(&GpuModel::NvidiaH100));
    }

    #[test]
    fn restricted_gpu_types_filters_unlisted() {
        let spec = NodeClassSpec {
            providers: vec![provider("vastai", true)],
            instance_requirements: InstanceRequirements {
                gpu_types: vec!["A100".to_string()],
                ..Default::default()
            },
            limits: NodeClassLimits::default(),
            tags: BTreeMap::new(),
            talos_config: TalosConfig::default(),
        };
        assert!(spec.allows_gpu_type(&GpuModel::NvidiaA100));
        assert!(!spec.allows_gpu_type(&GpuModel::NvidiaH100));
    }
}
