use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use tgp_operator::crd::nodeclass::{
    InstanceRequirements, NodeClassLimits, NodeClassSpec, ProviderConfig, SecretKeyRef, TalosConfig,
};
use tgp_operator::crd::nodepool::{NodeClassRef, NodePoolSpec, NodeTemplate};
use tgp_operator::crd::{NodeClass, NodePool};

pub fn gpu_pending_pod(name: &str, gpu: u32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".into(), Quantity("1".into())),
                        ("memory".into(), Quantity("2Gi".into())),
                        ("nvidia.com/gpu".into(), Quantity(gpu.to_string())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn scheduled_pod(name: &str, node_name: &str) -> Pod {
    let mut pod = gpu_pending_pod(name, 1);
    if let Some(spec) = pod.spec.as_mut() {
        spec.node_name = Some(node_name.into());
    }
    pod
}

pub fn provider_config(name: &str, priority: u32, enabled: bool) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        priority,
        enabled,
        credentials_ref: SecretKeyRef {
            name: format!("{name}-creds"),
            key: "apiKey".to_string(),
            namespace: None,
        },
        regions: vec![],
    }
}

pub fn nodeclass(name: &str, providers: Vec<ProviderConfig>) -> NodeClass {
    NodeClass::new(
        name,
        NodeClassSpec {
            providers,
            instance_requirements: InstanceRequirements::default(),
            limits: NodeClassLimits::default(),
            tags: BTreeMap::new(),
            talos_config: TalosConfig {
                machine_config_template: Some(
                    "version: v1alpha1\nmachine:\n  network:\n    hostname: ${NODE_NAME}\n  token: ${BOOTSTRAP_TOKEN}\ncluster:\n  clusterName: ${CLUSTER_NAME}\n  controlPlane:\n    endpoint: ${CLUSTER_ENDPOINT}\n"
                        .to_string(),
                ),
                ..Default::default()
            },
        },
    )
}

pub fn nodepool(name: &str, class_name: &str, max_hourly_price: f64) -> NodePool {
    NodePool::new(
        name,
        NodePoolSpec {
            node_class_ref: NodeClassRef {
                kind: "NodeClass".into(),
                name: class_name.to_string(),
                group: "tgp.io".into(),
            },
            template: NodeTemplate::default(),
            max_hourly_price,
            weight: 0,
            disruption: Default::default(),
            limits: Default::default(),
        },
    )
}
