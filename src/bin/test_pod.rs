//! Manual test harness for exercising a live NodePool: creates or deletes a
//! GPU-requesting pending pod so a reconciler has something to provision
//! against.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let client = Client::try_default().await?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("create") => {
            let name = args.next().unwrap_or_else(|| "tgp-test-pod".to_string());
            let cpu = args.next().unwrap_or_else(|| "1".to_string());
            let memory = args.next().unwrap_or_else(|| "2Gi".to_string());
            let gpu: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(1);
            create_test_pod(client, &name, &cpu, &memory, gpu).await?;
        }
        Some("delete") => {
            let name = args.next().unwrap_or_else(|| "tgp-test-pod".to_string());
            delete_test_pod(client, &name).await?;
        }
        _ => bail!("usage: test_pod <create|delete> [name] [cpu] [memory] [gpu-count]"),
    }

    Ok(())
}

async fn create_test_pod(client: Client, name: &str, cpu: &str, memory: &str, gpu: u32) -> Result<()> {
    let pods: Api<Pod> = Api::default_namespaced(client);

    let requests = BTreeMap::from([
        ("cpu".into(), Quantity(cpu.into())),
        ("memory".into(), Quantity(memory.into())),
        ("nvidia.com/gpu".into(), Quantity(gpu.to_string())),
    ]);

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".into(),
                "tgp-operator-test".into(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                command: Some(vec!["sleep".into(), "infinity".into()]),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };

    pods.create(&PostParams::default(), &pod).await?;
    info!(pod = name, cpu, memory, gpu, "created test pod");
    Ok(())
}

async fn delete_test_pod(client: Client, name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::default_namespaced(client);
    pods.delete(name, &DeleteParams::default()).await?;
    info!(pod = name, "deleted test pod");
    Ok(())
}
