mod common;

use std::time::Duration;

use tgp_operator::offering::{has_gpu_request, GpuModel, PodResources, Region};
use tgp_operator::pricing::PricingCache;
use tgp_operator::provider::fake::{FakeProvider, LaunchBehavior};
use tgp_operator::provider::{LaunchRequest, OfferFilters, Provider};
use tgp_operator::selector::{select_best, Candidate};
use tgp_operator::template::{render, TemplateVariables};

use common::{gpu_pending_pod, nodeclass, nodepool, provider_config, scheduled_pod};

fn gpu() -> GpuModel {
    GpuModel::NvidiaA100
}

fn region() -> Region {
    Region("us-east-1".into())
}

#[test]
fn nodeclass_and_nodepool_builders_roundtrip() {
    let class = nodeclass("gpu-fleet", vec![provider_config("vastai", 0, true)]);
    assert!(class.spec.has_enabled_provider());
    let pool = nodepool("gpu-pool", "gpu-fleet", 5.0);
    assert_eq!(pool.spec.node_class_ref.name, "gpu-fleet");
}

#[tokio::test]
async fn two_provider_price_selection_prefers_cheaper_effective_price() {
    let vast = Provider::Fake(FakeProvider::new("vastai").with_price(&gpu(), &region(), 3.50));
    let runpod = Provider::Fake(FakeProvider::new("runpod").with_price(&gpu(), &region(), 3.20));
    let cache = PricingCache::new(Duration::from_secs(60));

    let candidates = vec![
        Candidate { provider: &vast, priority: 0 },
        Candidate { provider: &runpod, priority: 0 },
    ];

    let winner = select_best(&cache, &candidates, &gpu(), &region()).await.unwrap();
    assert_eq!(winner.provider.name(), "runpod");
    assert!((winner.effective_price - 3.20).abs() < f64::EPSILON);
}

#[tokio::test]
async fn priority_weighting_can_favor_a_pricier_provider() {
    let preferred = Provider::Fake(FakeProvider::new("preferred").with_price(&gpu(), &region(), 3.50));
    let cheapest = Provider::Fake(FakeProvider::new("cheapest").with_price(&gpu(), &region(), 3.20));
    let cache = PricingCache::new(Duration::from_secs(60));

    // Weighting "cheapest" down by priority 2 (3.20 * 1.2 = 3.84) lets the
    // unweighted preferred provider (3.50) win instead.
    let candidates = vec![
        Candidate { provider: &preferred, priority: 0 },
        Candidate { provider: &cheapest, priority: 2 },
    ];

    let winner = select_best(&cache, &candidates, &gpu(), &region()).await.unwrap();
    assert_eq!(winner.provider.name(), "preferred");
}

#[tokio::test]
async fn rate_limited_provider_is_dropped_from_selection_not_retried_forever() {
    let flaky = FakeProvider::new("flaky").on_next_launch(LaunchBehavior::RateLimited);
    let flaky = Provider::Fake(flaky);
    // No price configured on the flaky provider, so pricing lookup fails and
    // it's excluded from ranking entirely — selection degrades to whatever
    // else is available rather than blocking on one bad backend.
    let healthy = Provider::Fake(FakeProvider::new("healthy").with_price(&gpu(), &region(), 2.75));
    let cache = PricingCache::new(Duration::from_secs(60));

    let candidates = vec![
        Candidate { provider: &flaky, priority: 0 },
        Candidate { provider: &healthy, priority: 0 },
    ];

    let winner = select_best(&cache, &candidates, &gpu(), &region()).await.unwrap();
    assert_eq!(winner.provider.name(), "healthy");
}

#[test]
fn pending_gpu_pod_is_eligible_unscheduled_and_gpu_requesting() {
    let pod = gpu_pending_pod("wants-gpu", 1);
    assert!(has_gpu_request(&pod));
    assert!(pod.spec.as_ref().unwrap().node_name.is_none());

    let demand = PodResources::from_pod(&pod).unwrap();
    assert!(demand.wants_gpu());
}

#[test]
fn already_scheduled_pod_is_not_a_provisioning_candidate() {
    let pod = scheduled_pod("already-placed", "existing-node");
    assert!(pod.spec.as_ref().unwrap().node_name.is_some());
}

#[tokio::test]
async fn rendered_node_init_payload_carries_through_to_launch_request() {
    let template = "version: v1alpha1\nmachine:\n  network:\n    hostname: ${NODE_NAME}\n  token: ${BOOTSTRAP_TOKEN}\ncluster:\n  clusterName: ${CLUSTER_NAME}\n  controlPlane:\n    endpoint: ${CLUSTER_ENDPOINT}\n";
    let variables = TemplateVariables {
        cluster_name: "prod-cluster".into(),
        cluster_endpoint: "https://prod.example.internal:6443".into(),
        node_name: "gpu-fleet-abc123".into(),
        bootstrap_token: "s3cr3t".into(),
        extra: Default::default(),
    };
    let payload = render(template, &variables).unwrap();
    assert!(payload.contains("gpu-fleet-abc123"));
    assert!(payload.contains("prod-cluster"));

    let provider = Provider::Fake(FakeProvider::new("fake").with_price(&gpu(), &region(), 1.0));
    let request = LaunchRequest {
        gpu_type: gpu(),
        region: region(),
        node_init_payload: payload.clone(),
        labels: Default::default(),
        spot_preference: false,
        max_price: None,
    };
    let instance = provider.launch(&request).await.unwrap();
    assert!(!instance.id.0.is_empty());

    let calls = match &provider {
        Provider::Fake(f) => f.launch_calls(),
        _ => unreachable!(),
    };
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request_gpu_type, gpu());
    assert_eq!(calls[0].result_instance_id, Some(instance.id));
}

#[tokio::test]
async fn list_available_filters_across_providers_by_gpu_type() {
    let a = FakeProvider::new("a").with_offerings(vec![]);
    let provider = Provider::Fake(a);
    let offers = provider
        .list_available(&OfferFilters {
            gpu_type: Some(gpu()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(offers.is_empty());
}
