//! Pool engine integration tests against a real Kubernetes cluster.
//!
//! These tests exercise allocation under contention, backfill, statistics,
//! and leader election end to end. They are ignored by default since they
//! need a reachable cluster (kubeconfig or in-cluster), permission to
//! create pods and leases in the test namespace, and a RuntimeClass named
//! by SANDPOOL_TEST_RUNTIME_CLASS (default: kata).
//!
//! Run with: cargo test --test engine_integration_test -- --ignored

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use tokio_util::sync::CancellationToken;

use sandpool::config::PoolConfig;
use sandpool::error::Error;
use sandpool::labels::{self, ContainerType, PoolStatus};
use sandpool::leader::{LeaderElector, LeadershipHooks};
use sandpool::pool::PoolEngine;

fn runtime_class() -> String {
    std::env::var("SANDPOOL_TEST_RUNTIME_CLASS").unwrap_or_else(|_| "kata".to_string())
}

fn test_config(namespace: &str) -> Arc<PoolConfig> {
    let toml = format!(
        r#"
        namespace = "{namespace}"
        runtime_class = "{rc}"
        max_total_workloads = 10
        backfill_interval_secs = 2
        monitor_interval_secs = 5
        pod_ready_timeout_secs = 120

        [sandbox]
        target = 2
        prefix = "itest-sandbox"
        image = "busybox:1.36"

        [lease]
        name = "itest-backfill"
        duration_secs = 6
        "#,
        namespace = namespace,
        rc = runtime_class(),
    );
    Arc::new(PoolConfig::parse(&toml).expect("test config must parse"))
}

/// Build a client, or None when no cluster is reachable.
async fn try_client(config: &PoolConfig) -> Option<kube::Client> {
    match config.connect().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping test: no cluster available ({e})");
            None
        }
    }
}

fn unique_namespace() -> String {
    format!(
        "sandpool-itest-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

async fn ensure_namespace(client: &kube::Client, namespace: &str) {
    let ns_api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());
    let _ = ns_api
        .create(
            &PostParams::default(),
            &k8s_openapi::api::core::v1::Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await;
}

async fn delete_namespace(client: &kube::Client, namespace: &str) {
    let ns_api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());
    let _ = ns_api.delete(namespace, &DeleteParams::default()).await;
}

/// Create a pod carrying warm-pool labels directly, bypassing readiness.
/// Allocation only looks at labels, so this is enough to contend over.
async fn seed_warm_pod(client: &kube::Client, namespace: &str, name: &str) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut pod_labels = labels::pool_labels(ContainerType::Sandbox, PoolStatus::Warm, "itest");
    pod_labels.insert("sandpool.io/itest".to_string(), "true".to_string());

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(pod_labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "workload".to_string(),
                image: Some("busybox:1.36".to_string()),
                command: Some(vec!["sleep".to_string(), "600".to_string()]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            runtime_class_name: Some(runtime_class()),
            ..Default::default()
        }),
        ..Default::default()
    };
    pods.create(&PostParams::default(), &pod)
        .await
        .expect("failed to seed warm pod");
}

// === Allocation ===

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires a cluster
async fn test_allocate_contention_single_winner() {
    let namespace = unique_namespace();
    let config = test_config(&namespace);
    let Some(client) = try_client(&config).await else {
        return;
    };
    ensure_namespace(&client, &namespace).await;

    seed_warm_pod(&client, &namespace, "itest-sandbox-warm-contended").await;
    let engine = PoolEngine::new(client.clone(), config);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .allocate(ContainerType::Sandbox, &format!("user-{i}"))
                .await
        }));
    }

    let mut winners = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(workload) => {
                winners += 1;
                assert_eq!(workload.pool_status, PoolStatus::Allocated);
                assert!(workload.allocated_to.is_some());
                assert!(workload.allocated_at.is_some());
            }
            Err(Error::NoWarmAvailable) => exhausted += 1,
            Err(e) => panic!("unexpected allocate error: {e}"),
        }
    }
    assert_eq!(winners, 1, "exactly one allocation must win");
    assert_eq!(exhausted, 7);

    delete_namespace(&client, &namespace).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires a cluster
async fn test_allocate_empty_pool_is_capacity_signal() {
    let namespace = unique_namespace();
    let config = test_config(&namespace);
    let Some(client) = try_client(&config).await else {
        return;
    };
    ensure_namespace(&client, &namespace).await;

    let engine = PoolEngine::new(client.clone(), config);
    let result = engine.allocate(ContainerType::Sandbox, "user-1").await;
    assert!(matches!(result, Err(Error::NoWarmAvailable)));

    delete_namespace(&client, &namespace).await;
}

// === Statistics ===

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires a cluster
async fn test_statistics_reflect_seeded_pods() {
    let namespace = unique_namespace();
    let config = test_config(&namespace);
    let Some(client) = try_client(&config).await else {
        return;
    };
    ensure_namespace(&client, &namespace).await;

    seed_warm_pod(&client, &namespace, "itest-sandbox-warm-stat-a").await;
    seed_warm_pod(&client, &namespace, "itest-sandbox-warm-stat-b").await;

    let engine = PoolEngine::new(client.clone(), config);
    let stats = engine.statistics(ContainerType::Sandbox).await;
    assert_eq!(stats.warm, 2);
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.target, 2);
    assert_eq!(stats.ready_pct, 100.0);

    delete_namespace(&client, &namespace).await;
}

// === Backfill ===

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires a cluster with the VM RuntimeClass installed
async fn test_backfill_creates_up_to_target() {
    let namespace = unique_namespace();
    let config = test_config(&namespace);
    let Some(client) = try_client(&config).await else {
        return;
    };
    ensure_namespace(&client, &namespace).await;

    let engine = PoolEngine::new(client.clone(), config);
    let token = CancellationToken::new();
    let backfill = tokio::spawn(sandpool::reconcile::run_backfill(
        engine.clone(),
        token.child_token(),
    ));

    // Two short backfill periods are enough to issue the creates.
    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    let _ = backfill.await;

    let (creating, warm) = (
        engine.count(ContainerType::Sandbox, PoolStatus::Creating).await,
        engine.count(ContainerType::Sandbox, PoolStatus::Warm).await,
    );
    assert_eq!(creating + warm, 2, "pipeline must reach the target");

    delete_namespace(&client, &namespace).await;
}

// === Leader election ===

struct CountingHooks {
    acquired: AtomicUsize,
}

impl LeadershipHooks for CountingHooks {
    fn on_acquired(&self, _token: CancellationToken) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }
    fn on_lost(&self) {}
    fn on_new_leader(&self, _holder: &str) {}
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires a cluster
async fn test_lease_has_single_holder() {
    let namespace = unique_namespace();
    let config = test_config(&namespace);
    let Some(client) = try_client(&config).await else {
        return;
    };
    ensure_namespace(&client, &namespace).await;

    let hooks_a = Arc::new(CountingHooks {
        acquired: AtomicUsize::new(0),
    });
    let hooks_b = Arc::new(CountingHooks {
        acquired: AtomicUsize::new(0),
    });

    let token = CancellationToken::new();
    let elector_a = LeaderElector::new(client.clone(), config.clone());
    let elector_b = LeaderElector::new(client.clone(), config.clone());

    let task_a = {
        let hooks = hooks_a.clone();
        let token = token.child_token();
        tokio::spawn(async move { elector_a.run(hooks.as_ref(), token).await })
    };
    let task_b = {
        let hooks = hooks_b.clone();
        let token = token.child_token();
        tokio::spawn(async move { elector_b.run(hooks.as_ref(), token).await })
    };

    // Give both replicas a few retry periods to settle.
    tokio::time::sleep(Duration::from_secs(8)).await;
    token.cancel();
    let _ = tokio::join!(task_a, task_b);

    let total = hooks_a.acquired.load(Ordering::SeqCst) + hooks_b.acquired.load(Ordering::SeqCst);
    assert_eq!(total, 1, "exactly one replica may hold the lease");

    delete_namespace(&client, &namespace).await;
}
