//! Pool engine: warm workload creation, atomic allocation, counts.
//!
//! The engine is stateless; every operation lists or mutates pods through
//! the orchestrator. Allocation is lock-free: a replace carrying the
//! candidate's resource version either wins the race or conflicts, and the
//! loser re-lists a fresh candidate.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, KeyToPath, Pod, PodSpec, Probe,
    ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result, is_conflict, is_not_found, is_transient};
use crate::labels::{
    self, ANNOTATION_ALLOCATED_AT, ANNOTATION_CREATED_AT, ANNOTATION_LAST_ACTIVITY,
    ContainerType, LABEL_ALLOCATED_TO, LABEL_POOL_STATUS, PoolStatus,
};
use crate::workload::{PoolStats, Workload, pod_is_ready, waiting_reason};

/// Allocation gives up after this many list+replace rounds.
const ALLOCATE_MAX_ATTEMPTS: u32 = 5;
/// Backoff base when the warm pool is empty (multiplied by attempt index).
const EMPTY_BACKOFF_MS: u64 = 100;
/// Backoff base after losing an optimistic-concurrency race.
const CONFLICT_BACKOFF_MS: u64 = 50;
/// Readiness poll cadence for watchers and on-demand creation.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Mount paths wired into the auth-proxy sidecar contract.
const CA_PUBLIC_MOUNT: &str = "/etc/sandpool/ca";
const CA_FULL_MOUNT: &str = "/etc/sandpool/proxy-ca";

/// Stateless engine over the orchestrator; cheap to clone.
#[derive(Clone)]
pub struct PoolEngine {
    client: Client,
    pods: Api<Pod>,
    config: Arc<PoolConfig>,
    manager_id: String,
}

impl PoolEngine {
    pub fn new(client: Client, config: Arc<PoolConfig>) -> Self {
        let pods = Api::namespaced(client.clone(), &config.namespace);
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "sandpool".to_string());
        let manager_id = format!("{}-{}", host, short_id());
        Self {
            client,
            pods,
            config,
            manager_id,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn pods(&self) -> &Api<Pod> {
        &self.pods
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Replica identity stamped onto workloads this process creates.
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    // ===== Counts & statistics =====

    /// Count workloads by type and pool status. Orchestrator errors are
    /// logged and counted as zero so statistics never fail outright.
    pub async fn count(&self, container_type: ContainerType, status: PoolStatus) -> usize {
        let lp = ListParams::default().labels(&labels::selector(Some(container_type), Some(status)));
        match self.pods.list(&lp).await {
            Ok(list) => list.items.len(),
            Err(e) => {
                warn!(%container_type, %status, error = %e, "count failed, defaulting to zero");
                0
            }
        }
    }

    /// Count all workloads on the configured VM runtime class, regardless of
    /// type or status. This is the number the global cap is enforced against.
    pub async fn total_workloads(&self) -> usize {
        match self.pods.list(&ListParams::default()).await {
            Ok(list) => list
                .items
                .iter()
                .filter(|p| self.on_vm_runtime(p))
                .count(),
            Err(e) => {
                warn!(error = %e, "total count failed, defaulting to zero");
                0
            }
        }
    }

    /// Derived statistics for one pool, counts issued in parallel.
    pub async fn statistics(&self, container_type: ContainerType) -> PoolStats {
        let (creating, warm, allocated, manual, total) = tokio::join!(
            self.count(container_type, PoolStatus::Creating),
            self.count(container_type, PoolStatus::Warm),
            self.count(container_type, PoolStatus::Allocated),
            self.count(container_type, PoolStatus::Manual),
            self.total_workloads(),
        );
        PoolStats::derive(
            creating,
            warm,
            allocated,
            manual,
            total,
            self.config.type_config(container_type).target,
            self.config.max_total_workloads,
        )
    }

    // ===== Allocation =====

    /// Atomically allocate a warm workload to a user.
    ///
    /// Takes the first listed warm candidate and submits a replace carrying
    /// its resource version. A conflict means another replica won the race;
    /// back off briefly and re-list. An empty warm pool is a capacity
    /// condition ([`Error::NoWarmAvailable`]), not a failure.
    pub async fn allocate(
        &self,
        container_type: ContainerType,
        user_id: &str,
    ) -> Result<Workload> {
        if user_id.trim().is_empty() {
            return Err(Error::Validation("user_id must not be empty".to_string()));
        }

        for attempt in 1..=ALLOCATE_MAX_ATTEMPTS {
            let lp = ListParams::default()
                .labels(&labels::selector(Some(container_type), Some(PoolStatus::Warm)));
            let warm = match self.pods.list(&lp).await {
                Ok(list) => list,
                Err(e) if is_transient(&e) => {
                    warn!(attempt, error = %e, "transient list error during allocate");
                    sleep(Duration::from_millis(EMPTY_BACKOFF_MS * attempt as u64)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let Some(mut pod) = warm.items.into_iter().next() else {
                if attempt == ALLOCATE_MAX_ATTEMPTS {
                    break;
                }
                sleep(Duration::from_millis(EMPTY_BACKOFF_MS * attempt as u64)).await;
                continue;
            };

            let name = pod
                .metadata
                .name
                .clone()
                .ok_or_else(|| Error::Validation("warm workload has no name".to_string()))?;

            let now = labels::ts_now_string();
            let pod_labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
            pod_labels.insert(LABEL_POOL_STATUS.to_string(), PoolStatus::Allocated.to_string());
            pod_labels.insert(LABEL_ALLOCATED_TO.to_string(), user_id.to_string());
            let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(ANNOTATION_ALLOCATED_AT.to_string(), now.clone());
            annotations.insert(ANNOTATION_LAST_ACTIVITY.to_string(), now);

            match self.pods.replace(&name, &PostParams::default(), &pod).await {
                Ok(updated) => {
                    info!(workload = %name, user = %user_id, attempt, "allocated warm workload");
                    return Ok(Workload::decode(&updated));
                }
                Err(e) if is_conflict(&e) => {
                    debug!(workload = %name, attempt, "lost allocation race, re-listing");
                    sleep(Duration::from_millis(CONFLICT_BACKOFF_MS * attempt as u64)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%container_type, user = %user_id, "no warm workload available");
        Err(Error::NoWarmAvailable)
    }

    // ===== Warm creation =====

    /// Create one warm workload and spawn its readiness watcher.
    ///
    /// A name collision is logged and dropped without retry; the next
    /// backfill tick regenerates with a fresh suffix.
    pub async fn create_warm(
        &self,
        container_type: ContainerType,
        token: CancellationToken,
    ) -> Result<()> {
        let prefix = &self.config.type_config(container_type).prefix;
        let name = format!("{}-warm-{}", prefix, short_id());
        let pod = self.build_workload_pod(container_type, &name, PoolStatus::Creating, None);

        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(workload = %name, %container_type, "created warm workload");
                self.spawn_readiness_watcher(name, token);
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                warn!(workload = %name, "name collision on warm create, leaving to next backfill");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a workload via the on-demand path (`pool-status=manual`).
    /// Returns the generated name; readiness is the caller's concern.
    pub async fn create_manual(
        &self,
        container_type: ContainerType,
        image: Option<&str>,
    ) -> Result<String> {
        let prefix = &self.config.type_config(container_type).prefix;
        let name = format!("{}-{}", prefix, short_id());
        let pod = self.build_workload_pod(container_type, &name, PoolStatus::Manual, image);
        self.pods.create(&PostParams::default(), &pod).await?;
        info!(workload = %name, %container_type, "created on-demand workload");
        Ok(name)
    }

    /// Build the pod spec for a workload of the given type.
    ///
    /// stdin/tty keep the container from exiting immediately; the VM runtime
    /// class puts the pod behind hardware isolation.
    fn build_workload_pod(
        &self,
        container_type: ContainerType,
        name: &str,
        status: PoolStatus,
        image_override: Option<&str>,
    ) -> Pod {
        let type_cfg = self.config.type_config(container_type);
        let pod_labels = labels::pool_labels(container_type, status, &self.manager_id);

        let now = labels::ts_now_string();
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_CREATED_AT.to_string(), now.clone());
        annotations.insert(ANNOTATION_LAST_ACTIVITY.to_string(), now);

        let mut limits = BTreeMap::new();
        limits.insert("memory".to_string(), Quantity(format!("{}Mi", type_cfg.memory_mb)));
        limits.insert("cpu".to_string(), Quantity(format!("{}m", type_cfg.cpu_millis)));
        let mut requests = BTreeMap::new();
        requests.insert(
            "memory".to_string(),
            Quantity(format!("{}Mi", type_cfg.memory_request())),
        );
        requests.insert("cpu".to_string(), Quantity(format!("{}m", type_cfg.cpu_request())));

        let mut workload = Container {
            name: "workload".to_string(),
            image: Some(
                image_override
                    .map(String::from)
                    .unwrap_or_else(|| type_cfg.image.clone()),
            ),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                requests: Some(requests),
                ..Default::default()
            }),
            stdin: Some(true),
            tty: Some(true),
            ..Default::default()
        };

        let mut containers = vec![];
        let mut volumes = None;

        let proxy = &self.config.auth_proxy;
        if proxy.enabled && container_type == ContainerType::Sandbox {
            let (proxy_container, pod_volumes) = self.build_auth_proxy_sidecar();

            workload.env = Some(vec![
                env("HTTP_PROXY", &format!("http://127.0.0.1:{}", proxy.port)),
                env("HTTPS_PROXY", &format!("http://127.0.0.1:{}", proxy.port)),
                env("NO_PROXY", &proxy.no_proxy),
                env("NODE_EXTRA_CA_CERTS", &format!("{}/ca.crt", CA_PUBLIC_MOUNT)),
            ]);
            workload.volume_mounts = Some(vec![VolumeMount {
                name: "ca-public".to_string(),
                mount_path: CA_PUBLIC_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]);

            containers.push(proxy_container);
            volumes = Some(pod_volumes);
        }

        containers.insert(0, workload);

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(pod_labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                volumes,
                restart_policy: Some("Never".to_string()),
                automount_service_account_token: Some(false),
                runtime_class_name: Some(self.config.runtime_class.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Auth-proxy sidecar plus the CA volumes it shares with the workload.
    /// The workload sees the public cert only; the proxy also gets the key.
    fn build_auth_proxy_sidecar(&self) -> (Container, Vec<Volume>) {
        let proxy = &self.config.auth_proxy;

        let container = Container {
            name: "auth-proxy".to_string(),
            image: Some(proxy.image.clone()),
            env: Some(vec![
                env("PROXY_PORT", &proxy.port.to_string()),
                env("PROXY_HEALTH_PORT", &proxy.health_port.to_string()),
                env("PROXY_CA_CERT_PATH", &format!("{}/ca.crt", CA_FULL_MOUNT)),
                env("PROXY_CA_KEY_PATH", &format!("{}/ca.key", CA_FULL_MOUNT)),
                env("NO_PROXY", &proxy.no_proxy),
            ]),
            ports: Some(vec![ContainerPort {
                container_port: proxy.health_port as i32,
                name: Some("health".to_string()),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/healthz".to_string()),
                    port: IntOrString::Int(proxy.health_port as i32),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(1),
                period_seconds: Some(5),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: "ca-full".to_string(),
                mount_path: CA_FULL_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let volumes = vec![
            Volume {
                name: "ca-public".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(proxy.ca_secret.clone()),
                    items: Some(vec![key_to_path("ca.crt")]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "ca-full".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(proxy.ca_secret.clone()),
                    items: Some(vec![key_to_path("ca.crt"), key_to_path("ca.key")]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        (container, volumes)
    }

    // ===== Readiness =====

    /// Watch a freshly created workload until it is ready, then relabel
    /// creating -> warm. Exits on failure or timeout; the monitor and
    /// backfill loops handle replacement.
    pub fn spawn_readiness_watcher(&self, name: String, token: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.watch_until_ready(&name, token).await;
        });
    }

    async fn watch_until_ready(&self, name: &str, token: CancellationToken) {
        let deadline = Instant::now() + self.config.pod_ready_timeout();
        let mut last_state: Option<String> = None;

        loop {
            if token.is_cancelled() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(workload = %name, "workload did not become ready before timeout");
                return;
            }

            let pod = match self.pods.get_opt(name).await {
                Ok(Some(pod)) => pod,
                Ok(None) => {
                    debug!(workload = %name, "workload deleted while waiting for readiness");
                    return;
                }
                Err(e) => {
                    warn!(workload = %name, error = %e, "readiness poll failed");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = sleep(READY_POLL_INTERVAL) => continue,
                    }
                }
            };

            let state = describe_pod_state(&pod);
            if last_state.as_deref() != Some(state.as_str()) {
                info!(workload = %name, state = %state, "workload state changed");
                last_state = Some(state);
            }

            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            if matches!(phase, Some("Failed") | Some("Succeeded")) {
                warn!(workload = %name, phase = phase.unwrap_or(""), "workload terminated before ready");
                return;
            }

            if pod_is_ready(&pod) {
                self.mark_warm(name, pod).await;
                return;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    /// Flip `pool-status` creating -> warm on the pod we just observed.
    /// A conflict means someone else already moved it on; that is fine.
    async fn mark_warm(&self, name: &str, mut pod: Pod) {
        let pod_labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
        pod_labels.insert(LABEL_POOL_STATUS.to_string(), PoolStatus::Warm.to_string());

        match self.pods.replace(name, &PostParams::default(), &pod).await {
            Ok(_) => info!(workload = %name, "workload is warm"),
            Err(e) if is_conflict(&e) => {
                debug!(workload = %name, "warm-mark conflicted, deferring to next reconcile");
            }
            Err(e) => warn!(workload = %name, error = %e, "failed to mark workload warm"),
        }
    }

    // ===== Lookup & deletion =====

    /// Fetch one workload; None when it does not exist.
    pub async fn get(&self, name: &str) -> Result<Option<Workload>> {
        match self.pods.get_opt(name).await {
            Ok(pod) => Ok(pod.as_ref().map(Workload::decode)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List workloads, optionally narrowed to a type. Pods outside the VM
    /// runtime class are invisible.
    pub async fn list(&self, container_type: Option<ContainerType>) -> Result<Vec<Workload>> {
        let lp = match container_type {
            Some(ty) => ListParams::default().labels(&labels::selector(Some(ty), None)),
            None => ListParams::default(),
        };
        let pods = self.pods.list(&lp).await?;
        Ok(pods
            .items
            .iter()
            .filter(|p| self.on_vm_runtime(p))
            .map(Workload::decode)
            .collect())
    }

    /// Raw pod list for the reconcile loops (runtime-class filtered).
    pub async fn list_pods(&self, selector: Option<&str>) -> Result<Vec<Pod>> {
        let lp = match selector {
            Some(sel) => ListParams::default().labels(sel),
            None => ListParams::default(),
        };
        let pods = self.pods.list(&lp).await?;
        Ok(pods
            .items
            .into_iter()
            .filter(|p| self.on_vm_runtime(p))
            .collect())
    }

    /// Delete a workload immediately. "Not found" is swallowed: the
    /// workload's lifetime already ended elsewhere.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self
            .pods
            .delete(name, &DeleteParams::default().grace_period(0))
            .await
        {
            Ok(_) => {
                info!(workload = %name, "deleted workload");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Privileged: delete every workload of a type. Returns how many
    /// deletes were issued.
    pub async fn delete_all(&self, container_type: ContainerType) -> Result<usize> {
        let lp = ListParams::default().labels(&labels::selector(Some(container_type), None));
        let pods = self.pods.list(&lp).await?;
        let mut deleted = 0;
        for pod in pods.items.iter().filter(|p| self.on_vm_runtime(p)) {
            if let Some(name) = pod.metadata.name.as_deref() {
                self.delete(name).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // ===== Annotations & addresses =====

    /// Merge annotations onto a workload without a full replace.
    pub async fn annotate(&self, name: &str, entries: &[(&str, String)]) -> Result<()> {
        let mut map = serde_json::Map::new();
        for (key, value) in entries {
            map.insert((*key).to_string(), serde_json::Value::String(value.clone()));
        }
        let patch = json!({ "metadata": { "annotations": map } });
        self.pods
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Bump `last-activity` to now. Failures are logged, never surfaced:
    /// activity tracking must not break the data path.
    pub async fn touch_activity(&self, name: &str) {
        if let Err(e) = self
            .annotate(name, &[(ANNOTATION_LAST_ACTIVITY, labels::ts_now_string())])
            .await
        {
            warn!(workload = %name, error = %e, "failed to update last-activity");
        }
    }

    /// Resolve the pod IP the in-sandbox bridges listen on.
    pub async fn workload_address(&self, name: &str) -> Result<String> {
        let workload = self
            .get(name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        workload
            .pod_ip
            .ok_or_else(|| Error::Unreachable(format!("{} has no pod IP yet", name)))
    }

    fn on_vm_runtime(&self, pod: &Pod) -> bool {
        pod.spec
            .as_ref()
            .and_then(|s| s.runtime_class_name.as_deref())
            == Some(self.config.runtime_class.as_str())
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn key_to_path(key: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: key.to_string(),
        ..Default::default()
    }
}

/// Random 8-hex suffix for workload names and replica identities.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// One-line pod state for transition logging (ContainerCreating,
/// PodInitializing, ErrImagePull, ImagePullBackOff, Running, Terminated).
fn describe_pod_state(pod: &Pod) -> String {
    if let Some(reason) = waiting_reason(pod) {
        return reason;
    }
    let terminated = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .is_some();
    if terminated {
        return "Terminated".to_string();
    }
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LABEL_CONTAINER_TYPE, LABEL_MANAGER_ID};

    fn test_config(auth_proxy: bool) -> Arc<PoolConfig> {
        let mut config = PoolConfig::parse(
            r#"
            runtime_class = "kata"

            [sandbox]
            target = 3
            prefix = "sandbox"
            image = "registry.local/sandbox:v1"
            memory_mb = 1024
            cpu_millis = 500
        "#,
        )
        .unwrap();
        config.auth_proxy.enabled = auth_proxy;
        Arc::new(config)
    }

    fn test_engine(auth_proxy: bool) -> PoolEngine {
        // Client construction is lazy; nothing talks to a cluster in here.
        let kube_config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = Client::try_from(kube_config).unwrap();
        PoolEngine::new(client, test_config(auth_proxy))
    }

    #[test]
    fn test_short_id_shape() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(short_id(), short_id());
    }

    #[tokio::test]
    async fn test_build_warm_pod_spec() {
        let engine = test_engine(false);
        let pod = engine.build_workload_pod(
            ContainerType::Sandbox,
            "sandbox-warm-1a2b3c4d",
            PoolStatus::Creating,
            None,
        );

        let labels_map = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels_map.get(LABEL_POOL_STATUS).unwrap(), "creating");
        assert_eq!(labels_map.get(LABEL_CONTAINER_TYPE).unwrap(), "sandbox");
        assert!(labels_map.contains_key(LABEL_MANAGER_ID));
        assert!(
            pod.metadata
                .annotations
                .as_ref()
                .unwrap()
                .contains_key(ANNOTATION_CREATED_AT)
        );

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.runtime_class_name.as_deref(), Some("kata"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);

        let container = &spec.containers[0];
        assert_eq!(container.name, "workload");
        assert_eq!(container.image.as_deref(), Some("registry.local/sandbox:v1"));
        assert_eq!(container.stdin, Some(true));
        assert_eq!(container.tty, Some(true));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("memory").unwrap().0, "1024Mi");
        assert_eq!(limits.get("cpu").unwrap().0, "500m");
    }

    #[tokio::test]
    async fn test_build_pod_with_auth_proxy_sidecar() {
        let engine = test_engine(true);
        let pod = engine.build_workload_pod(
            ContainerType::Sandbox,
            "sandbox-warm-ffffffff",
            PoolStatus::Creating,
            None,
        );

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[0].name, "workload");
        assert_eq!(spec.containers[1].name, "auth-proxy");

        let workload_env = spec.containers[0].env.as_ref().unwrap();
        let names: Vec<&str> = workload_env.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"HTTP_PROXY"));
        assert!(names.contains(&"HTTPS_PROXY"));
        assert!(names.contains(&"NO_PROXY"));
        assert!(names.contains(&"NODE_EXTRA_CA_CERTS"));

        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 2);
        let public = volumes.iter().find(|v| v.name == "ca-public").unwrap();
        assert_eq!(public.secret.as_ref().unwrap().items.as_ref().unwrap().len(), 1);
        let full = volumes.iter().find(|v| v.name == "ca-full").unwrap();
        assert_eq!(full.secret.as_ref().unwrap().items.as_ref().unwrap().len(), 2);

        assert!(spec.containers[1].readiness_probe.is_some());
    }

    #[tokio::test]
    async fn test_mcp_pod_never_gets_sidecar() {
        let engine = test_engine(true);
        let pod = engine.build_workload_pod(
            ContainerType::McpServer,
            "mcp-12345678",
            PoolStatus::Manual,
            None,
        );
        assert_eq!(pod.spec.as_ref().unwrap().containers.len(), 1);
    }

    #[tokio::test]
    async fn test_image_override_on_manual_pod() {
        let engine = test_engine(false);
        let pod = engine.build_workload_pod(
            ContainerType::Sandbox,
            "sandbox-deadbeef",
            PoolStatus::Manual,
            Some("custom/image:tag"),
        );
        assert_eq!(
            pod.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("custom/image:tag")
        );
    }

    #[tokio::test]
    async fn test_allocate_rejects_empty_user() {
        let engine = test_engine(false);
        let err = engine
            .allocate(ContainerType::Sandbox, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
