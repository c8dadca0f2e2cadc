//! Configuration parsing for sandpool.toml files.
//!
//! Process-wide and immutable after start. Every replica in a deployment
//! must run with the same pool targets and cap.

use anyhow::{Context, Result, bail};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config as KubeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure matching the sandpool.toml schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Namespace all workload pods live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// VM runtime handler (e.g. "kata", "gvisor"). Pods without this runtime
    /// class are invisible to the engine.
    pub runtime_class: String,
    /// Global cap across warm, allocated, and manual workloads of all types.
    #[serde(default = "default_max_total")]
    pub max_total_workloads: usize,

    /// Path to a kubeconfig file; in-cluster config is tried first.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Kubeconfig context to use.
    #[serde(default)]
    pub context: Option<String>,

    /// Delete workloads whose last activity is older than this.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Hard-delete workloads older than this regardless of activity.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Cadence of the leader-only backfill loop.
    #[serde(default = "default_backfill_interval_secs")]
    pub backfill_interval_secs: u64,
    /// Cadence of the failed-workload monitor, on every replica.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Cadence of the idle/lifetime cleanup loop.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Deadline for a VM-isolated workload to become ready.
    #[serde(default = "default_pod_ready_timeout_secs")]
    pub pod_ready_timeout_secs: u64,

    /// Port the in-sandbox executor and MCP bridge listen on.
    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,

    /// Opaque API keys recognized for privileged operations (delete_all).
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default = "default_sandbox_pool")]
    pub sandbox: TypeConfig,
    #[serde(default = "default_mcp_pool")]
    pub mcp: TypeConfig,

    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub auth_proxy: AuthProxyConfig,
}

/// Per-type pool settings (sandbox and mcp-server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeConfig {
    /// Target warm count. Zero disables the pool.
    pub target: usize,
    /// Workload name prefix.
    pub prefix: String,
    /// Default container image.
    pub image: String,
    /// Memory limit in Mi.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// CPU limit in millicores.
    #[serde(default = "default_cpu_millis")]
    pub cpu_millis: u64,
    /// Memory request in Mi; defaults to the limit.
    #[serde(default)]
    pub memory_request_mb: Option<u64>,
    /// CPU request in millicores; defaults to the limit.
    #[serde(default)]
    pub cpu_request_millis: Option<u64>,
}

impl TypeConfig {
    pub fn memory_request(&self) -> u64 {
        self.memory_request_mb.unwrap_or(self.memory_mb)
    }

    pub fn cpu_request(&self) -> u64 {
        self.cpu_request_millis.unwrap_or(self.cpu_millis)
    }
}

/// Leader-lease settings. Renew and retry periods derive from the duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_name")]
    pub name: String,
    #[serde(default = "default_lease_duration_secs")]
    pub duration_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: default_lease_name(),
            duration_secs: default_lease_duration_secs(),
        }
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// A holder must renew within two thirds of the lease duration.
    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.duration_secs * 2 / 3)
    }

    /// Non-holders retry acquisition every third of the lease duration.
    pub fn retry_period(&self) -> Duration {
        Duration::from_secs((self.duration_secs / 3).max(1))
    }
}

/// Egress auth-proxy sidecar for sandbox workloads.
///
/// Env-var names, mount paths, and secret keys are part of the contract with
/// the proxy image and the in-sandbox tooling; change them in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_proxy_image")]
    pub image: String,
    /// Secret holding the proxy CA under keys `ca.crt` / `ca.key`.
    #[serde(default = "default_ca_secret")]
    pub ca_secret: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_proxy_health_port")]
    pub health_port: u16,
    #[serde(default = "default_no_proxy")]
    pub no_proxy: String,
}

impl Default for AuthProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: default_auth_proxy_image(),
            ca_secret: default_ca_secret(),
            port: default_proxy_port(),
            health_port: default_proxy_health_port(),
            no_proxy: default_no_proxy(),
        }
    }
}

fn default_namespace() -> String {
    "sandpool".to_string()
}
fn default_max_total() -> usize {
    50
}
fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_max_lifetime_secs() -> u64 {
    14400
}
fn default_backfill_interval_secs() -> u64 {
    5
}
fn default_monitor_interval_secs() -> u64 {
    15
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_pod_ready_timeout_secs() -> u64 {
    90
}
fn default_bridge_port() -> u16 {
    8666
}
fn default_memory_mb() -> u64 {
    2048
}
fn default_cpu_millis() -> u64 {
    1000
}
fn default_lease_name() -> String {
    "sandpool-backfill".to_string()
}
fn default_lease_duration_secs() -> u64 {
    15
}
fn default_auth_proxy_image() -> String {
    "sandpool/auth-proxy:latest".to_string()
}
fn default_ca_secret() -> String {
    "sandpool-proxy-ca".to_string()
}
fn default_proxy_port() -> u16 {
    3128
}
fn default_proxy_health_port() -> u16 {
    9090
}
fn default_no_proxy() -> String {
    "localhost,127.0.0.1,.svc,.cluster.local".to_string()
}

/// Resolve a leading `~/` against $HOME so kubeconfig paths written for a
/// shell also work here.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

fn default_sandbox_pool() -> TypeConfig {
    TypeConfig {
        target: 10,
        prefix: "sandbox".to_string(),
        image: "sandpool/sandbox:latest".to_string(),
        memory_mb: default_memory_mb(),
        cpu_millis: default_cpu_millis(),
        memory_request_mb: None,
        cpu_request_millis: None,
    }
}

fn default_mcp_pool() -> TypeConfig {
    TypeConfig {
        target: 0,
        prefix: "mcp".to_string(),
        image: "sandpool/mcp-server:latest".to_string(),
        memory_mb: default_memory_mb(),
        cpu_millis: default_cpu_millis(),
        memory_request_mb: None,
        cpu_request_millis: None,
    }
}

impl PoolConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: PoolConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on configurations the loops cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            bail!("namespace must not be empty");
        }
        if self.runtime_class.is_empty() {
            bail!("runtime_class must not be empty");
        }
        if self.max_total_workloads == 0 {
            bail!("max_total_workloads must be at least 1");
        }
        if self.lease.duration_secs < 3 {
            bail!("lease duration_secs must be at least 3");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ready_timeout_secs)
    }

    pub fn type_config(&self, ty: crate::labels::ContainerType) -> &TypeConfig {
        match ty {
            crate::labels::ContainerType::Sandbox => &self.sandbox,
            crate::labels::ContainerType::McpServer => &self.mcp,
        }
    }

    /// Connect to the orchestrator this configuration points at.
    ///
    /// With no explicit kubeconfig, inference covers both deployment modes:
    /// service-account credentials inside a cluster, the ambient kubeconfig
    /// outside. A configured path (with optional context) overrides both.
    pub async fn connect(&self) -> Result<Client> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };

        let kube_config = match self.kubeconfig.as_deref() {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(expand_home(path))
                    .with_context(|| format!("failed to read kubeconfig at {}", path))?;
                KubeConfig::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .context("failed to load configured kubeconfig")?
            }
            None if self.context.is_some() => KubeConfig::from_kubeconfig(&options)
                .await
                .context("failed to load kubeconfig for configured context")?,
            None => KubeConfig::infer()
                .await
                .context("no in-cluster or kubeconfig credentials found")?,
        };

        Client::try_from(kube_config).context("failed to build orchestrator client")
    }

    /// Constant-time membership check for privileged API keys.
    pub fn is_privileged_key(&self, presented: &str) -> bool {
        let mut found = false;
        for key in &self.api_keys {
            if key.len() == presented.len() {
                let mut diff = 0u8;
                for (a, b) in key.bytes().zip(presented.bytes()) {
                    diff |= a ^ b;
                }
                found |= diff == 0;
            }
        }
        found
    }
}
