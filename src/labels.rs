//! Label and annotation vocabulary for pool state on workload pods.
//!
//! Pool state is a label (selectable); time-based fields are annotations so
//! updates don't invalidate watch indexes. Selectors are constructed here,
//! never string-concatenated at call sites.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;

pub const LABEL_POOL_STATUS: &str = "sandpool.io/pool-status";
pub const LABEL_CONTAINER_TYPE: &str = "sandpool.io/container-type";
pub const LABEL_ALLOCATED_TO: &str = "sandpool.io/allocated-to";
pub const LABEL_MANAGER_ID: &str = "sandpool.io/manager-id";

pub const ANNOTATION_CREATED_AT: &str = "sandpool.io/created-at";
pub const ANNOTATION_ALLOCATED_AT: &str = "sandpool.io/allocated-at";
pub const ANNOTATION_LAST_ACTIVITY: &str = "sandpool.io/last-activity";
pub const ANNOTATION_MCP_LAUNCH_COMMAND: &str = "sandpool.io/mcp-launch-command";

/// Kind of workload a pod hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerType {
    #[default]
    Sandbox,
    McpServer,
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerType::Sandbox => write!(f, "sandbox"),
            ContainerType::McpServer => write!(f, "mcp-server"),
        }
    }
}

impl std::str::FromStr for ContainerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(ContainerType::Sandbox),
            "mcp-server" => Ok(ContainerType::McpServer),
            _ => Err(format!(
                "Unknown container type '{}'. Valid options: sandbox, mcp-server",
                s
            )),
        }
    }
}

/// Lifecycle label on a workload. Exactly one value at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// Created, waiting to become ready.
    Creating,
    /// Ready and waiting for allocation.
    Warm,
    /// Bound to a user.
    Allocated,
    /// Created via the on-demand path; never counted toward warm targets.
    Manual,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolStatus::Creating => write!(f, "creating"),
            PoolStatus::Warm => write!(f, "warm"),
            PoolStatus::Allocated => write!(f, "allocated"),
            PoolStatus::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for PoolStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "creating" => Ok(PoolStatus::Creating),
            "warm" => Ok(PoolStatus::Warm),
            "allocated" => Ok(PoolStatus::Allocated),
            "manual" => Ok(PoolStatus::Manual),
            _ => Err(format!(
                "Unknown pool status '{}'. Valid options: creating, warm, allocated, manual",
                s
            )),
        }
    }
}

/// Build a label selector for listing workloads by type and/or status.
pub fn selector(container_type: Option<ContainerType>, status: Option<PoolStatus>) -> String {
    let mut parts = Vec::new();
    if let Some(ty) = container_type {
        parts.push(format!("{}={}", LABEL_CONTAINER_TYPE, ty));
    }
    if let Some(st) = status {
        parts.push(format!("{}={}", LABEL_POOL_STATUS, st));
    }
    parts.join(",")
}

/// Standard labels for a pool-managed workload pod.
pub fn pool_labels(
    container_type: ContainerType,
    status: PoolStatus,
    manager_id: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_POOL_STATUS.to_string(), status.to_string());
    labels.insert(LABEL_CONTAINER_TYPE.to_string(), container_type.to_string());
    labels.insert(LABEL_MANAGER_ID.to_string(), manager_id.to_string());
    labels
}

/// Current time as a Unix-seconds decimal string for annotations.
pub fn ts_now_string() -> String {
    Utc::now().timestamp().to_string()
}

/// Parse a Unix-seconds annotation value. Returns None on garbage.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Display form of an MCP launch command, stored as an annotation.
pub fn render_launch_command(command: &str, arguments: &[String]) -> String {
    if arguments.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, arguments.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_both() {
        let sel = selector(Some(ContainerType::Sandbox), Some(PoolStatus::Warm));
        assert_eq!(
            sel,
            "sandpool.io/container-type=sandbox,sandpool.io/pool-status=warm"
        );
    }

    #[test]
    fn test_selector_status_only() {
        let sel = selector(None, Some(PoolStatus::Manual));
        assert_eq!(sel, "sandpool.io/pool-status=manual");
    }

    #[test]
    fn test_container_type_roundtrip() {
        for ty in [ContainerType::Sandbox, ContainerType::McpServer] {
            let parsed: ContainerType = ty.to_string().parse().unwrap();
            assert_eq!(parsed, ty);
        }
        assert!("vm".parse::<ContainerType>().is_err());
    }

    #[test]
    fn test_pool_status_roundtrip() {
        for st in [
            PoolStatus::Creating,
            PoolStatus::Warm,
            PoolStatus::Allocated,
            PoolStatus::Manual,
        ] {
            let parsed: PoolStatus = st.to_string().parse().unwrap();
            assert_eq!(parsed, st);
        }
    }

    #[test]
    fn test_parse_ts() {
        let now = Utc::now();
        let parsed = parse_ts(&now.timestamp().to_string()).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());

        assert!(parse_ts("").is_none());
        assert!(parse_ts("not-a-number").is_none());
        assert!(parse_ts(" 1700000000 ").is_some());
    }

    #[test]
    fn test_pool_labels() {
        let labels = pool_labels(ContainerType::McpServer, PoolStatus::Creating, "host-abc123");
        assert_eq!(labels.get(LABEL_POOL_STATUS).unwrap(), "creating");
        assert_eq!(labels.get(LABEL_CONTAINER_TYPE).unwrap(), "mcp-server");
        assert_eq!(labels.get(LABEL_MANAGER_ID).unwrap(), "host-abc123");
    }

    #[test]
    fn test_render_launch_command() {
        assert_eq!(render_launch_command("npx", &[]), "npx");
        assert_eq!(
            render_launch_command(
                "npx",
                &["-y".to_string(), "@modelcontextprotocol/server-everything".to_string()]
            ),
            "npx -y @modelcontextprotocol/server-everything"
        );
    }
}
