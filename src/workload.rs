//! Workload data model decoded from orchestrator pods.
//!
//! All state lives on the pod: pool status and container type as labels,
//! timestamps as annotations. Nothing here is cached beyond a single
//! reconcile pass.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use std::fmt;

use crate::labels::{
    self, ANNOTATION_ALLOCATED_AT, ANNOTATION_CREATED_AT, ANNOTATION_LAST_ACTIVITY,
    ANNOTATION_MCP_LAUNCH_COMMAND, ContainerType, LABEL_ALLOCATED_TO, LABEL_CONTAINER_TYPE,
    LABEL_MANAGER_ID, LABEL_POOL_STATUS, PoolStatus,
};

/// Pod lifecycle phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Phase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Phase::Pending,
            "Running" => Phase::Running,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            _ => Phase::Unknown,
        }
    }

    /// Terminal phases are deleted by the monitor loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Running => write!(f, "Running"),
            Phase::Succeeded => write!(f, "Succeeded"),
            Phase::Failed => write!(f, "Failed"),
            Phase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single VM-isolated instance, decoded from its pod.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub name: String,
    pub container_type: ContainerType,
    pub pool_status: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_to: Option<String>,
    pub phase: Phase,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

impl Workload {
    /// Decode the pool view of a pod from its labels, annotations, and status.
    pub fn decode(pod: &Pod) -> Self {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let labels = pod.metadata.labels.as_ref();
        let annotations = pod.metadata.annotations.as_ref();

        let get_label = |key: &str| labels.and_then(|l| l.get(key)).cloned();
        let get_ts = |key: &str| {
            annotations
                .and_then(|a| a.get(key))
                .and_then(|v| labels::parse_ts(v))
        };

        let container_type = get_label(LABEL_CONTAINER_TYPE)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        // An unlabeled pod on our runtime class is treated as manual: it
        // consumes capacity but is never handed out of the warm pool.
        let pool_status = get_label(LABEL_POOL_STATUS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(PoolStatus::Manual);

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(Phase::parse)
            .unwrap_or(Phase::Unknown);

        Workload {
            name,
            container_type,
            pool_status,
            allocated_to: get_label(LABEL_ALLOCATED_TO),
            phase,
            ready: pod_is_ready(pod),
            created_at: get_ts(ANNOTATION_CREATED_AT),
            allocated_at: get_ts(ANNOTATION_ALLOCATED_AT),
            last_activity: get_ts(ANNOTATION_LAST_ACTIVITY),
            launch_command: annotations
                .and_then(|a| a.get(ANNOTATION_MCP_LAUNCH_COMMAND))
                .cloned(),
            manager_id: get_label(LABEL_MANAGER_ID),
            image: pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .and_then(|c| c.image.clone()),
            pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        }
    }
}

/// Ready means phase Running with condition Ready=True.
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Human-readable waiting reason for the first container, if any
/// (ContainerCreating, PodInitializing, ErrImagePull, ImagePullBackOff, ...).
pub fn waiting_reason(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.waiting.as_ref())
        .and_then(|w| w.reason.clone())
}

/// Derived pool statistics; never stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub creating: usize,
    pub warm: usize,
    pub allocated: usize,
    pub manual: usize,
    pub total: usize,
    pub target: usize,
    pub max_total: usize,
    pub ready_pct: f64,
    pub utilization_pct: f64,
}

impl PoolStats {
    pub fn derive(
        creating: usize,
        warm: usize,
        allocated: usize,
        manual: usize,
        total: usize,
        target: usize,
        max_total: usize,
    ) -> Self {
        let ready_pct = if target == 0 {
            0.0
        } else {
            warm as f64 / target as f64 * 100.0
        };
        let utilization_pct = if total == 0 {
            0.0
        } else {
            (allocated + manual) as f64 / total as f64 * 100.0
        };
        PoolStats {
            creating,
            warm,
            allocated,
            manual,
            total,
            target,
            max_total,
            ready_pct,
            utilization_pct,
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} warm ({:.0}% ready), {} creating, {} allocated, {} manual, {}/{} total ({:.0}% utilized)",
            self.warm,
            self.target,
            self.ready_pct,
            self.creating,
            self.allocated,
            self.manual,
            self.total,
            self.max_total,
            self.utilization_pct
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with(
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
        phase: &str,
        ready: bool,
    ) -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("sandbox-warm-1a2b3c4d".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            pod_ip: Some("10.0.0.12".to_string()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_decode_warm_sandbox() {
        let pod = pod_with(
            &[
                (LABEL_POOL_STATUS, "warm"),
                (LABEL_CONTAINER_TYPE, "sandbox"),
                (LABEL_MANAGER_ID, "host-deadbeef"),
            ],
            &[
                (ANNOTATION_CREATED_AT, "1700000000"),
                (ANNOTATION_LAST_ACTIVITY, "1700000100"),
            ],
            "Running",
            true,
        );
        let w = Workload::decode(&pod);
        assert_eq!(w.pool_status, PoolStatus::Warm);
        assert_eq!(w.container_type, ContainerType::Sandbox);
        assert!(w.ready);
        assert_eq!(w.phase, Phase::Running);
        assert_eq!(w.created_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(w.last_activity.unwrap().timestamp(), 1_700_000_100);
        assert_eq!(w.allocated_to, None);
        assert_eq!(w.pod_ip.as_deref(), Some("10.0.0.12"));
    }

    #[test]
    fn test_decode_allocated() {
        let pod = pod_with(
            &[
                (LABEL_POOL_STATUS, "allocated"),
                (LABEL_CONTAINER_TYPE, "mcp-server"),
                (LABEL_ALLOCATED_TO, "user-42"),
            ],
            &[(ANNOTATION_ALLOCATED_AT, "1700000200")],
            "Running",
            true,
        );
        let w = Workload::decode(&pod);
        assert_eq!(w.pool_status, PoolStatus::Allocated);
        assert_eq!(w.container_type, ContainerType::McpServer);
        assert_eq!(w.allocated_to.as_deref(), Some("user-42"));
        assert_eq!(w.allocated_at.unwrap().timestamp(), 1_700_000_200);
    }

    #[test]
    fn test_decode_unlabeled_defaults_to_manual() {
        let pod = pod_with(&[], &[], "Pending", false);
        let w = Workload::decode(&pod);
        assert_eq!(w.pool_status, PoolStatus::Manual);
        assert_eq!(w.container_type, ContainerType::Sandbox);
        assert!(!w.ready);
    }

    #[test]
    fn test_not_ready_when_condition_false() {
        let pod = pod_with(&[(LABEL_POOL_STATUS, "creating")], &[], "Running", false);
        assert!(!pod_is_ready(&pod));
    }

    #[test]
    fn test_waiting_reason() {
        let mut pod = pod_with(&[], &[], "Pending", false);
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "workload".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ImagePullBackOff".to_string()),
                    message: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert_eq!(waiting_reason(&pod).as_deref(), Some("ImagePullBackOff"));
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!(Phase::parse("Running"), Phase::Running);
        assert_eq!(Phase::parse("Failed"), Phase::Failed);
        assert_eq!(Phase::parse("whatever"), Phase::Unknown);
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Succeeded.is_terminal());
        assert!(!Phase::Running.is_terminal());
    }

    #[test]
    fn test_stats_derivation() {
        let stats = PoolStats::derive(2, 8, 5, 1, 16, 10, 50);
        assert_eq!(stats.ready_pct, 80.0);
        assert_eq!(stats.utilization_pct, 37.5);
    }

    #[test]
    fn test_stats_zero_totals() {
        let stats = PoolStats::derive(0, 0, 0, 0, 0, 0, 50);
        assert_eq!(stats.ready_pct, 0.0);
        assert_eq!(stats.utilization_pct, 0.0);
    }
}
