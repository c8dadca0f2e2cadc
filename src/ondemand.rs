//! Streaming on-demand workload creation.
//!
//! A producer task provisions a `pool-status=manual` workload and writes
//! lifecycle events into a bounded channel while polling readiness. The
//! stream is finite: it always ends with exactly one of `ready`, `failed`,
//! `mcp_started`, or `mcp_start_failed`. Dropping the receiver cancels the
//! producer.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::labels::ContainerType;
use crate::mcp::{McpBridge, McpStartRequest};
use crate::pool::{PoolEngine, READY_POLL_INTERVAL};
use crate::workload::{Phase, Workload, pod_is_ready, waiting_reason};

/// Request for the on-demand creation path.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnDemandRequest {
    pub container_type: ContainerType,
    /// Image override; the type's default image otherwise.
    pub image: Option<String>,
    /// For MCP workloads: launch the stdio process once the pod is ready.
    pub launch: Option<McpStartRequest>,
}

/// One event in the on-demand creation stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created {
        name: String,
        phase: Phase,
    },
    Waiting {
        name: String,
        attempt: u32,
        phase: Phase,
        message: String,
    },
    Ready {
        name: String,
        info: Workload,
        elapsed_s: f64,
    },
    Failed {
        name: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<Workload>,
    },
    McpStarting {
        name: String,
        message: String,
    },
    McpStarted {
        name: String,
        info: Value,
        elapsed_s: f64,
    },
    McpStartFailed {
        name: String,
        reason: String,
    },
}

/// Create a workload on demand, returning the lazy event stream.
pub fn create_on_demand(
    engine: PoolEngine,
    bridge: McpBridge,
    request: OnDemandRequest,
    token: CancellationToken,
) -> mpsc::Receiver<LifecycleEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        produce(engine, bridge, request, token, tx).await;
    });
    rx
}

async fn produce(
    engine: PoolEngine,
    bridge: McpBridge,
    request: OnDemandRequest,
    token: CancellationToken,
    tx: mpsc::Sender<LifecycleEvent>,
) {
    let started = Instant::now();
    let container_type = request.container_type;

    let name = match engine
        .create_manual(container_type, request.image.as_deref())
        .await
    {
        Ok(name) => name,
        Err(e) => {
            let _ = tx
                .send(LifecycleEvent::Failed {
                    name: String::new(),
                    reason: e.to_string(),
                    info: None,
                })
                .await;
            return;
        }
    };

    if tx
        .send(LifecycleEvent::Created {
            name: name.clone(),
            phase: Phase::Pending,
        })
        .await
        .is_err()
    {
        return;
    }

    let deadline = started + engine.config().pod_ready_timeout();
    let mut attempt: u32 = 0;

    let workload = loop {
        if token.is_cancelled() {
            return;
        }
        if Instant::now() >= deadline {
            let info = engine.get(&name).await.ok().flatten();
            let _ = tx
                .send(LifecycleEvent::Failed {
                    name: name.clone(),
                    reason: "timeout".to_string(),
                    info,
                })
                .await;
            return;
        }
        attempt += 1;

        let pod = match engine.pods().get_opt(&name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                let _ = tx
                    .send(LifecycleEvent::Failed {
                        name: name.clone(),
                        reason: "workload was deleted while waiting".to_string(),
                        info: None,
                    })
                    .await;
                return;
            }
            Err(e) => {
                debug!(workload = %name, error = %e, "on-demand readiness poll failed");
                if pause(&tx, &token).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let workload = Workload::decode(&pod);
        if workload.phase == Phase::Failed {
            let _ = tx
                .send(LifecycleEvent::Failed {
                    name: name.clone(),
                    reason: "workload entered phase Failed".to_string(),
                    info: Some(workload),
                })
                .await;
            return;
        }
        if pod_is_ready(&pod) {
            break workload;
        }

        let message = waiting_reason(&pod).unwrap_or_else(|| workload.phase.to_string());
        if tx
            .send(LifecycleEvent::Waiting {
                name: name.clone(),
                attempt,
                phase: workload.phase,
                message,
            })
            .await
            .is_err()
        {
            return;
        }
        if pause(&tx, &token).await.is_err() {
            return;
        }
    };

    if tx
        .send(LifecycleEvent::Ready {
            name: name.clone(),
            info: workload,
            elapsed_s: started.elapsed().as_secs_f64(),
        })
        .await
        .is_err()
    {
        return;
    }

    // MCP workloads can be armed in the same stream.
    let Some(launch) = request.launch else {
        return;
    };

    if tx
        .send(LifecycleEvent::McpStarting {
            name: name.clone(),
            message: format!("launching {}", launch.command),
        })
        .await
        .is_err()
    {
        return;
    }

    let mut events = match bridge.arm(&engine, &name, launch).await {
        Ok(events) => events,
        Err(e) => {
            let _ = tx
                .send(LifecycleEvent::McpStartFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    while let Some(event) = events.recv().await {
        match classify_start_event(&event) {
            StartEventKind::Ready => {
                let _ = tx
                    .send(LifecycleEvent::McpStarted {
                        name: name.clone(),
                        info: event,
                        elapsed_s: started.elapsed().as_secs_f64(),
                    })
                    .await;
                return;
            }
            StartEventKind::Error(reason) => {
                let _ = tx
                    .send(LifecycleEvent::McpStartFailed {
                        name: name.clone(),
                        reason,
                    })
                    .await;
                return;
            }
            StartEventKind::Progress(message) => {
                if tx
                    .send(LifecycleEvent::McpStarting {
                        name: name.clone(),
                        message,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    let _ = tx
        .send(LifecycleEvent::McpStartFailed {
            name,
            reason: "start stream ended before the server became ready".to_string(),
        })
        .await;
}

/// Sleep one poll interval, waking early on cancellation or a dropped
/// consumer. Err means stop producing.
async fn pause(
    tx: &mpsc::Sender<LifecycleEvent>,
    token: &CancellationToken,
) -> std::result::Result<(), ()> {
    tokio::select! {
        _ = token.cancelled() => Err(()),
        _ = tx.closed() => Err(()),
        _ = sleep(READY_POLL_INTERVAL) => Ok(()),
    }
}

/// How a bridge start event moves the stream forward.
#[derive(Debug, PartialEq)]
enum StartEventKind {
    Ready,
    Error(String),
    Progress(String),
}

fn classify_start_event(event: &Value) -> StartEventKind {
    let state = event
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    match state.as_str() {
        "ready" => StartEventKind::Ready,
        "error" | "failed" => {
            let reason = event
                .get("error")
                .or_else(|| event.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("MCP process reported an error")
                .to_string();
            StartEventKind::Error(reason)
        }
        _ => {
            let message = event
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| {
                    if state.is_empty() {
                        event.to_string()
                    } else {
                        state.clone()
                    }
                });
            StartEventKind::Progress(message)
        }
    }
}
