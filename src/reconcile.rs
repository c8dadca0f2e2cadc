//! Background reconciliation: backfill, monitor, and cleanup loops.
//!
//! Each tick is a pure function of the orchestrator's observed state; no
//! memory is carried between ticks beyond log de-duplication. Backfill runs
//! on the leader only; monitor and cleanup run on every replica and stay
//! idempotent because the orchestrator serializes deletes.

use chrono::Utc;
use futures::future::join_all;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::labels::{ContainerType, PoolStatus};
use crate::pool::PoolEngine;
use crate::workload::Workload;

/// How many warm workloads to create this tick: the pool's deficit, clamped
/// to the capacity remaining under the global cap.
pub fn backfill_quota(target: usize, pipeline: usize, total: usize, max_total: usize) -> usize {
    let deficit = target.saturating_sub(pipeline);
    let capacity = max_total.saturating_sub(total);
    deficit.min(capacity)
}

/// Leader-only loop topping warm pools up to their targets.
pub async fn run_backfill(engine: PoolEngine, token: CancellationToken) {
    let mut ticker = interval(std::time::Duration::from_secs(
        engine.config().backfill_interval_secs,
    ));
    let mut warned_at_cap = false;

    info!("backfill loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("backfill loop stopped");
                return;
            }
            _ = ticker.tick() => {
                backfill_tick(&engine, &token, &mut warned_at_cap).await;
            }
        }
    }
}

async fn backfill_tick(engine: &PoolEngine, token: &CancellationToken, warned_at_cap: &mut bool) {
    let max_total = engine.config().max_total_workloads;
    let mut total = engine.total_workloads().await;

    if total >= max_total {
        if !*warned_at_cap {
            warn!(total, max_total, "at global capacity, skipping backfill");
            *warned_at_cap = true;
        }
        return;
    }
    *warned_at_cap = false;

    // Sandbox pool first, then MCP; total is re-read in between so the two
    // pools share one cap.
    for container_type in [ContainerType::Sandbox, ContainerType::McpServer] {
        let target = engine.config().type_config(container_type).target;
        if target == 0 {
            continue;
        }

        let (creating, warm) = tokio::join!(
            engine.count(container_type, PoolStatus::Creating),
            engine.count(container_type, PoolStatus::Warm),
        );
        let pipeline = creating + warm;
        if pipeline >= target {
            continue;
        }

        let deficit = target - pipeline;
        let to_create = backfill_quota(target, pipeline, total, max_total);
        if to_create < deficit {
            warn!(
                %container_type,
                deficit,
                to_create,
                total,
                max_total,
                "backfill limited by global capacity"
            );
        }
        if to_create == 0 {
            continue;
        }

        debug!(%container_type, creating, warm, target, to_create, "backfilling pool");
        let results = join_all(
            (0..to_create).map(|_| engine.create_warm(container_type, token.child_token())),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                warn!(%container_type, error = %e, "warm create failed");
            }
        }

        total = engine.total_workloads().await;
        if total >= max_total {
            return;
        }
    }
}

/// All-replica loop deleting workloads the orchestrator reports as
/// terminated. Runs faster than backfill so failures are replaced within
/// one creation wave.
pub async fn run_monitor(engine: PoolEngine, token: CancellationToken) {
    let mut ticker = interval(std::time::Duration::from_secs(
        engine.config().monitor_interval_secs,
    ));

    info!("monitor loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("monitor loop stopped");
                return;
            }
            _ = ticker.tick() => {
                monitor_tick(&engine).await;
            }
        }
    }
}

async fn monitor_tick(engine: &PoolEngine) {
    let pods = match engine.list_pods(None).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "monitor list failed, retrying next tick");
            return;
        }
    };

    for pod in &pods {
        let workload = Workload::decode(pod);
        if !workload.phase.is_terminal() {
            continue;
        }
        info!(
            workload = %workload.name,
            phase = %workload.phase,
            pool_status = %workload.pool_status,
            "deleting terminated workload"
        );
        if let Err(e) = engine.delete(&workload.name).await {
            warn!(workload = %workload.name, error = %e, "monitor delete failed, retrying next tick");
        }
    }
}

/// All-replica loop enforcing max-lifetime and idle-timeout policies.
/// Lifetime is checked first: it is a hard cap, activity notwithstanding.
pub async fn run_cleanup(engine: PoolEngine, token: CancellationToken) {
    let mut ticker = interval(std::time::Duration::from_secs(
        engine.config().cleanup_interval_secs,
    ));

    info!("cleanup loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("cleanup loop stopped");
                return;
            }
            _ = ticker.tick() => {
                cleanup_tick(&engine).await;
            }
        }
    }
}

async fn cleanup_tick(engine: &PoolEngine) {
    let pods = match engine.list_pods(None).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "cleanup list failed, retrying next tick");
            return;
        }
    };

    let now = Utc::now();
    let max_lifetime = chrono::Duration::from_std(engine.config().max_lifetime())
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
    let idle_timeout = chrono::Duration::from_std(engine.config().idle_timeout())
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));

    for pod in &pods {
        let workload = Workload::decode(pod);

        let over_lifetime = workload
            .created_at
            .map(|created| now - created > max_lifetime)
            .unwrap_or(false);
        if over_lifetime {
            info!(workload = %workload.name, "deleting workload past max lifetime");
            if let Err(e) = engine.delete(&workload.name).await {
                warn!(workload = %workload.name, error = %e, "lifetime delete failed");
            }
            continue;
        }

        let idle = workload
            .last_activity
            .map(|activity| now - activity > idle_timeout)
            .unwrap_or(false);
        if idle {
            info!(workload = %workload.name, "deleting idle workload");
            if let Err(e) = engine.delete(&workload.name).await {
                warn!(workload = %workload.name, error = %e, "idle delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_simple_deficit() {
        // target 10, 3 in the pipeline, plenty of headroom
        assert_eq!(backfill_quota(10, 3, 3, 50), 7);
    }

    #[test]
    fn test_quota_pool_full() {
        assert_eq!(backfill_quota(10, 10, 10, 50), 0);
        assert_eq!(backfill_quota(10, 12, 12, 50), 0);
    }

    #[test]
    fn test_quota_capacity_limited() {
        // target 20, nothing warm, but the cap only leaves room for 10
        assert_eq!(backfill_quota(20, 0, 0, 10), 10);
        // some headroom already used
        assert_eq!(backfill_quota(20, 5, 8, 10), 2);
    }

    #[test]
    fn test_quota_at_cap() {
        assert_eq!(backfill_quota(20, 0, 10, 10), 0);
        assert_eq!(backfill_quota(20, 0, 15, 10), 0);
    }
}
