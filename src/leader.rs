//! Leader election over a coordination.k8s.io lease.
//!
//! The lease is the only election mechanism; there is no in-process
//! protocol. Acquisition and renewal both go through replace-with-version,
//! the same optimistic-concurrency primitive allocation uses. Exactly one
//! replica holds the lease at any instant; only the holder runs backfill.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, PostParams};
use std::sync::Arc;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Result, is_conflict};
use crate::pool::{PoolEngine, short_id};
use crate::reconcile;

/// Observers of leadership transitions.
pub trait LeadershipHooks: Send + Sync {
    /// This replica became the holder. The token is cancelled on loss.
    fn on_acquired(&self, token: CancellationToken);
    /// This replica stopped being the holder.
    fn on_lost(&self);
    /// Another replica became the holder.
    fn on_new_leader(&self, holder: &str);
}

/// Default hooks: run the backfill loop while holding the lease.
pub struct BackfillOnLead {
    engine: PoolEngine,
}

impl BackfillOnLead {
    pub fn new(engine: PoolEngine) -> Self {
        Self { engine }
    }
}

impl LeadershipHooks for BackfillOnLead {
    fn on_acquired(&self, token: CancellationToken) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            reconcile::run_backfill(engine, token).await;
        });
    }

    fn on_lost(&self) {}

    fn on_new_leader(&self, holder: &str) {
        debug!(%holder, "observed new leader");
    }
}

/// What one acquisition round observed.
struct LeaseView {
    acquired: bool,
    holder: Option<String>,
}

/// Lease-backed leader coordinator for one replica.
pub struct LeaderElector {
    leases: Api<Lease>,
    config: Arc<PoolConfig>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, config: Arc<PoolConfig>) -> Self {
        let leases = Api::namespaced(client, &config.namespace);
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "sandpool".to_string());
        let identity = format!("{}-{}", host, short_id());
        Self {
            leases,
            config,
            identity,
        }
    }

    /// Unique holder identity of this replica.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Drive election until the token is cancelled. Acquisition is retried
    /// every third of the lease duration; a holder that fails to renew
    /// within two thirds of it relinquishes.
    pub async fn run(&self, hooks: &dyn LeadershipHooks, token: CancellationToken) {
        let mut ticker = interval(self.config.lease.retry_period());
        let renew_deadline = self.config.lease.renew_deadline();
        let mut lead_token: Option<CancellationToken> = None;
        let mut last_holder: Option<String> = None;
        let mut last_renewed = Instant::now();

        info!(identity = %self.identity, lease = %self.config.lease.name, "leader election started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(lead) = lead_token.take() {
                        lead.cancel();
                        hooks.on_lost();
                        self.release().await;
                    }
                    info!("leader election stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(view) => {
                    if view.acquired {
                        last_renewed = Instant::now();
                        if lead_token.is_none() {
                            info!(identity = %self.identity, "acquired leadership");
                            let lead = token.child_token();
                            hooks.on_acquired(lead.clone());
                            lead_token = Some(lead);
                        }
                        last_holder = Some(self.identity.clone());
                    } else {
                        if let Some(lead) = lead_token.take() {
                            warn!("lost leadership to another replica");
                            lead.cancel();
                            hooks.on_lost();
                        }
                        if view.holder.is_some() && view.holder != last_holder {
                            let holder = view.holder.clone().unwrap();
                            hooks.on_new_leader(&holder);
                            last_holder = view.holder;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "lease update failed");
                    if lead_token.is_some() && last_renewed.elapsed() > renew_deadline {
                        warn!("renew deadline exceeded, relinquishing leadership");
                        if let Some(lead) = lead_token.take() {
                            lead.cancel();
                            hooks.on_lost();
                        }
                    }
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<LeaseView> {
        let name = &self.config.lease.name;
        let duration_secs = self.config.lease.duration_secs as i64;
        let now = Utc::now();

        let Some(existing) = self.leases.get_opt(name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.lease_spec(now, now, 0)),
            };
            return match self.leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(LeaseView {
                    acquired: true,
                    holder: Some(self.identity.clone()),
                }),
                // Another replica created it between our get and create.
                Err(e) if is_conflict(&e) => Ok(LeaseView {
                    acquired: false,
                    holder: None,
                }),
                Err(e) => Err(e.into()),
            };
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone();
        let ours = holder.as_deref() == Some(self.identity.as_str());

        if !ours && !lease_expired(&spec, now, duration_secs) {
            return Ok(LeaseView {
                acquired: false,
                holder,
            });
        }

        let acquire_time = if ours {
            spec.acquire_time
                .as_ref()
                .map(|t| t.0)
                .unwrap_or(now)
        } else {
            now
        };
        let transitions = spec.lease_transitions.unwrap_or(0) + if ours { 0 } else { 1 };

        let mut updated = existing;
        updated.spec = Some(self.lease_spec(acquire_time, now, transitions));

        match self
            .leases
            .replace(name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(LeaseView {
                acquired: true,
                holder: Some(self.identity.clone()),
            }),
            Err(e) if is_conflict(&e) => Ok(LeaseView {
                acquired: false,
                holder: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_spec(
        &self,
        acquire_time: DateTime<Utc>,
        renew_time: DateTime<Utc>,
        transitions: i32,
    ) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.config.lease.duration_secs as i32),
            acquire_time: Some(MicroTime(acquire_time)),
            renew_time: Some(MicroTime(renew_time)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Best-effort release so a successor does not wait out the expiry.
    async fn release(&self) {
        let name = &self.config.lease.name;
        let Ok(Some(mut lease)) = self.leases.get_opt(name).await else {
            return;
        };
        let ours = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str());
        if !ours {
            return;
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        if let Err(e) = self.leases.replace(name, &PostParams::default(), &lease).await {
            debug!(error = %e, "lease release failed");
        }
    }
}

/// A lease with no renew time, or one renewed longer than its duration ago,
/// is up for grabs.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>, duration_secs: i64) -> bool {
    match &spec.renew_time {
        Some(renewed) => now - renewed.0 > chrono::Duration::seconds(duration_secs),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_renewed_at(renewed: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other-replica-12345678".to_string()),
            renew_time: Some(MicroTime(renewed)),
            lease_duration_seconds: Some(15),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_lease_not_expired() {
        let now = Utc::now();
        let spec = spec_renewed_at(now - chrono::Duration::seconds(5));
        assert!(!lease_expired(&spec, now, 15));
    }

    #[test]
    fn test_stale_lease_expired() {
        let now = Utc::now();
        let spec = spec_renewed_at(now - chrono::Duration::seconds(30));
        assert!(lease_expired(&spec, now, 15));
    }

    #[test]
    fn test_unrenewed_lease_expired() {
        let spec = LeaseSpec::default();
        assert!(lease_expired(&spec, Utc::now(), 15));
    }
}
