//! Leader election across controller replicas.
//!
//! Only the replica holding the Kubernetes Lease polls Sentinel and issues
//! restarts, so two replicas never run waves against the same workloads.
//! Standbys block in [`LeaderElection::acquire`]. When the leader loses the
//! lease its renewal task cancels the shared shutdown token, the control loop
//! winds down and the process exits non-zero.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::parse_or_default;

/// Consecutive renewal failures tolerated before giving up the lease.
const MAX_RENEWAL_FAILURES: u32 = 3;

const DEFAULT_LEASE_NAME: &str = "failover-restarter-leader";
const DEFAULT_LEASE_DURATION_SECS: u64 = 15;
const DEFAULT_RENEW_INTERVAL_SECS: u64 = 5;

pub mod env {
    pub const ENABLED: &str = "LEADER_ELECTION_ENABLED";
    pub const LEASE_NAME: &str = "LEADER_ELECTION_LEASE_NAME";
    pub const NAMESPACE: &str = "POD_NAMESPACE";
    pub const HOLDER: &str = "POD_NAME";
    pub const LEASE_DURATION_SECS: &str = "LEADER_ELECTION_LEASE_DURATION";
    pub const RENEW_INTERVAL_SECS: &str = "LEADER_ELECTION_RENEW_INTERVAL";
}

/// Which Lease to contend for and on what cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub holder_id: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
}

impl LeaderElectionConfig {
    /// `None` unless `LEADER_ELECTION_ENABLED` is "true".
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = lookup(env::ENABLED).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        if !enabled {
            return Ok(None);
        }

        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{key} required when leader election is enabled"))
        };

        let config = Self {
            lease_name: lookup(env::LEASE_NAME)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string()),
            namespace: required(env::NAMESPACE)?,
            holder_id: required(env::HOLDER)?,
            lease_duration: Duration::from_secs(parse_or_default(
                &lookup,
                env::LEASE_DURATION_SECS,
                DEFAULT_LEASE_DURATION_SECS,
            )),
            renew_interval: Duration::from_secs(parse_or_default(
                &lookup,
                env::RENEW_INTERVAL_SECS,
                DEFAULT_RENEW_INTERVAL_SECS,
            )),
        };

        ensure!(
            config.renew_interval < config.lease_duration,
            "{} ({:?}) must be shorter than {} ({:?})",
            env::RENEW_INTERVAL_SECS,
            config.renew_interval,
            env::LEASE_DURATION_SECS,
            config.lease_duration
        );

        Ok(Some(config))
    }
}

fn holder_of(lease: Option<&Lease>) -> &str {
    lease
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or("unknown")
}

/// Lease-based leader election.
pub struct LeaderElection {
    lease_lock: LeaseLock,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Self {
        let lease_lock = LeaseLock::new(
            client,
            &config.namespace,
            LeaseLockParams {
                holder_id: config.holder_id.clone(),
                lease_name: config.lease_name.clone(),
                lease_ttl: config.lease_duration,
            },
        );

        Self {
            lease_lock,
            renew_interval: config.renew_interval,
        }
    }

    /// Block until the lease is held or `shutdown` fires.
    ///
    /// Returns `false` when shutdown arrived first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        info!("Waiting for leadership");

        loop {
            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(holder = %holder_of(result.lease.as_ref()), "Leadership acquired");
                    return true;
                }
                Ok(result) => {
                    info!(
                        current_holder = %holder_of(result.lease.as_ref()),
                        "Another replica is leader, standing by"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check leadership, retrying");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.renew_interval) => {}
            }
        }
    }

    /// Keep renewing the lease in the background.
    ///
    /// The task resolves to `true` when leadership was lost, after cancelling
    /// `shutdown`, and to `false` when `shutdown` was cancelled elsewhere.
    pub fn spawn_renewal_task(self, shutdown: CancellationToken) -> JoinHandle<bool> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.renew_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return false,
                    _ = interval.tick() => {}
                }

                match self.lease_lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {
                        if consecutive_failures > 0 {
                            info!(
                                previous_failures = consecutive_failures,
                                "Lease renewed after transient failures"
                            );
                        }
                        consecutive_failures = 0;
                        tracing::trace!("Lease renewed");
                    }
                    Ok(result) => {
                        error!(
                            new_holder = %holder_of(result.lease.as_ref()),
                            "Lost leadership to another replica"
                        );
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_RENEWAL_FAILURES {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Lease renewal keeps failing, giving up leadership"
                            );
                            break;
                        }
                        warn!(
                            error = %e,
                            attempt = consecutive_failures,
                            max_attempts = MAX_RENEWAL_FAILURES,
                            "Transient lease renewal failure, will retry"
                        );
                    }
                }
            }

            shutdown.cancel();
            true
        })
    }
}
