//! Failover detection loop
//!
//! Polls the primary watcher, compares against the last known primary and
//! drives a restart wave on change. The last known primary only advances
//! once a wave has been fully attempted, so a crash or an aborted resolution
//! leaves the change visible to the next poll and the wave is retried.
//!
//! ```text
//!   Uninitialized ──first lookup──▶ Tracking(H)
//!                                     │  H' == H : no-op
//!                                     │  H' != H : wave, then Tracking(H')
//!                                     │  lookup error : no-op
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PollConfig, RestartSpec};
use crate::health::HealthState;
use crate::resource::RestartOutcome;
use crate::restart::{RestartExecutor, WaveSummary};
use crate::selector::ResourceSelector;
use crate::sentinel::PrimaryWatcher;
use crate::workload::{WorkloadApi, WorkloadError};

/// The last primary the loop acted on
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrimaryState {
    last_known_host: Option<String>,
}

/// How a freshly discovered primary relates to the recorded one
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Nothing recorded yet; the host becomes the baseline
    Baseline,
    Unchanged,
    Changed { previous: String },
}

impl PrimaryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_known_host(&self) -> Option<&str> {
        self.last_known_host.as_deref()
    }

    pub fn observe(&self, current: &str) -> Observation {
        match self.last_known_host.as_deref() {
            None => Observation::Baseline,
            Some(previous) if previous == current => Observation::Unchanged,
            Some(previous) => Observation::Changed {
                previous: previous.to_string(),
            },
        }
    }

    pub fn advance(&mut self, host: String) {
        self.last_known_host = Some(host);
    }
}

/// What a single poll did
#[derive(Debug, PartialEq, Eq)]
pub enum PollEvent {
    Baseline { host: String },
    Unchanged { host: String },
    Failover {
        from: String,
        to: String,
        summary: WaveSummary,
    },
    /// Restart targets could not be resolved; the change stays pending
    WaveDeferred { from: String, to: String },
    DiscoveryFailed,
}

pub struct ControlLoop<P, W> {
    watcher: P,
    selector: ResourceSelector<W>,
    executor: RestartExecutor<W>,
    spec: RestartSpec,
    poll: PollConfig,
    concurrency: usize,
    state: PrimaryState,
    health: Option<Arc<HealthState>>,
}

impl<P: PrimaryWatcher, W: WorkloadApi> ControlLoop<P, W> {
    pub fn new(watcher: P, workloads: Arc<W>, spec: RestartSpec, poll: PollConfig) -> Self {
        Self {
            watcher,
            selector: ResourceSelector::new(workloads.clone()),
            executor: RestartExecutor::new(workloads),
            spec,
            poll,
            concurrency: 1,
            state: PrimaryState::new(),
            health: None,
        }
    }

    /// Restarts allowed in flight within one wave. Waves never overlap.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> &PrimaryState {
        &self.state
    }

    fn record_discovery(&self, reachable: bool) {
        if let Some(health) = &self.health {
            health.record_discovery(reachable);
        }
    }

    /// One iteration of the state machine.
    pub async fn poll_once(&mut self) -> PollEvent {
        let current = match self.watcher.current_primary().await {
            Ok(host) => host,
            Err(e) => {
                self.record_discovery(false);
                error!(error = %e, "Primary discovery failed, will retry");
                return PollEvent::DiscoveryFailed;
            }
        };
        self.record_discovery(true);

        match self.state.observe(&current) {
            Observation::Baseline => {
                info!(host = %current, "Recorded initial primary");
                self.state.advance(current.clone());
                PollEvent::Baseline { host: current }
            }
            Observation::Unchanged => {
                debug!(host = %current, "Primary unchanged");
                PollEvent::Unchanged { host: current }
            }
            Observation::Changed { previous } => {
                warn!(from = %previous, to = %current, "Primary changed, starting restart wave");

                match self.run_wave().await {
                    Ok(summary) => {
                        info!(
                            from = %previous,
                            to = %current,
                            attempted = summary.attempted(),
                            succeeded = summary.succeeded,
                            not_found = summary.not_found,
                            failed = summary.failed,
                            "Restart wave complete"
                        );
                        self.state.advance(current.clone());
                        PollEvent::Failover {
                            from: previous,
                            to: current,
                            summary,
                        }
                    }
                    Err(e) => {
                        error!(
                            from = %previous,
                            to = %current,
                            error = %e,
                            "Could not resolve restart targets, wave will be retried"
                        );
                        PollEvent::WaveDeferred {
                            from: previous,
                            to: current,
                        }
                    }
                }
            }
        }
    }

    /// Resolve the targets and attempt every restart before returning.
    async fn run_wave(&self) -> Result<WaveSummary, WorkloadError> {
        let targets = self.selector.resolve(&self.spec).await?;
        info!(
            targets = targets.len(),
            concurrency = self.concurrency,
            "Resolved restart targets"
        );

        let outcomes: Vec<RestartOutcome> = stream::iter(targets)
            .map(|target| self.executor.restart(target))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        Ok(WaveSummary::from_outcomes(&outcomes))
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// An in-flight wave runs to completion; no wave starts after cancellation.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            min_secs = self.poll.min.as_secs(),
            max_secs = self.poll.max.as_secs(),
            concurrency = self.concurrency,
            "Starting control loop"
        );

        while !shutdown.is_cancelled() {
            if let Err(panic) = AssertUnwindSafe(self.poll_once()).catch_unwind().await {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "Poll iteration panicked, continuing"
                );
            }

            let delay = jittered_delay(&self.poll);
            debug!(delay_ms = delay.as_millis() as u64, "Sleeping before next poll");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(
            last_known_host = self.state.last_known_host().unwrap_or("none"),
            "Control loop stopped"
        );
    }
}

/// Uniformly random delay within the configured bounds.
pub fn jittered_delay(poll: &PollConfig) -> Duration {
    let min = poll.min.as_millis() as u64;
    let max = poll.max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min..=max))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
