//! Triggers a rolling restart by stamping the pod template
//!
//! The workload controller notices the template change and replaces pods
//! according to its own update strategy; pods are never deleted directly.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::resource::{ResourceRef, RestartOutcome, RestartStatus};
use crate::workload::{WorkloadApi, WorkloadError};

/// Pod-template annotation carrying the restart timestamp
pub const RESTART_ANNOTATION: &str = "last-updated";

pub struct RestartExecutor<W> {
    workloads: Arc<W>,
}

impl<W: WorkloadApi> RestartExecutor<W> {
    pub fn new(workloads: Arc<W>) -> Self {
        Self { workloads }
    }

    /// Restart one workload. Never fails; the outcome records what happened.
    pub async fn restart(&self, target: ResourceRef) -> RestartOutcome {
        let stamp = Utc::now().timestamp().to_string();

        let status = match self
            .workloads
            .stamp_template(&target, RESTART_ANNOTATION, &stamp)
            .await
        {
            Ok(()) => {
                info!(
                    kind = %target.kind,
                    namespace = %target.namespace,
                    name = %target.name,
                    stamp = %stamp,
                    "Restart triggered"
                );
                RestartStatus::Success
            }
            Err(WorkloadError::NotFound) => {
                warn!(
                    kind = %target.kind,
                    namespace = %target.namespace,
                    name = %target.name,
                    "Workload not found, skipping"
                );
                RestartStatus::NotFound
            }
            Err(e) => {
                error!(
                    kind = %target.kind,
                    namespace = %target.namespace,
                    name = %target.name,
                    error = %e,
                    "Restart failed"
                );
                RestartStatus::Failed
            }
        };

        RestartOutcome { target, status }
    }
}

/// Counts of outcomes for one wave
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaveSummary {
    pub succeeded: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl WaveSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a RestartOutcome>) -> Self {
        outcomes
            .into_iter()
            .fold(Self::default(), |mut summary, outcome| {
                match outcome.status {
                    RestartStatus::Success => summary.succeeded += 1,
                    RestartStatus::NotFound => summary.not_found += 1,
                    RestartStatus::Failed => summary.failed += 1,
                }
                summary
            })
    }

    pub fn attempted(&self) -> usize {
        self.succeeded + self.not_found + self.failed
    }
}
