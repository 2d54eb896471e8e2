//! Resolves the set of workloads a restart wave must touch

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RestartSpec;
use crate::resource::{ResourceKind, ResourceRef};
use crate::workload::{WorkloadApi, WorkloadError};

pub struct ResourceSelector<W> {
    workloads: Arc<W>,
}

impl<W: WorkloadApi> ResourceSelector<W> {
    pub fn new(workloads: Arc<W>) -> Self {
        Self { workloads }
    }

    /// Union of the static entries and every dynamic selector match,
    /// de-duplicated by kind, namespace and name.
    ///
    /// Malformed static entries are dropped with a warning. A failed listing
    /// aborts resolution so the caller can retry the whole wave.
    pub async fn resolve(&self, spec: &RestartSpec) -> Result<BTreeSet<ResourceRef>, WorkloadError> {
        let mut targets = BTreeSet::new();

        let statics = [
            (ResourceKind::Deployment, &spec.deployments),
            (ResourceKind::StatefulSet, &spec.statefulsets),
        ];
        for (kind, entries) in statics {
            for entry in entries {
                match ResourceRef::parse(kind, entry) {
                    Ok(target) => {
                        targets.insert(target);
                    }
                    Err(e) => warn!(error = %e, "Skipping static entry"),
                }
            }
        }

        for selector in &spec.dynamic {
            for namespace in &selector.namespaces {
                let names = self.workloads.list_names(selector.kind, namespace).await?;
                let before = targets.len();

                targets.extend(
                    names
                        .into_iter()
                        .filter(|name| selector.matches(name))
                        .map(|name| ResourceRef::new(selector.kind, namespace.as_str(), name)),
                );

                debug!(
                    kind = %selector.kind,
                    namespace = %namespace,
                    added = targets.len() - before,
                    "Applied dynamic selector"
                );
            }
        }

        Ok(targets)
    }
}
