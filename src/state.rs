use crate::workload::WorkloadKind;
use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks whether each workload kind finished its initial sync.
#[derive(Debug, Default)]
pub struct Readiness {
    deployments_synced: AtomicBool,
    stateful_sets_synced: AtomicBool,
}

impl Readiness {
    pub fn mark_synced(&self, kind: WorkloadKind) {
        let flag = match kind {
            WorkloadKind::Deployment => &self.deployments_synced,
            WorkloadKind::StatefulSet => &self.stateful_sets_synced,
        };
        flag.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.deployments_synced.load(Ordering::Acquire)
            && self.stateful_sets_synced.load(Ordering::Acquire)
    }
}
