use crate::image_reference::ImageReference;
use crate::workload::{WorkloadKind, WorkloadSnapshot};

/// Everything the listeners hand over to the dispatcher.
#[derive(Debug, Clone)]
pub enum Event {
    Cluster(ClusterEvent),
    Registry(RegistryEvent),
}

#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A workload was created or its spec changed.
    Applied(WorkloadSnapshot),
    Deleted {
        kind: WorkloadKind,
        namespace: String,
        name: String,
    },
    /// Full listing of one kind, sent after the initial sync and after every re-list.
    Synced {
        kind: WorkloadKind,
        workloads: Vec<WorkloadSnapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    NewImage {
        reference: ImageReference,
        digest: String,
    },
    RemovedImage {
        name: String,
    },
}

impl From<ClusterEvent> for Event {
    fn from(event: ClusterEvent) -> Self {
        Event::Cluster(event)
    }
}

impl From<RegistryEvent> for Event {
    fn from(event: RegistryEvent) -> Self {
        Event::Registry(event)
    }
}
