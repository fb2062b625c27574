use crate::image_reference::ImageReference;
use crate::workload::{WorkloadRef, WorkloadSnapshot};
use std::collections::BTreeMap;
use tracing::debug;

/// Maps an image reference to the container slots currently declared to run it.
///
/// A [`WorkloadRef`] lives under at most one key. Keys are dropped as soon as their
/// reference list becomes empty, except through [`ImageIndex::rekey`] which always
/// leaves the target key in place.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageIndex {
    entries: BTreeMap<ImageReference, Vec<WorkloadRef>>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `reference` under `image`. A reference already filed under `image` is left
    /// where it is; one filed under another key is moved.
    pub fn put(&mut self, image: ImageReference, reference: WorkloadRef) {
        if self
            .entries
            .get(&image)
            .is_some_and(|references| references.contains(&reference))
        {
            debug!("Entry {} already indexed under {}", reference, image);
            return;
        }

        self.detach(&reference);
        let references = self.entries.entry(image).or_default();
        debug!(
            "Indexed {} (previous list size {})",
            reference,
            references.len()
        );
        references.push(reference);
    }

    /// Removes every container slot of the workload `namespace/workload_name`.
    /// Returns the removed references.
    pub fn remove_workload(&mut self, namespace: &str, workload_name: &str) -> Vec<WorkloadRef> {
        let mut removed = Vec::new();
        self.entries.retain(|_, references| {
            references.retain(|reference| {
                if reference.belongs_to(namespace, workload_name) {
                    removed.push(reference.clone());
                    false
                } else {
                    true
                }
            });
            !references.is_empty()
        });
        removed
    }

    /// Replaces everything known about one workload with its current containers.
    pub fn replace_workload(&mut self, snapshot: &WorkloadSnapshot) {
        self.remove_workload(&snapshot.namespace, &snapshot.name);
        for (image, reference) in snapshot.references() {
            self.put(image, reference);
        }
    }

    /// Rebuilds the whole index from a full listing.
    pub fn reset<'a>(&mut self, snapshots: impl IntoIterator<Item = &'a WorkloadSnapshot>) {
        self.entries.clear();
        for snapshot in snapshots {
            for (image, reference) in snapshot.references() {
                self.put(image, reference);
            }
        }
    }

    pub fn keys(&self) -> Vec<ImageReference> {
        self.entries.keys().cloned().collect()
    }

    pub fn references(&self, image: &ImageReference) -> Vec<WorkloadRef> {
        self.entries.get(image).cloned().unwrap_or_default()
    }

    /// Moves every reference under `from` to `to`, after the ones `to` already holds,
    /// and deletes `from`.
    pub fn rekey(&mut self, from: &ImageReference, to: &ImageReference) {
        if from == to {
            return;
        }
        let Some(moved) = self.entries.remove(from) else {
            return;
        };
        let target = self.entries.entry(to.clone()).or_default();
        for reference in moved {
            if !target.contains(&reference) {
                target.push(reference);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ImageReference, &Vec<WorkloadRef>)> {
        self.entries.iter()
    }

    fn detach(&mut self, reference: &WorkloadRef) {
        self.entries.retain(|_, references| {
            references.retain(|r| r != reference);
            !references.is_empty()
        });
    }
}
