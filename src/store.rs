use crate::image_reference::ImageReference;
use crate::index::ImageIndex;
use crate::workload::{WorkloadKind, WorkloadRef, WorkloadSnapshot};
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// The cluster mutation API as seen by the reconciler.
pub trait ImagePatcher: Send + Sync {
    fn patch_container_image(
        &self,
        target: &WorkloadRef,
        image: &ImageReference,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// A patch failed part way through a batch; the cluster may now run a mix of old and new
/// builds under a key the index still considers stale.
#[derive(Debug, Error)]
#[error("failed to move {reference} from {stale_image} to {image}")]
pub struct DesyncError {
    pub reference: WorkloadRef,
    pub stale_image: ImageReference,
    pub image: ImageReference,
    #[source]
    pub source: anyhow::Error,
}

/// One stale key that was fully patched and rekeyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub kind: WorkloadKind,
    pub from: ImageReference,
    pub to: ImageReference,
    pub references: Vec<WorkloadRef>,
}

pub struct Store<P> {
    deployments: Mutex<ImageIndex>,
    stateful_sets: Mutex<ImageIndex>,
    reconcile: Mutex<()>,
    patcher: P,
}

impl<P: ImagePatcher> Store<P> {
    pub fn new(patcher: P) -> Self {
        Self {
            deployments: Mutex::new(ImageIndex::new()),
            stateful_sets: Mutex::new(ImageIndex::new()),
            reconcile: Mutex::new(()),
            patcher,
        }
    }

    fn index(&self, kind: WorkloadKind) -> &Mutex<ImageIndex> {
        match kind {
            WorkloadKind::Deployment => &self.deployments,
            WorkloadKind::StatefulSet => &self.stateful_sets,
        }
    }

    /// Indexes a workload that was added or updated.
    pub async fn apply_workload(&self, workload: &WorkloadSnapshot) {
        let mut index = self.index(workload.kind).lock().await;
        index.replace_workload(workload);
        for container in &workload.containers {
            info!(
                "Indexed {} {}/{} container {} with image {}",
                workload.kind,
                workload.namespace,
                workload.name,
                container.container_name,
                container.image
            );
        }
    }

    pub async fn delete_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) {
        let removed = self
            .index(kind)
            .lock()
            .await
            .remove_workload(namespace, name);
        for reference in removed {
            info!("Removed entry {}", reference);
        }
    }

    /// Replaces the index of `kind` with a full listing from the cluster.
    pub async fn resync(&self, kind: WorkloadKind, workloads: &[WorkloadSnapshot]) {
        let mut index = self.index(kind).lock().await;
        index.reset(workloads);
        if index.is_empty() {
            info!("Synchronized {} workloads, none to track", kind);
            return;
        }
        info!(
            "Synchronized {} {} workloads into {} image entries",
            workloads.len(),
            kind,
            index.len()
        );
        for (image, references) in index.iter() {
            debug!("{} is used by {} {} containers", image, references.len(), kind);
        }
    }

    pub fn removed_image(&self, name: &str) {
        info!("Docker image removed: {}", name);
    }

    #[cfg(test)]
    pub async fn snapshot(&self, kind: WorkloadKind) -> ImageIndex {
        self.index(kind).lock().await.clone()
    }

    /// Points every workload that runs another build of `image` at `image`.
    ///
    /// Each stale key is handled as one batch: its references are patched one by one
    /// without holding the index lock, and the key is rekeyed only once every patch
    /// succeeded. The first failure aborts with a [`DesyncError`] and leaves the key as
    /// it was.
    pub async fn new_image(&self, image: &ImageReference) -> Result<Vec<Migration>, DesyncError> {
        let _reconciling = self.reconcile.lock().await;
        info!("Docker image added: {}", image);

        let mut migrations = Vec::new();
        for kind in [WorkloadKind::StatefulSet, WorkloadKind::Deployment] {
            let stale_keys: Vec<ImageReference> = self
                .index(kind)
                .lock()
                .await
                .keys()
                .into_iter()
                .filter(|key| key.is_other_build_of(image))
                .collect();

            for stale in stale_keys {
                info!(
                    "Replacing image {} with {} in {} workloads",
                    stale, image, kind
                );
                let references = self.index(kind).lock().await.references(&stale);

                for reference in &references {
                    debug!("Patching {} to image {}", reference, image);
                    if let Err(source) = self.patcher.patch_container_image(reference, image).await
                    {
                        error!(
                            "Failed to change image of {} from {} to {}: {:?}",
                            reference, stale, image, source
                        );
                        return Err(DesyncError {
                            reference: reference.clone(),
                            stale_image: stale,
                            image: image.clone(),
                            source,
                        });
                    }
                }

                self.index(kind).lock().await.rekey(&stale, image);
                migrations.push(Migration {
                    kind,
                    from: stale,
                    to: image.clone(),
                    references,
                });
            }
        }

        Ok(migrations)
    }
}
