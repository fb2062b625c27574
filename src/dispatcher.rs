use crate::event::{ClusterEvent, Event, RegistryEvent};
use crate::state::Readiness;
use crate::store::{DesyncError, ImagePatcher, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drains the event queue into the store, one event at a time.
///
/// Returns `Ok` on cancellation or once every producer is gone. A [`DesyncError`] stops
/// the loop immediately. An event already being handled when cancellation fires is
/// allowed to finish.
pub async fn run<P: ImagePatcher>(
    store: &Store<P>,
    readiness: &Readiness,
    mut events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) -> Result<(), DesyncError> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Event dispatcher stopping");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    warn!("All event sources closed, event dispatcher stopping");
                    return Ok(());
                }
            },
        };
        handle(store, readiness, event).await?;
    }
}

async fn handle<P: ImagePatcher>(
    store: &Store<P>,
    readiness: &Readiness,
    event: Event,
) -> Result<(), DesyncError> {
    match event {
        Event::Cluster(ClusterEvent::Applied(workload)) => {
            debug!(
                "Applied {} {}/{}",
                workload.kind, workload.namespace, workload.name
            );
            store.apply_workload(&workload).await;
        }
        Event::Cluster(ClusterEvent::Deleted {
            kind,
            namespace,
            name,
        }) => {
            debug!("Removed {} {}/{}", kind, namespace, name);
            store.delete_workload(kind, &namespace, &name).await;
        }
        Event::Cluster(ClusterEvent::Synced { kind, workloads }) => {
            store.resync(kind, &workloads).await;
            readiness.mark_synced(kind);
        }
        Event::Registry(RegistryEvent::NewImage { reference, digest }) => {
            debug!("New docker image {} ({})", reference, digest);
            let migrations = store.new_image(&reference).await?;
            for migration in migrations {
                info!(
                    "Moved {} {} containers from {} to {}",
                    migration.references.len(),
                    migration.kind,
                    migration.from,
                    migration.to
                );
            }
        }
        Event::Registry(RegistryEvent::RemovedImage { name }) => {
            store.removed_image(&name);
        }
    }
    Ok(())
}
