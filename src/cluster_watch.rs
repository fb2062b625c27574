use crate::event::{ClusterEvent, Event};
use crate::workload::{Workload, WorkloadSnapshot};
use anyhow::Context;
use futures::{StreamExt, pin_mut};
use globset::{Glob, GlobSet, GlobSetBuilder};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Namespaces whose workloads are never indexed.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    excluded: GlobSet,
}

impl NamespaceFilter {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid namespace pattern: {}", pattern))?,
            );
        }
        Ok(Self {
            excluded: builder
                .build()
                .context("Failed to build namespace filter")?,
        })
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded.is_match(namespace)
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub label_selector: Option<String>,
    pub namespaces: Arc<NamespaceFilter>,
}

/// Watches every workload of kind `K` across all namespaces and forwards the changes.
pub fn spawn_workload_watcher<K: Workload>(
    client: Client,
    settings: WatchSettings,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<K> = Api::all(client);
        let mut config = watcher::Config::default();
        if let Some(selector) = settings.label_selector.as_deref() {
            config = config.labels(selector);
        }
        info!("Watching {} resources", K::KIND);

        let stream = watcher(api, config).default_backoff();
        pin_mut!(stream);
        let mut translator = EventTranslator::<K>::new(settings.namespaces);

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else {
                warn!("{} watch stream ended", K::KIND);
                break;
            };
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    warn!("{} watch error, retrying: {}", K::KIND, e);
                    continue;
                }
            };
            if let Some(event) = translator.translate(event) {
                if tx.send(event.into()).await.is_err() {
                    break;
                }
            }
        }
        info!("Stopped watching {} resources", K::KIND);
    })
}

/// Turns raw watcher events into [`ClusterEvent`]s, buffering the objects of a
/// (re-)list until it completes.
struct EventTranslator<K> {
    namespaces: Arc<NamespaceFilter>,
    listing: Vec<WorkloadSnapshot>,
    _kind: std::marker::PhantomData<K>,
}

impl<K: Workload> EventTranslator<K> {
    fn new(namespaces: Arc<NamespaceFilter>) -> Self {
        Self {
            namespaces,
            listing: Vec::new(),
            _kind: std::marker::PhantomData,
        }
    }

    fn translate(&mut self, event: watcher::Event<K>) -> Option<ClusterEvent> {
        match event {
            watcher::Event::Init => {
                debug!("{} listing started", K::KIND);
                self.listing.clear();
                None
            }
            watcher::Event::InitApply(workload) => {
                if let Some(snapshot) = self.snapshot(&workload) {
                    self.listing.push(snapshot);
                }
                None
            }
            watcher::Event::InitDone => Some(ClusterEvent::Synced {
                kind: K::KIND,
                workloads: std::mem::take(&mut self.listing),
            }),
            watcher::Event::Apply(workload) => {
                self.snapshot(&workload).map(ClusterEvent::Applied)
            }
            watcher::Event::Delete(workload) => {
                let (Some(namespace), Some(name)) =
                    (workload.namespace(), workload.meta().name.clone())
                else {
                    warn!("Ignoring deleted {} without name or namespace", K::KIND);
                    return None;
                };
                if self.namespaces.is_excluded(&namespace) {
                    return None;
                }
                Some(ClusterEvent::Deleted {
                    kind: K::KIND,
                    namespace,
                    name,
                })
            }
        }
    }

    fn snapshot(&self, workload: &K) -> Option<WorkloadSnapshot> {
        let Some(snapshot) = workload.snapshot() else {
            warn!(
                "Ignoring malformed {} {}",
                K::KIND,
                workload.meta().name.as_deref().unwrap_or("<unnamed>")
            );
            return None;
        };
        if self.namespaces.is_excluded(&snapshot.namespace) {
            debug!(
                "Skipping {} {}/{} in excluded namespace",
                K::KIND,
                snapshot.namespace,
                snapshot.name
            );
            return None;
        }
        Some(snapshot)
    }
}
