use crate::image_reference::ImageReference;
use anyhow::Context;
use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use tracing::{debug, warn};

static KUBE_FRESHPOD_ANNOTATION: &str = "kube-freshpod/imageUpdatedAt";
static KUBE_FRESHPOD_FIELD_MANAGER: &str = "kube-freshpod";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::StatefulSet => write!(f, "StatefulSet"),
        }
    }
}

/// One container slot inside one workload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub workload_name: String,
    pub container_name: String,
}

impl WorkloadRef {
    pub fn new(
        kind: WorkloadKind,
        namespace: impl Into<String>,
        workload_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            workload_name: workload_name.into(),
            container_name: container_name.into(),
        }
    }

    pub fn belongs_to(&self, namespace: &str, workload_name: &str) -> bool {
        self.namespace == namespace && self.workload_name == workload_name
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}[{}]",
            self.kind, self.namespace, self.workload_name, self.container_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub container_name: String,
    pub image: ImageReference,
}

/// What the index needs to know about a workload, detached from the Kubernetes types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    pub containers: Vec<ContainerImage>,
}

impl WorkloadSnapshot {
    pub fn references(&self) -> impl Iterator<Item = (ImageReference, WorkloadRef)> + '_ {
        self.containers.iter().map(|container| {
            (
                container.image.clone(),
                WorkloadRef::new(
                    self.kind,
                    &self.namespace,
                    &self.name,
                    &container.container_name,
                ),
            )
        })
    }
}

pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn pod_spec(&self) -> Option<&PodSpec>;

    /// Returns `None` when the object lacks a name, a namespace or a pod template.
    fn snapshot(&self) -> Option<WorkloadSnapshot> {
        let name = self.meta().name.clone()?;
        let namespace = self.namespace()?;
        let pod_spec = self.pod_spec()?;

        let containers = pod_spec
            .containers
            .iter()
            .filter_map(|container| {
                let image = container.image.as_deref().unwrap_or_default();
                match ImageReference::parse(image) {
                    Ok(image) => Some(ContainerImage {
                        container_name: container.name.clone(),
                        image,
                    }),
                    Err(e) => {
                        warn!(
                            "Ignoring container {} of {} {}/{}: {}",
                            container.name,
                            Self::KIND,
                            namespace,
                            name,
                            e
                        );
                        None
                    }
                }
            })
            .collect();

        Some(WorkloadSnapshot {
            kind: Self::KIND,
            namespace,
            name,
            containers,
        })
    }

    fn patch_container_image(
        api: &Api<Self>,
        resource_name: &str,
        container_name: &str,
        image: &ImageReference,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async move {
            // Strategic merge matches containers by name, leaving the others untouched.
            let patch = json!({
                "metadata": {
                    "annotations": {
                        KUBE_FRESHPOD_ANNOTATION: Utc::now().to_rfc3339(),
                    }
                },
                "spec": {
                    "template": {
                        "spec": {
                            "containers": [
                                {
                                    "name": container_name,
                                    "image": image.as_str(),
                                }
                            ]
                        }
                    }
                }
            });

            debug!(
                "Patching {} {} with patch {:?}",
                Self::KIND,
                resource_name,
                patch
            );
            api.patch(
                resource_name,
                &PatchParams::apply(KUBE_FRESHPOD_FIELD_MANAGER),
                &Patch::Strategic(&patch),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to patch container {} of {} {} to image {}",
                    container_name,
                    Self::KIND,
                    resource_name,
                    image
                )
            })?;
            Ok(())
        }
    }
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}
