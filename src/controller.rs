use crate::image_reference::ImageReference;
use crate::store::ImagePatcher;
use crate::workload::{Workload, WorkloadKind, WorkloadRef};
use anyhow::Context;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{Api, Client};
use tracing::info;

const MIN_SUPPORTED_MINOR_VERSION: u32 = 24;

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let api_server_info = client
        .apiserver_version()
        .await
        .context("Failed to detect Kubernetes API server version")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    ensure_supported_version(&api_server_info)?;
    Ok(client)
}

/// Managed offerings report minors such as `27+`, so only the leading digits count.
pub fn ensure_supported_version(info: &Info) -> anyhow::Result<()> {
    let digits: String = info
        .minor
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let minor: u32 = digits
        .parse()
        .with_context(|| format!("Failed to parse Kubernetes minor version '{}'", info.minor))?;

    if minor < MIN_SUPPORTED_MINOR_VERSION {
        anyhow::bail!(
            "Detected unsupported Kubernetes version {}.{}, at least 1.{} is required",
            info.major,
            info.minor,
            MIN_SUPPORTED_MINOR_VERSION
        );
    }
    Ok(())
}

/// Sets container images through the Kubernetes API.
#[derive(Clone)]
pub struct KubePatcher {
    client: Client,
}

impl KubePatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch<K: Workload>(
        &self,
        target: &WorkloadRef,
        image: &ImageReference,
    ) -> anyhow::Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &target.namespace);
        K::patch_container_image(&api, &target.workload_name, &target.container_name, image).await
    }
}

impl ImagePatcher for KubePatcher {
    async fn patch_container_image(
        &self,
        target: &WorkloadRef,
        image: &ImageReference,
    ) -> anyhow::Result<()> {
        match target.kind {
            WorkloadKind::Deployment => self.patch::<Deployment>(target, image).await?,
            WorkloadKind::StatefulSet => self.patch::<StatefulSet>(target, image).await?,
        }
        info!("Changed image of {} to {}", target, image);
        Ok(())
    }
}
