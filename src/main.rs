use crate::cluster_watch::{NamespaceFilter, WatchSettings};
use crate::controller::KubePatcher;
use crate::event::Event;
use crate::shutdown::Shutdown;
use crate::state::Readiness;
use crate::store::Store;
use anyhow::Context;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod cluster_watch;
mod config;
mod controller;
mod dispatcher;
mod docker;
mod event;
mod image_reference;
mod index;
mod logging;
mod shutdown;
mod state;
mod store;
mod webserver;
mod workload;

static CONFIG_PATH_ENV: &str = "KUBE_FRESHPOD_CONFIG";
static DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;
    logging::init(&config.logging)?;
    info!("Starting kube-freshpod {}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    let cancel = shutdown.token();
    tokio::spawn(async move {
        let reason = shutdown.wait_for_signal().await;
        info!("Received {:?}, shutting down", reason);
    });

    let docker = Arc::new(docker::DockerClient::connect(&config.docker).await?);
    let kube_client = controller::create_client().await?;

    let store = Store::new(KubePatcher::new(kube_client.clone()));
    let readiness = Arc::new(Readiness::default());
    let (tx, rx) = mpsc::channel::<Event>(config.channel_capacity);

    let settings = WatchSettings {
        label_selector: config.watch.label_selector.clone(),
        namespaces: Arc::new(NamespaceFilter::new(&config.watch.exclude_namespaces)?),
    };
    let listeners = vec![
        cluster_watch::spawn_workload_watcher::<Deployment>(
            kube_client.clone(),
            settings.clone(),
            tx.clone(),
            cancel.clone(),
        ),
        cluster_watch::spawn_workload_watcher::<StatefulSet>(
            kube_client,
            settings,
            tx.clone(),
            cancel.clone(),
        ),
        docker::spawn_image_watcher(docker, tx, cancel.clone()),
    ];

    let app = webserver::create_app(readiness.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))?;
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .into_future(),
    );

    let result = dispatcher::run(&store, &readiness, rx, cancel.clone()).await;

    cancel.cancel();
    futures::future::join_all(listeners).await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Webserver stopped with error: {}", e),
        Err(e) => warn!("Webserver task failed: {}", e),
    }

    if let Err(e) = result {
        error!(
            "Image index no longer matches the cluster, exiting so a restart rebuilds it: {:?}",
            e
        );
        return Err(e).context("Reconciliation halted");
    }

    info!("kube-freshpod stopped");
    Ok(())
}
