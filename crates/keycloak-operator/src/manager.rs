//! # Operator Manager
//!
//! Wires the Kubernetes stores, the reconciliation engine, the event
//! dispatcher and the health server together and runs them until shutdown.

use crate::cluster::{KubeClusterStore, KubeDesiredStore, KubeStatusReporter};
use crate::config::OperatorConfig;
use crate::controller::EventDispatcher;
use crate::crds::KeycloakOperator;
use crate::descriptors::KeycloakDescriptorBuilder;
use crate::error::{is_not_found, OperatorError};
use crate::health::ControllerHealth;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use keycloak_observability::routes::monitoring_routes;
use keycloak_reconciler::{Controller, Engine, ResourceEvent};
use kube::api::{Api, PostParams};
use kube::{Client, CustomResourceExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Capacity of the channel between the dispatcher and the work queue
const EVENT_BUFFER: usize = 1024;

/// Main operator manager
pub struct OperatorManager {
    config: OperatorConfig,
    client: Client,
}

impl OperatorManager {
    pub async fn new(config: OperatorConfig) -> Result<Self, OperatorError> {
        config.validate()?;
        let client = Client::try_default().await?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> anyhow::Result<()> {
        info!(version = env!("CARGO_PKG_VERSION"), "starting Keycloak operator");
        info!(config = ?self.config, "configuration");

        if self.config.install_crd {
            self.ensure_crd().await?;
        }

        let engine = Engine::builder()
            .desired_store(Arc::new(KubeDesiredStore::new(self.client.clone())))
            .descriptor_builder(Arc::new(KeycloakDescriptorBuilder::new(
                self.config.default_image.clone(),
            )))
            .cluster_store(Arc::new(KubeClusterStore::new(self.client.clone())))
            .status_reporter(Arc::new(KubeStatusReporter::new(self.client.clone())))
            .config(self.config.engine_config())
            .build()?;
        let controller = Arc::new(Controller::new(Arc::new(engine), self.config.controller_config()));

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let dispatcher_alive = Arc::new(AtomicBool::new(true));
        let dispatcher = self.start_dispatcher(events_tx, Arc::clone(&dispatcher_alive));
        let health = self.start_health_server(Arc::new(ControllerHealth::new(
            Arc::clone(&controller),
            dispatcher_alive,
        )));

        controller.run(events_rx, wait_for_shutdown()).await;

        dispatcher.abort();
        health.abort();
        info!("Keycloak operator stopped");
        Ok(())
    }

    fn start_dispatcher(
        &self,
        events: mpsc::Sender<ResourceEvent>,
        alive: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let dispatcher = EventDispatcher::new(
            self.client.clone(),
            self.config.watch_namespace.clone(),
            self.config.resync_interval(),
        );
        tokio::spawn(async move {
            dispatcher.run(events).await;
            alive.store(false, Ordering::Relaxed);
        })
    }

    fn start_health_server(&self, monitor: Arc<ControllerHealth>) -> JoinHandle<()> {
        let addr = self.config.health_addr;
        info!(%addr, "starting health server");

        tokio::spawn(async move {
            let app = monitoring_routes(monitor);
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(%addr, error = %e, "failed to bind health server");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "health server failed");
            }
        })
    }

    /// Create the CRD when the cluster does not know it yet
    async fn ensure_crd(&self) -> Result<(), OperatorError> {
        let crd = KeycloakOperator::crd();
        let name = crd.metadata.name.clone().unwrap_or_default();
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        match crds.get(&name).await {
            Ok(_) => {
                info!(crd = %name, "CRD already installed");
            }
            Err(e) if is_not_found(&e) => {
                info!(crd = %name, "installing CRD");
                crds.create(&PostParams::default(), &crd).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
    }
}
