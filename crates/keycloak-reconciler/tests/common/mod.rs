#![allow(dead_code)]

use keycloak_reconciler::memory::{InMemoryClusterStore, InMemoryDesiredStore, InMemoryStatusReporter};
use keycloak_reconciler::{
    Backoff, BuildError, DescriptorBuilder, DesiredState, Engine, EngineConfig, Identity, Readiness,
    ResourceDescriptor, ResourceKey,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Builds claim, service, route and workload from `{"replicas": n}`
pub struct StackBuilder;

pub fn claim_key(id: &Identity) -> ResourceKey {
    ResourceKey::new("v1", "PersistentVolumeClaim", &id.namespace, format!("{}-data", id.name))
}

pub fn service_key(id: &Identity) -> ResourceKey {
    ResourceKey::new("v1", "Service", &id.namespace, &id.name)
}

pub fn route_key(id: &Identity) -> ResourceKey {
    ResourceKey::new("route.openshift.io/v1", "Route", &id.namespace, &id.name)
}

pub fn workload_key(id: &Identity) -> ResourceKey {
    ResourceKey::new("apps.openshift.io/v1", "DeploymentConfig", &id.namespace, &id.name)
}

impl DescriptorBuilder for StackBuilder {
    fn build(&self, desired: &DesiredState) -> Result<Vec<ResourceDescriptor>, BuildError> {
        let id = &desired.identity;
        let replicas = desired
            .spec
            .get("replicas")
            .and_then(|r| r.as_i64())
            .filter(|r| *r >= 0)
            .ok_or_else(|| BuildError::invalid_spec("replicas must be a non-negative integer"))?;

        let claim = ResourceDescriptor::new(
            claim_key(id),
            json!({
                "metadata": {"name": format!("{}-data", id.name)},
                "spec": {"accessModes": ["ReadWriteOnce"], "resources": {"requests": {"storage": "1Gi"}}}
            }),
        );
        let service = ResourceDescriptor::new(
            service_key(id),
            json!({"metadata": {"name": id.name}, "spec": {"ports": [{"port": 8443}]}}),
        );
        let route = ResourceDescriptor::new(
            route_key(id),
            json!({"metadata": {"name": id.name}, "spec": {"to": {"kind": "Service", "name": id.name}}}),
        )
        .depends_on(&service.key);
        let workload = ResourceDescriptor::new(
            workload_key(id),
            json!({"metadata": {"name": id.name}, "spec": {"replicas": replicas}}),
        )
        .depends_on(&claim.key)
        .depends_on(&service.key)
        .with_readiness(Readiness::ReplicasReady);

        // Not in dependency order
        Ok(vec![workload, route, service, claim])
    }
}

pub struct Harness {
    pub desired: Arc<InMemoryDesiredStore>,
    pub cluster: Arc<InMemoryClusterStore>,
    pub status: Arc<InMemoryStatusReporter>,
    pub engine: Arc<Engine>,
}

/// Deterministic settings: no jitter, 1s base, 60s cap
pub fn test_config() -> EngineConfig {
    EngineConfig {
        backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0),
        ..Default::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_builder(Arc::new(StackBuilder), config)
    }

    pub fn with_builder(builder: Arc<dyn DescriptorBuilder>, config: EngineConfig) -> Self {
        let desired = Arc::new(InMemoryDesiredStore::new());
        let cluster = Arc::new(InMemoryClusterStore::new());
        let status = Arc::new(InMemoryStatusReporter::new());
        let engine = Engine::builder()
            .desired_store(desired.clone())
            .descriptor_builder(builder)
            .cluster_store(cluster.clone())
            .status_reporter(status.clone())
            .config(config)
            .build()
            .expect("valid engine");
        Self {
            desired,
            cluster,
            status,
            engine: Arc::new(engine),
        }
    }

    pub fn put(&self, id: &Identity, replicas: i64) {
        self.desired
            .put(DesiredState::new(id.clone(), 1, json!({"replicas": replicas})));
    }

    /// Report the workload's replicas as ready, as the platform would
    pub fn mark_ready(&self, id: &Identity, replicas: i64) {
        let changed = self.cluster.mutate(&workload_key(id), |body| {
            body["status"] = json!({"readyReplicas": replicas});
        });
        assert!(changed, "workload must exist before it can become ready");
    }
}

pub fn identity(name: &str) -> Identity {
    Identity::new("sso", name)
}
