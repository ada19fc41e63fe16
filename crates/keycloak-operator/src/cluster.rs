//! # Kubernetes Stores
//!
//! Engine collaborators backed by the Kubernetes API: owned resources are
//! handled as dynamic objects, the custom resource through its typed API.

use crate::crds::{KeycloakOperator, KeycloakOperatorStatus};
use crate::error::{classify, classify_status, is_not_found};
use crate::MANAGER_NAME;
use async_trait::async_trait;
use keycloak_reconciler::{
    ClusterStore, DesiredState, DesiredStateStore, Identity, ObservedResource, ReconciliationResult,
    ResourceDescriptor, ResourceKey, StatusError, StatusReporter, StoreError,
};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

/// Split `group/version` (or a bare core `version`) into a GVK
pub fn gvk_for(key: &ResourceKey) -> GroupVersionKind {
    let (group, version) = key
        .api_version
        .split_once('/')
        .unwrap_or(("", key.api_version.as_str()));
    GroupVersionKind::gvk(group, version, &key.kind)
}

/// Owned resources, read and written with server-side apply
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ResourceKey) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&gvk_for(key));
        Api::namespaced_with(self.client.clone(), &key.namespace, &resource)
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, StoreError> {
        let Some(object) = self
            .api(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(&key.to_string(), e))?
        else {
            return Ok(None);
        };

        let version = object.resource_version().unwrap_or_default();
        let body = serde_json::to_value(&object)
            .map_err(|e| StoreError::transient(format!("{key}: {e}")))?;
        Ok(Some(ObservedResource {
            key: key.clone(),
            version,
            body,
        }))
    }

    async fn apply(
        &self,
        descriptor: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, StoreError> {
        let key = &descriptor.key;
        let mut body = descriptor.body.clone();
        if let Some(version) = expected_version {
            // The API server answers 409 when the stored version moved on
            body["metadata"]["resourceVersion"] = json!(version);
        }

        let params = PatchParams::apply(MANAGER_NAME).force();
        let applied = self
            .api(key)
            .patch(&key.name, &params, &Patch::Apply(&body))
            .await
            .map_err(|e| classify(&key.to_string(), e))?;

        debug!(resource = %key, "applied");
        Ok(applied.resource_version().unwrap_or_default())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        match self.api(key).delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(resource = %key, "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(&key.to_string(), e)),
        }
    }
}

/// `KeycloakOperator` objects as desired-state snapshots
#[derive(Clone)]
pub struct KubeDesiredStore {
    client: Client,
}

impl KubeDesiredStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, identity: &Identity) -> Api<KeycloakOperator> {
        Api::namespaced(self.client.clone(), &identity.namespace)
    }

    async fn get(&self, identity: &Identity) -> Result<Option<KeycloakOperator>, StoreError> {
        self.api(identity)
            .get_opt(&identity.name)
            .await
            .map_err(|e| classify(&identity.to_string(), e))
    }

    /// Merge-patch the finalizer list, guarded by the version it was read at
    async fn patch_finalizers(
        &self,
        identity: &Identity,
        object: &KeycloakOperator,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": object.resource_version(),
            }
        });
        match self
            .api(identity)
            .patch(&identity.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(&identity.to_string(), e)),
        }
    }
}

#[async_trait]
impl DesiredStateStore for KubeDesiredStore {
    async fn fetch(&self, identity: &Identity) -> Result<Option<DesiredState>, StoreError> {
        let Some(object) = self.get(identity).await? else {
            return Ok(None);
        };
        object
            .desired_state()
            .map(Some)
            .map_err(|e| StoreError::transient(format!("{identity}: {e}")))
    }

    async fn add_finalizer(&self, identity: &Identity, finalizer: &str) -> Result<(), StoreError> {
        let Some(object) = self.get(identity).await? else {
            return Ok(());
        };
        if object.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let mut finalizers = object.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(identity, &object, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        identity: &Identity,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        let Some(object) = self.get(identity).await? else {
            return Ok(());
        };
        if !object.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let finalizers = object
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(identity, &object, finalizers).await
    }
}

/// Writes results into the `status` subresource of the custom resource
#[derive(Clone)]
pub struct KubeStatusReporter {
    client: Client,
}

impl KubeStatusReporter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusReporter for KubeStatusReporter {
    async fn write(
        &self,
        identity: &Identity,
        result: &ReconciliationResult,
    ) -> Result<(), StatusError> {
        let api: Api<KeycloakOperator> = Api::namespaced(self.client.clone(), &identity.namespace);
        let resource = identity.to_string();

        let Some(mut object) = api
            .get_opt(&identity.name)
            .await
            .map_err(|e| classify_status(&resource, e))?
        else {
            // Gone already; nothing left to report on
            return Ok(());
        };

        object.status = Some(KeycloakOperatorStatus::from_result(object.status.as_ref(), result));
        let body = serde_json::to_vec(&object)
            .map_err(|e| StatusError::Transient(format!("{resource}: {e}")))?;

        match api.replace_status(&identity.name, &PostParams::default(), body).await {
            Ok(_) => {
                debug!(identity = %identity, condition = %result.condition, reason = %result.reason, "status updated");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify_status(&resource, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_for_core_and_grouped_kinds() {
        let service = ResourceKey::new("v1", "Service", "sso", "keycloak");
        let gvk = gvk_for(&service);
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");

        let dc = ResourceKey::new("apps.openshift.io/v1", "DeploymentConfig", "sso", "keycloak");
        let gvk = gvk_for(&dc);
        assert_eq!(gvk.group, "apps.openshift.io");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "DeploymentConfig");
    }

    #[test]
    fn test_api_resource_plurals() {
        let plural = |api_version: &str, kind: &str| {
            ApiResource::from_gvk(&gvk_for(&ResourceKey::new(api_version, kind, "sso", "x"))).plural
        };
        assert_eq!(plural("v1", "PersistentVolumeClaim"), "persistentvolumeclaims");
        assert_eq!(plural("route.openshift.io/v1", "Route"), "routes");
        assert_eq!(plural("apps.openshift.io/v1", "DeploymentConfig"), "deploymentconfigs");
    }
}
