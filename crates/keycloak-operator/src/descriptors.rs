//! # Keycloak Descriptors
//!
//! Maps a `KeycloakOperator` spec onto the four resources of a Keycloak
//! deployment: data claim, service, passthrough route and deployment config.

use crate::crds::{KeycloakOperator, KeycloakOperatorSpec};
use crate::{INSTANCE_LABEL, MANAGED_BY_LABEL, MANAGER_NAME};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keycloak_reconciler::{
    BuildError, DescriptorBuilder, DesiredState, Readiness, ResourceDescriptor, ResourceKey,
};
use kube::Resource;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const DEFAULT_IMAGE: &str = "jboss/keycloak:nightly-openshift-integration2";

pub const CA_BUNDLE_PATH: &str = "/etc/x509/client/tls.crt";
const DATA_PATH: &str = "/opt/jboss/keycloak/standalone/data";
const SERVER_TLS_VOLUME: &str = "keycloak-server-tls-volume";
const CLIENT_TLS_VOLUME: &str = "keycloak-client-tls-volume";
const HTTP_PORT: i32 = 8080;
const HTTPS_PORT: i32 = 8443;

pub const ROUTE_API_VERSION: &str = "route.openshift.io/v1";
pub const DEPLOYMENT_CONFIG_API_VERSION: &str = "apps.openshift.io/v1";

/// Builds Keycloak descriptors from a desired-state snapshot
#[derive(Debug, Clone)]
pub struct KeycloakDescriptorBuilder {
    default_image: String,
}

impl Default for KeycloakDescriptorBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE)
    }
}

impl KeycloakDescriptorBuilder {
    pub fn new(default_image: impl Into<String>) -> Self {
        Self {
            default_image: default_image.into(),
        }
    }
}

impl DescriptorBuilder for KeycloakDescriptorBuilder {
    fn build(&self, desired: &DesiredState) -> Result<Vec<ResourceDescriptor>, BuildError> {
        let spec: KeycloakOperatorSpec = serde_json::from_value(desired.spec.clone())
            .map_err(|e| BuildError::invalid_spec(e.to_string()))?;
        validate(&spec)?;

        let ctx = BuildContext::new(desired, &spec, &self.default_image);
        let claim = ctx.claim();
        let service = ctx.service()?;
        let route = ctx.route().depends_on(&service.key);
        let deployment = ctx
            .deployment_config()?
            .depends_on(&claim.key)
            .depends_on(&service.key);

        Ok(vec![claim, service, route, deployment])
    }
}

/// Reject specs that could never produce valid resources
pub fn validate(spec: &KeycloakOperatorSpec) -> Result<(), BuildError> {
    if spec.admin_credentials_secret.trim().is_empty() {
        return Err(BuildError::invalid_spec("adminCredentialsSecret must not be empty"));
    }
    if spec.replicas < 0 {
        return Err(BuildError::invalid_spec(format!(
            "replicas must not be negative, got {}",
            spec.replicas
        )));
    }
    if let Some(app_name) = &spec.app_name {
        // Leaves room for the "-data" suffix of the claim
        if !is_dns_label(app_name) || app_name.len() > 58 {
            return Err(BuildError::invalid_spec(format!(
                "appName {app_name:?} must be a lowercase DNS label of at most 58 characters"
            )));
        }
    }
    if spec.image.as_deref().is_some_and(|i| i.trim().is_empty()) {
        return Err(BuildError::invalid_spec("image must not be empty when set"));
    }
    if let Some(host) = &spec.hostname {
        if host.is_empty() || !host.split('.').all(is_dns_label) {
            return Err(BuildError::invalid_spec(format!("hostname {host:?} is not a valid DNS name")));
        }
    }
    if spec.storage.size.trim().is_empty() {
        return Err(BuildError::invalid_spec("storage.size must not be empty"));
    }
    if spec.storage.access_modes.is_empty() {
        return Err(BuildError::invalid_spec("storage.accessModes must not be empty"));
    }
    if spec.tls.server_secret.is_empty() || spec.tls.client_secret.is_empty() {
        return Err(BuildError::invalid_spec("tls secrets must not be empty"));
    }

    let db = &spec.database;
    if db.vendor.is_external() {
        let missing: Vec<&str> = [
            ("database.address", &db.address),
            ("database.database", &db.database),
            ("database.credentialsSecret", &db.credentials_secret),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().map_or(true, |v| v.trim().is_empty()))
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(BuildError::invalid_spec(format!(
                "{} database requires {}",
                db.vendor.as_str(),
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

struct BuildContext<'a> {
    desired: &'a DesiredState,
    spec: &'a KeycloakOperatorSpec,
    app: String,
    image: String,
}

impl<'a> BuildContext<'a> {
    fn new(desired: &'a DesiredState, spec: &'a KeycloakOperatorSpec, default_image: &str) -> Self {
        let app = spec
            .app_name
            .clone()
            .unwrap_or_else(|| desired.identity.name.clone());
        let image = spec.image.clone().unwrap_or_else(|| default_image.to_string());
        Self {
            desired,
            spec,
            app,
            image,
        }
    }

    fn namespace(&self) -> &str {
        &self.desired.identity.namespace
    }

    fn key(&self, api_version: &str, kind: &str, name: &str) -> ResourceKey {
        ResourceKey::new(api_version, kind, self.namespace(), name)
    }

    fn data_claim_name(&self) -> String {
        format!("{}-data", self.app)
    }

    /// Labels on every owned resource
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("application".to_string(), self.app.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string()),
            (INSTANCE_LABEL.to_string(), self.desired.identity.name.clone()),
        ])
    }

    fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("deploymentConfig".to_string(), self.app.clone())])
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: KeycloakOperator::api_version(&()).to_string(),
            kind: KeycloakOperator::kind(&()).to_string(),
            name: self.desired.identity.name.clone(),
            uid: self.desired.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: &str, description: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace().to_string()),
            labels: Some(self.labels()),
            annotations: description
                .map(|d| BTreeMap::from([("description".to_string(), d.to_string())])),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    fn claim(&self) -> ResourceDescriptor {
        let name = self.data_claim_name();
        let storage = &self.spec.storage;
        let mut spec = json!({
            "accessModes": storage.access_modes,
            "resources": {"requests": {"storage": storage.size}},
        });
        if let Some(class) = &storage.storage_class_name {
            spec["storageClassName"] = json!(class);
        }

        let body = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": self.metadata(&name, None),
            "spec": spec,
        });
        ResourceDescriptor::new(self.key("v1", "PersistentVolumeClaim", &name), body)
    }

    fn service(&self) -> Result<ResourceDescriptor, BuildError> {
        let service = Service {
            metadata: self.metadata(&self.app, Some("The web server's https port.")),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port: HTTPS_PORT,
                    target_port: Some(IntOrString::Int(HTTPS_PORT)),
                    ..Default::default()
                }]),
                selector: Some(self.selector()),
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(ResourceDescriptor::new(
            self.key("v1", "Service", &self.app),
            to_body(&service)?,
        ))
    }

    fn route(&self) -> ResourceDescriptor {
        let mut spec = json!({
            "to": {"kind": "Service", "name": self.app},
            "port": {"targetPort": HTTPS_PORT},
            "tls": {"termination": "passthrough"},
        });
        if let Some(host) = &self.spec.hostname {
            spec["host"] = json!(host);
        }

        let body = json!({
            "apiVersion": ROUTE_API_VERSION,
            "kind": "Route",
            "metadata": self.metadata(&self.app, Some("Route for application's https service.")),
            "spec": spec,
        });
        ResourceDescriptor::new(self.key(ROUTE_API_VERSION, "Route", &self.app), body)
    }

    fn deployment_config(&self) -> Result<ResourceDescriptor, BuildError> {
        let mut pod_labels = self.labels();
        pod_labels.extend(self.selector());

        let template = PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some(self.app.clone()),
                labels: Some(pod_labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![self.container()],
                volumes: Some(self.volumes()),
                ..Default::default()
            }),
        };

        let body = json!({
            "apiVersion": DEPLOYMENT_CONFIG_API_VERSION,
            "kind": "DeploymentConfig",
            "metadata": self.metadata(&self.app, None),
            "spec": {
                "replicas": self.spec.replicas,
                "selector": self.selector(),
                "strategy": {"type": "Recreate"},
                "triggers": [{"type": "ConfigChange"}],
                "template": to_body(&template)?,
            },
        });
        Ok(ResourceDescriptor::new(
            self.key(DEPLOYMENT_CONFIG_API_VERSION, "DeploymentConfig", &self.app),
            body,
        )
        .with_readiness(Readiness::ReplicasReady))
    }

    fn container(&self) -> Container {
        Container {
            name: self.app.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.spec.image_pull_policy.as_str().to_string()),
            args: Some(
                ["-Djavax.net.debug=ssl:handshake:verbose", "-b", "0.0.0.0", "--debug"]
                    .map(String::from)
                    .to_vec(),
            ),
            ports: Some(vec![
                ContainerPort {
                    container_port: HTTP_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("https".to_string()),
                    container_port: HTTPS_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            env: Some(self.env()),
            security_context: Some(SecurityContext {
                privileged: Some(false),
                ..Default::default()
            }),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/auth/realms/master".to_string()),
                    port: IntOrString::Int(HTTP_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                timeout_seconds: Some(1),
                failure_threshold: Some(5),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: self.data_claim_name(),
                    mount_path: DATA_PATH.to_string(),
                    read_only: Some(false),
                    ..Default::default()
                },
                VolumeMount {
                    name: SERVER_TLS_VOLUME.to_string(),
                    mount_path: "/etc/x509/https".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
                VolumeMount {
                    name: CLIENT_TLS_VOLUME.to_string(),
                    mount_path: "/etc/x509/client".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    /// Credentials are referenced from secrets, never copied
    fn env(&self) -> Vec<EnvVar> {
        let admin = &self.spec.admin_credentials_secret;
        let mut env = vec![
            secret_env("KEYCLOAK_USER", admin, "username"),
            secret_env("KEYCLOAK_PASSWORD", admin, "password"),
            plain_env("DB_VENDOR", self.spec.database.vendor.as_str()),
            plain_env(
                "PROXY_ADDRESS_FORWARDING",
                &self.spec.proxy_address_forwarding.to_string(),
            ),
            plain_env("KEYCLOAK_LOGLEVEL", self.spec.log_level.as_str()),
            plain_env("X509_CA_BUNDLE", CA_BUNDLE_PATH),
        ];

        let db = &self.spec.database;
        if db.vendor.is_external() {
            if let Some(address) = &db.address {
                env.push(plain_env("DB_ADDR", address));
            }
            if let Some(database) = &db.database {
                env.push(plain_env("DB_DATABASE", database));
            }
            if let Some(secret) = &db.credentials_secret {
                env.push(secret_env("DB_USER", secret, "username"));
                env.push(secret_env("DB_PASSWORD", secret, "password"));
            }
        }
        env
    }

    fn volumes(&self) -> Vec<Volume> {
        vec![
            Volume {
                name: SERVER_TLS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.spec.tls.server_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: CLIENT_TLS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.spec.tls.client_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: self.data_claim_name(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: self.data_claim_name(),
                    read_only: None,
                }),
                ..Default::default()
            },
        ]
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value, BuildError> {
    serde_json::to_value(value).map_err(|e| BuildError::invalid_spec(e.to_string()))
}
