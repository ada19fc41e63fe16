//! # Custom Resource Definitions
//!
//! The `KeycloakOperator` resource describing one Keycloak deployment

use chrono::SecondsFormat;
use keycloak_reconciler::{Condition, DesiredState, Identity, ReconciliationResult};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KeycloakOperator CRD - desired Keycloak deployment
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "keycloak.config.openshift.io",
    version = "v1alpha",
    kind = "KeycloakOperator",
    plural = "keycloakoperators",
    derive = "Default",
    namespaced
)]
#[kube(status = "KeycloakOperatorStatus")]
#[serde(rename_all = "camelCase")]
pub struct KeycloakOperatorSpec {
    /// Name used for owned resources, defaults to the resource name
    pub app_name: Option<String>,

    /// Container image, defaults to the operator's configured image
    pub image: Option<String>,

    #[serde(default)]
    pub image_pull_policy: PullPolicy,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Secret holding the `username` and `password` of the admin user
    pub admin_credentials_secret: String,

    #[serde(default = "default_true")]
    pub proxy_address_forwarding: bool,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub database: DatabaseSpec,

    /// Route host; the router assigns one when unset
    pub hostname: Option<String>,

    #[serde(default)]
    pub storage: StorageSpec,

    #[serde(default)]
    pub tls: TlsSpec,
}

impl Default for KeycloakOperatorSpec {
    fn default() -> Self {
        Self {
            app_name: None,
            image: None,
            image_pull_policy: PullPolicy::default(),
            replicas: default_replicas(),
            admin_credentials_secret: String::new(),
            proxy_address_forwarding: true,
            log_level: LogLevel::default(),
            database: DatabaseSpec::default(),
            hostname: None,
            storage: StorageSpec::default(),
            tls: TlsSpec::default(),
        }
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

/// Pull policy for the Keycloak image
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum PullPolicy {
    #[default]
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Database configuration
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    #[serde(default)]
    pub vendor: DatabaseVendor,

    /// Host (and optional port) of an external database
    pub address: Option<String>,

    /// Database name on the external server
    pub database: Option<String>,

    /// Secret holding `username` and `password` for the external database
    pub credentials_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatabaseVendor {
    /// Embedded database on the data volume
    #[default]
    H2,
    Postgres,
    Mysql,
    Mariadb,
}

impl DatabaseVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseVendor::H2 => "H2",
            DatabaseVendor::Postgres => "POSTGRES",
            DatabaseVendor::Mysql => "MYSQL",
            DatabaseVendor::Mariadb => "MARIADB",
        }
    }

    pub fn is_external(&self) -> bool {
        !matches!(self, DatabaseVendor::H2)
    }
}

/// Storage for the Keycloak data directory
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default = "default_storage_size")]
    pub size: String,

    pub storage_class_name: Option<String>,

    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            access_modes: default_access_modes(),
        }
    }
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

/// Secrets mounted as server and client certificates
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default = "default_server_secret")]
    pub server_secret: String,

    #[serde(default = "default_client_secret")]
    pub client_secret: String,
}

impl Default for TlsSpec {
    fn default() -> Self {
        Self {
            server_secret: default_server_secret(),
            client_secret: default_client_secret(),
        }
    }
}

fn default_server_secret() -> String {
    "keycloak-server-tls".to_string()
}

fn default_client_secret() -> String {
    "keycloak-client-tls".to_string()
}

/// Reported state
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakOperatorStatus {
    /// Generation the status was computed against
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum Phase {
    #[default]
    Pending,
    Progressing,
    Ready,
    Degraded,
}

impl From<Condition> for Phase {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Progressing => Phase::Progressing,
            Condition::Ready => Phase::Ready,
            Condition::Degraded => Phase::Degraded,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: String,

    pub reason: String,

    pub message: String,

    /// RFC 3339 timestamp
    pub last_transition_time: String,
}

pub const READY_CONDITION: &str = "Ready";

impl KeycloakOperatorStatus {
    /// Status after applying a reconciliation result on top of `previous`.
    ///
    /// Conditions other than `Ready` are kept as they are.
    pub fn from_result(previous: Option<&KeycloakOperatorStatus>, result: &ReconciliationResult) -> Self {
        let mut status = previous.cloned().unwrap_or_default();
        status.observed_generation = Some(result.desired_generation);
        status.phase = result.condition.into();

        let condition = StatusCondition {
            type_: READY_CONDITION.to_string(),
            status: match result.condition {
                Condition::Ready => "True",
                Condition::Degraded => "False",
                Condition::Progressing => "Unknown",
            }
            .to_string(),
            reason: result.reason.clone(),
            message: result.message.clone(),
            last_transition_time: result
                .last_transition_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        if let Some(existing) = status.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            *existing = condition;
        } else {
            status.conditions.push(condition);
        }
        status
    }
}

impl KeycloakOperator {
    pub fn identity(&self) -> Option<Identity> {
        Some(Identity::new(self.namespace()?, self.name_any()))
    }

    /// Name given to owned resources
    pub fn app_name(&self) -> String {
        self.spec.app_name.clone().unwrap_or_else(|| self.name_any())
    }

    /// Snapshot handed to the engine
    pub fn desired_state(&self) -> Result<DesiredState, serde_json::Error> {
        let identity = Identity::new(self.namespace().unwrap_or_default(), self.name_any());
        let mut desired = DesiredState::new(
            identity,
            self.metadata.generation.unwrap_or(0),
            serde_json::to_value(&self.spec)?,
        );
        desired.resource_version = self.metadata.resource_version.clone();
        desired.finalizers = self.finalizers().to_vec();
        desired.deletion_timestamp = self.metadata.deletion_timestamp.as_ref().map(|t| t.0);
        desired.uid = self.metadata.uid.clone();
        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_defaults_from_minimal_yaml() {
        let spec: KeycloakOperatorSpec =
            serde_yaml::from_str("adminCredentialsSecret: keycloak-admin").unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.image_pull_policy, PullPolicy::Always);
        assert_eq!(spec.log_level, LogLevel::Info);
        assert_eq!(spec.database.vendor, DatabaseVendor::H2);
        assert!(spec.proxy_address_forwarding);
        assert_eq!(spec.storage.size, "1Gi");
        assert_eq!(spec.storage.access_modes, vec!["ReadWriteOnce"]);
        assert_eq!(spec.tls.server_secret, "keycloak-server-tls");
        assert_eq!(spec.tls.client_secret, "keycloak-client-tls");
    }

    #[test]
    fn test_spec_requires_admin_secret() {
        let err = serde_yaml::from_str::<KeycloakOperatorSpec>("replicas: 2");
        assert!(err.is_err());
    }

    #[test]
    fn test_vendor_and_log_level_spelling() {
        let spec: KeycloakOperatorSpec = serde_yaml::from_str(
            "adminCredentialsSecret: admin\nlogLevel: DEBUG\ndatabase:\n  vendor: POSTGRES\n",
        )
        .unwrap();
        assert_eq!(spec.log_level.as_str(), "DEBUG");
        assert_eq!(spec.database.vendor.as_str(), "POSTGRES");
        assert!(spec.database.vendor.is_external());
    }

    #[test]
    fn test_crd_generation() {
        let crd = KeycloakOperator::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("keycloakoperators.keycloak.config.openshift.io"));
        assert_eq!(crd.spec.group, "keycloak.config.openshift.io");
        assert_eq!(crd.spec.names.kind, "KeycloakOperator");
        assert_eq!(crd.spec.versions[0].name, "v1alpha");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_desired_state_snapshot() {
        let deleted_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cr = KeycloakOperator {
            metadata: ObjectMeta {
                name: Some("keycloak".to_string()),
                namespace: Some("sso".to_string()),
                generation: Some(4),
                resource_version: Some("812".to_string()),
                uid: Some("6c1a".to_string()),
                finalizers: Some(vec!["keycloak.config.openshift.io/finalizer".to_string()]),
                deletion_timestamp: Some(Time(deleted_at)),
                ..Default::default()
            },
            spec: KeycloakOperatorSpec {
                admin_credentials_secret: "admin".to_string(),
                ..Default::default()
            },
            status: None,
        };

        let desired = cr.desired_state().unwrap();
        assert_eq!(desired.identity, Identity::new("sso", "keycloak"));
        assert_eq!(desired.generation, 4);
        assert_eq!(desired.resource_version.as_deref(), Some("812"));
        assert_eq!(desired.uid.as_deref(), Some("6c1a"));
        assert_eq!(desired.deletion_timestamp, Some(deleted_at));
        assert!(desired.has_finalizer("keycloak.config.openshift.io/finalizer"));
        assert_eq!(desired.spec["adminCredentialsSecret"], "admin");
        assert_eq!(cr.app_name(), "keycloak");
    }

    #[test]
    fn test_status_from_result_upserts_ready_condition() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let result = ReconciliationResult {
            desired_generation: 3,
            condition: Condition::Degraded,
            reason: "Rejected".to_string(),
            message: "Route sso/keycloak: invalid host".to_string(),
            last_transition_time: at,
        };
        let previous = KeycloakOperatorStatus {
            observed_generation: Some(2),
            phase: Phase::Ready,
            conditions: vec![
                StatusCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    reason: "Reconciled".to_string(),
                    message: String::new(),
                    last_transition_time: "2024-04-01T00:00:00Z".to_string(),
                },
                StatusCondition {
                    type_: "Custom".to_string(),
                    status: "True".to_string(),
                    reason: "Kept".to_string(),
                    message: String::new(),
                    last_transition_time: "2024-04-01T00:00:00Z".to_string(),
                },
            ],
        };

        let status = KeycloakOperatorStatus::from_result(Some(&previous), &result);
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.phase, Phase::Degraded);
        assert_eq!(status.conditions.len(), 2);
        let ready = &status.conditions[0];
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "Rejected");
        assert_eq!(ready.last_transition_time, "2024-05-01T12:00:00Z");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["conditions"][0]["type"], "Ready");
        assert_eq!(json["observedGeneration"], 3);
    }
}
