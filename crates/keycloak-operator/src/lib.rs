//! # Keycloak Operator
//!
//! Kubernetes operator deploying Keycloak on OpenShift. Each
//! `KeycloakOperator` resource is turned into a data claim, a service, a
//! passthrough route and a deployment config, reconciled by the
//! [`keycloak_reconciler`] engine.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crds;
pub mod descriptors;
pub mod error;
pub mod health;
pub mod manager;

pub use cluster::{KubeClusterStore, KubeDesiredStore, KubeStatusReporter};
pub use config::{ConfigArgs, LogFormat, OperatorConfig};
pub use controller::{EventDispatcher, EventTracker};
pub use crds::{KeycloakOperator, KeycloakOperatorSpec, KeycloakOperatorStatus};
pub use descriptors::KeycloakDescriptorBuilder;
pub use error::OperatorError;
pub use health::ControllerHealth;
pub use manager::OperatorManager;

/// Field manager for server-side apply and value of the managed-by label
pub const MANAGER_NAME: &str = "keycloak-operator";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label naming the `KeycloakOperator` that owns a resource
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
