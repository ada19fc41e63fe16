//! # Reconciliation Types
//!
//! Identities, descriptors, snapshots and results exchanged between the
//! engine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Namespace and name of a watched custom resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Address of an owned resource in the cluster store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    /// `group/version`, or just `version` for the core group
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// When an in-sync resource counts as converged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Readiness {
    /// Converged as soon as the observed body matches the desired one
    #[default]
    Exists,

    /// Converged once `status.readyReplicas` reaches the desired `spec.replicas`
    ReplicasReady,
}

/// Desired kind, name and body of one owned resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub key: ResourceKey,
    pub body: serde_json::Value,
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceKey>,
    #[serde(default)]
    pub readiness: Readiness,
}

impl ResourceDescriptor {
    pub fn new(key: ResourceKey, body: serde_json::Value) -> Self {
        Self {
            key,
            body,
            depends_on: BTreeSet::new(),
            readiness: Readiness::Exists,
        }
    }

    /// Declare that this resource must only be applied after `key`
    pub fn depends_on(mut self, key: &ResourceKey) -> Self {
        self.depends_on.insert(key.clone());
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }
}

/// Snapshot of the custom resource taken at the start of a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub identity: Identity,
    pub generation: i64,
    pub resource_version: Option<String>,
    /// Opaque to the engine; only the descriptor builder interprets it
    pub spec: serde_json::Value,
    #[serde(default)]
    pub finalizers: Vec<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Owner UID, stamped into owner references by the builder
    pub uid: Option<String>,
}

impl DesiredState {
    pub fn new(identity: Identity, generation: i64, spec: serde_json::Value) -> Self {
        Self {
            identity,
            generation,
            resource_version: None,
            spec,
            finalizers: Vec::new(),
            deletion_timestamp: None,
            uid: None,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Point-in-time read of an owned resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub key: ResourceKey,
    pub version: String,
    pub body: serde_json::Value,
}

/// Condition reported on the custom resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Progressing,
    Ready,
    Degraded,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Progressing => "Progressing",
            Condition::Ready => "Ready",
            Condition::Degraded => "Degraded",
        };
        f.write_str(s)
    }
}

/// Outcome of a pass as written back through the status reporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    /// Generation of the desired state this result was computed against
    pub desired_generation: i64,
    pub condition: Condition,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl ReconciliationResult {
    /// True when both results would render the same status, ignoring timestamps
    pub fn same_state(&self, other: &ReconciliationResult) -> bool {
        self.desired_generation == other.desired_generation
            && self.condition == other.condition
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Kind of notification delivered by the event dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Resynced,
}

/// Structured event: something about `identity` may have changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub identity: Identity,
    pub kind: EventKind,
}

impl ResourceEvent {
    pub fn new(identity: Identity, kind: EventKind) -> Self {
        Self { identity, kind }
    }
}
