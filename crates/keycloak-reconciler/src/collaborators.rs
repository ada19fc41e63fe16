//! # Collaborator Interfaces
//!
//! Seams between the engine and the hosting platform. The Kubernetes bindings
//! live in the operator crate; in-memory versions live in [`crate::memory`].

use crate::error::{BuildError, StatusError, StoreError};
use crate::types::{
    DesiredState, Identity, ObservedResource, ReconciliationResult, ResourceDescriptor, ResourceKey,
};
use async_trait::async_trait;

/// Pure mapping from a desired state to the resources it needs
pub trait DescriptorBuilder: Send + Sync {
    /// Build descriptors in the order they should be applied.
    ///
    /// Must not perform I/O. Any error is treated as an invalid spec.
    fn build(&self, desired: &DesiredState) -> Result<Vec<ResourceDescriptor>, BuildError>;
}

/// Read and write access to owned resources
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Current state of `key`, or `None` when it does not exist
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, StoreError>;

    /// Create or update the resource and return its new version.
    ///
    /// When `expected_version` is set the write must fail with
    /// [`StoreError::Conflict`] if the stored version differs.
    async fn apply(
        &self,
        descriptor: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Delete the resource. Deleting an absent resource succeeds.
    async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError>;
}

/// Source of desired-state snapshots
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    async fn fetch(&self, identity: &Identity) -> Result<Option<DesiredState>, StoreError>;

    async fn add_finalizer(&self, identity: &Identity, finalizer: &str) -> Result<(), StoreError>;

    async fn remove_finalizer(&self, identity: &Identity, finalizer: &str)
        -> Result<(), StoreError>;
}

/// Sink for reconciliation results
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn write(
        &self,
        identity: &Identity,
        result: &ReconciliationResult,
    ) -> Result<(), StatusError>;
}
