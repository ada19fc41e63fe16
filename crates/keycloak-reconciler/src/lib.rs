//! # Keycloak Reconciler
//!
//! Level-triggered reconciliation core for the Keycloak operator.
//!
//! ## Overview
//!
//! - [`engine`]: converges owned resources towards the desired state and
//!   classifies failures into a condition plus a requeue delay
//! - [`queue`]: deduplicating work queue with single-flight processing
//! - [`controller`]: worker pool and event pump around the engine
//! - [`collaborators`]: traits implemented by the platform bindings
//! - [`memory`]: in-memory collaborators with fault injection
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keycloak_reconciler::memory::{InMemoryClusterStore, InMemoryDesiredStore, InMemoryStatusReporter};
//! use keycloak_reconciler::{
//!     BuildError, Controller, ControllerConfig, DescriptorBuilder, DesiredState, Engine,
//!     ResourceDescriptor,
//! };
//! use futures::FutureExt;
//! use std::sync::Arc;
//!
//! struct NoResources;
//!
//! impl DescriptorBuilder for NoResources {
//!     fn build(&self, _: &DesiredState) -> Result<Vec<ResourceDescriptor>, BuildError> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder()
//!     .desired_store(Arc::new(InMemoryDesiredStore::new()))
//!     .descriptor_builder(Arc::new(NoResources))
//!     .cluster_store(Arc::new(InMemoryClusterStore::new()))
//!     .status_reporter(Arc::new(InMemoryStatusReporter::new()))
//!     .build()?;
//!
//! let controller = Controller::new(Arc::new(engine), ControllerConfig::default());
//! let (_events, receiver) = tokio::sync::mpsc::channel(64);
//! controller.run(receiver, tokio::signal::ctrl_c().map(|_| ())).await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod collaborators;
pub mod compare;
pub mod controller;
pub mod engine;
pub mod error;
pub mod memory;
pub mod order;
pub mod queue;
pub mod types;

pub use backoff::Backoff;
pub use collaborators::{ClusterStore, DescriptorBuilder, DesiredStateStore, StatusReporter};
pub use controller::{Controller, ControllerConfig, StatsSnapshot};
pub use engine::{Engine, EngineBuilder, EngineConfig, IdentityRecord, OwnedResource, ReconcileOutcome, DEFAULT_FINALIZER};
pub use error::{BuildError, ConfigError, ErrorClass, StatusError, StoreError};
pub use queue::{EnqueueReason, WorkItem, WorkQueue, MAX_REQUEUE_DELAY};
pub use types::{
    Condition, DesiredState, EventKind, Identity, ObservedResource, Readiness,
    ReconciliationResult, ResourceDescriptor, ResourceEvent, ResourceKey,
};
