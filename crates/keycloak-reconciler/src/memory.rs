//! # In-Memory Collaborators
//!
//! Process-local implementations of the collaborator traits. They mirror the
//! Kubernetes API semantics the engine relies on (monotonic versions,
//! optimistic concurrency, apply without change keeps the version, finalizers
//! gate removal) and support fault injection for tests and local runs.

use crate::collaborators::{ClusterStore, DesiredStateStore, StatusReporter};
use crate::error::{StatusError, StoreError};
use crate::types::{
    DesiredState, Identity, ObservedResource, ReconciliationResult, ResourceDescriptor, ResourceKey,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutation recorded by [`InMemoryClusterStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOperation {
    Create(ResourceKey),
    Update(ResourceKey),
    Delete(ResourceKey),
}

#[derive(Debug, Clone)]
struct StoredObject {
    version: u64,
    body: Value,
}

#[derive(Debug, Default)]
struct ClusterState {
    objects: BTreeMap<ResourceKey, StoredObject>,
    next_version: u64,
    operations: Vec<StoreOperation>,
    apply_faults: HashMap<String, VecDeque<StoreError>>,
    delete_faults: HashMap<String, VecDeque<StoreError>>,
}

impl ClusterState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Cluster store backed by a map of JSON bodies
#[derive(Debug, Default)]
pub struct InMemoryClusterStore {
    state: Mutex<ClusterState>,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` applies of resources of `kind` with `error`
    pub fn fail_applies(&self, kind: &str, count: usize, error: StoreError) {
        let mut state = lock(&self.state);
        let faults = state.apply_faults.entry(kind.to_string()).or_default();
        faults.extend(std::iter::repeat(error).take(count));
    }

    /// Fail the next `count` deletes of resources of `kind` with `error`
    pub fn fail_deletes(&self, kind: &str, count: usize, error: StoreError) {
        let mut state = lock(&self.state);
        let faults = state.delete_faults.entry(kind.to_string()).or_default();
        faults.extend(std::iter::repeat(error).take(count));
    }

    /// Change a stored body the way an external actor would, bumping its version
    pub fn mutate<F>(&self, key: &ResourceKey, change: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        let mut state = lock(&self.state);
        let version = state.bump();
        match state.objects.get_mut(key) {
            Some(object) => {
                change(&mut object.body);
                object.version = version;
                stamp_version(&mut object.body, version);
                true
            }
            None => false,
        }
    }

    /// Insert an object directly, bypassing the mutation log
    pub fn seed(&self, key: ResourceKey, body: Value) {
        let mut state = lock(&self.state);
        let version = state.bump();
        let mut body = body;
        stamp_version(&mut body, version);
        state.objects.insert(key, StoredObject { version, body });
    }

    /// Remove an object directly, bypassing the mutation log
    pub fn evict(&self, key: &ResourceKey) -> bool {
        lock(&self.state).objects.remove(key).is_some()
    }

    pub fn body(&self, key: &ResourceKey) -> Option<Value> {
        lock(&self.state).objects.get(key).map(|o| o.body.clone())
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        lock(&self.state).objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every mutation performed through the [`ClusterStore`] interface
    pub fn operations(&self) -> Vec<StoreOperation> {
        lock(&self.state).operations.clone()
    }
}

fn stamp_version(body: &mut Value, version: u64) {
    if let Value::Object(fields) = body {
        let metadata = fields
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".to_string(), json!(version.to_string()));
        }
    }
}

// Objects merge recursively, everything else is replaced
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, StoreError> {
        let state = lock(&self.state);
        Ok(state.objects.get(key).map(|object| ObservedResource {
            key: key.clone(),
            version: object.version.to_string(),
            body: object.body.clone(),
        }))
    }

    async fn apply(
        &self,
        descriptor: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut state = lock(&self.state);
        let key = &descriptor.key;

        if let Some(error) = state
            .apply_faults
            .get_mut(&key.kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let current = state.objects.get(key).cloned();
        if let Some(expected) = expected_version {
            let actual = current.as_ref().map(|o| o.version.to_string());
            if actual.as_deref() != Some(expected) {
                return Err(StoreError::conflict(
                    key.to_string(),
                    format!("expected version {expected}, found {actual:?}"),
                ));
            }
        }

        match current {
            Some(object) => {
                let mut body = object.body.clone();
                merge(&mut body, &descriptor.body);
                stamp_version(&mut body, object.version);
                if body == object.body {
                    return Ok(object.version.to_string());
                }
                let version = state.bump();
                stamp_version(&mut body, version);
                state.objects.insert(key.clone(), StoredObject { version, body });
                state.operations.push(StoreOperation::Update(key.clone()));
                Ok(version.to_string())
            }
            None => {
                let version = state.bump();
                let mut body = descriptor.body.clone();
                stamp_version(&mut body, version);
                state.objects.insert(key.clone(), StoredObject { version, body });
                state.operations.push(StoreOperation::Create(key.clone()));
                Ok(version.to_string())
            }
        }
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if let Some(error) = state
            .delete_faults
            .get_mut(&key.kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if state.objects.remove(key).is_some() {
            state.operations.push(StoreOperation::Delete(key.clone()));
        }
        Ok(())
    }
}

/// Desired-state store holding custom resource snapshots
#[derive(Debug, Default)]
pub struct InMemoryDesiredStore {
    objects: Mutex<HashMap<Identity, DesiredState>>,
    finalizer_faults: Mutex<VecDeque<StoreError>>,
}

impl InMemoryDesiredStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a desired state; a changed spec bumps the generation
    pub fn put(&self, desired: DesiredState) {
        let mut objects = lock(&self.objects);
        let identity = desired.identity.clone();
        let desired = match objects.get(&identity) {
            Some(existing) if existing.spec != desired.spec => DesiredState {
                generation: existing.generation.max(desired.generation) + 1,
                finalizers: existing.finalizers.clone(),
                ..desired
            },
            Some(existing) => DesiredState {
                generation: existing.generation,
                finalizers: existing.finalizers.clone(),
                ..desired
            },
            None => desired,
        };
        objects.insert(identity, desired);
    }

    /// Request deletion; the object disappears once no finalizer remains
    pub fn delete(&self, identity: &Identity) {
        let mut objects = lock(&self.objects);
        let remove = match objects.get_mut(identity) {
            Some(desired) if desired.finalizers.is_empty() => true,
            Some(desired) => {
                desired.deletion_timestamp.get_or_insert_with(Utc::now);
                false
            }
            None => false,
        };
        if remove {
            objects.remove(identity);
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<DesiredState> {
        lock(&self.objects).get(identity).cloned()
    }

    /// Fail the next `count` finalizer updates, adds and removes alike, with `error`
    pub fn fail_finalizer_updates(&self, count: usize, error: StoreError) {
        lock(&self.finalizer_faults).extend(std::iter::repeat(error).take(count));
    }

    fn injected_fault(&self) -> Result<(), StoreError> {
        match lock(&self.finalizer_faults).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DesiredStateStore for InMemoryDesiredStore {
    async fn fetch(&self, identity: &Identity) -> Result<Option<DesiredState>, StoreError> {
        Ok(self.get(identity))
    }

    async fn add_finalizer(&self, identity: &Identity, finalizer: &str) -> Result<(), StoreError> {
        self.injected_fault()?;
        let mut objects = lock(&self.objects);
        match objects.get_mut(identity) {
            Some(desired) => {
                if !desired.has_finalizer(finalizer) {
                    desired.finalizers.push(finalizer.to_string());
                }
                Ok(())
            }
            None => Err(StoreError::conflict(identity.to_string(), "object no longer exists")),
        }
    }

    async fn remove_finalizer(
        &self,
        identity: &Identity,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        self.injected_fault()?;
        let mut objects = lock(&self.objects);
        let remove = match objects.get_mut(identity) {
            Some(desired) => {
                desired.finalizers.retain(|f| f != finalizer);
                desired.is_deleting() && desired.finalizers.is_empty()
            }
            None => false,
        };
        if remove {
            objects.remove(identity);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StatusState {
    history: Vec<(Identity, ReconciliationResult)>,
    conflicts: usize,
    failures: usize,
}

/// Status reporter that keeps every written result
#[derive(Debug, Default)]
pub struct InMemoryStatusReporter {
    state: Mutex<StatusState>,
}

impl InMemoryStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `count` writes with a conflict
    pub fn fail_with_conflicts(&self, count: usize) {
        lock(&self.state).conflicts += count;
    }

    /// Answer the next `count` writes with a transient failure
    pub fn fail_with_errors(&self, count: usize) {
        lock(&self.state).failures += count;
    }

    pub fn latest(&self, identity: &Identity) -> Option<ReconciliationResult> {
        lock(&self.state)
            .history
            .iter()
            .rev()
            .find(|(id, _)| id == identity)
            .map(|(_, result)| result.clone())
    }

    pub fn history(&self, identity: &Identity) -> Vec<ReconciliationResult> {
        lock(&self.state)
            .history
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, result)| result.clone())
            .collect()
    }
}

#[async_trait]
impl StatusReporter for InMemoryStatusReporter {
    async fn write(
        &self,
        identity: &Identity,
        result: &ReconciliationResult,
    ) -> Result<(), StatusError> {
        let mut state = lock(&self.state);
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(StatusError::Conflict(format!("{identity} status changed")));
        }
        if state.failures > 0 {
            state.failures -= 1;
            return Err(StatusError::Transient("status endpoint unavailable".to_string()));
        }
        state.history.push((identity.clone(), result.clone()));
        Ok(())
    }
}
