//! # Reconciliation Engine
//!
//! One pass converges the owned resources of an identity towards its desired
//! state: fetch desired, build ordered descriptors, compare each against the
//! observed resource, create/update/no-op, aggregate a condition and report
//! it. Store errors are classified here; only a [`ReconcileOutcome`] leaves
//! the engine.

use crate::backoff::Backoff;
use crate::collaborators::{ClusterStore, DescriptorBuilder, DesiredStateStore, StatusReporter};
use crate::compare;
use crate::error::{BuildError, ConfigError, ErrorClass, StatusError, StoreError};
use crate::order::dependency_order;
use crate::types::{
    Condition, DesiredState, Identity, ReconciliationResult, ResourceDescriptor, ResourceKey,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default finalizer guarding owned-resource cleanup
pub const DEFAULT_FINALIZER: &str = "keycloak.config.openshift.io/finalizer";

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Finalizer placed on the custom resource before anything is applied
    pub finalizer: String,

    /// Requeue delays after transient failures
    pub backoff: Backoff,

    /// Consecutive failures after which the condition turns Degraded
    pub degraded_after_failures: u32,

    /// Requeue delay after the cluster rejected a body
    pub rejected_retry_delay: Duration,

    /// Requeue delay after a pass that changed the cluster or is still waiting
    pub settle_interval: Duration,

    /// Re-reads of one descriptor after version conflicts within a pass
    pub max_conflict_retries: u32,

    /// Status writes attempted per pass when the reporter sees conflicts
    pub max_status_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            finalizer: DEFAULT_FINALIZER.to_string(),
            backoff: Backoff::default(),
            degraded_after_failures: 3,
            rejected_retry_delay: Duration::from_secs(300),
            settle_interval: Duration::from_secs(5),
            max_conflict_retries: 3,
            max_status_attempts: 3,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.finalizer.trim().is_empty() {
            return Err(ConfigError::invalid("finalizer", "must not be empty"));
        }
        if self.backoff.base.is_zero() {
            return Err(ConfigError::invalid("backoff.base", "must be greater than zero"));
        }
        if self.backoff.max < self.backoff.base {
            return Err(ConfigError::invalid(
                "backoff.max",
                "must not be smaller than backoff.base",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::invalid("backoff.jitter", "must be within [0, 1]"));
        }
        if self.degraded_after_failures == 0 {
            return Err(ConfigError::invalid("degraded_after_failures", "must be at least 1"));
        }
        if self.max_status_attempts == 0 {
            return Err(ConfigError::invalid("max_status_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// What a pass produced and when the identity should run again
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Result of the pass; `None` when nothing is left to report on
    pub result: Option<ReconciliationResult>,
    /// `None` means wait for the next event
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn done(result: Option<ReconciliationResult>) -> Self {
        Self {
            result,
            requeue_after: None,
        }
    }

    fn retry(result: Option<ReconciliationResult>, after: Duration) -> Self {
        Self {
            result,
            requeue_after: Some(after),
        }
    }

    pub fn condition(&self) -> Option<Condition> {
        self.result.as_ref().map(|r| r.condition)
    }
}

/// An owned resource as last seen or written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedResource {
    /// Index in dependency order when last applied
    pub position: usize,
    pub version: String,
}

/// Per-identity state kept between passes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityRecord {
    pub owned: BTreeMap<ResourceKey, OwnedResource>,
    pub consecutive_failures: u32,
    pub last_result: Option<ReconciliationResult>,
    /// Generation whose spec failed to build
    pub invalid_generation: Option<i64>,
}

impl IdentityRecord {
    /// Owned keys, most dependent first
    pub fn teardown_order(&self) -> Vec<ResourceKey> {
        let mut owned: Vec<(&ResourceKey, usize)> =
            self.owned.iter().map(|(key, o)| (key, o.position)).collect();
        owned.sort_by(|a, b| b.1.cmp(&a.1));
        owned.into_iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn version(&self, key: &ResourceKey) -> Option<&str> {
        self.owned.get(key).map(|o| o.version.as_str())
    }

    /// Identity whose last reported condition is Degraded
    pub fn is_degraded(&self) -> bool {
        self.last_result
            .as_ref()
            .is_some_and(|r| r.condition == Condition::Degraded)
    }
}

#[derive(Debug, Default)]
struct RecordBook {
    records: Mutex<HashMap<Identity, IdentityRecord>>,
}

impl RecordBook {
    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, IdentityRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, identity: &Identity) -> IdentityRecord {
        self.lock().get(identity).cloned().unwrap_or_default()
    }

    fn update<R>(&self, identity: &Identity, f: impl FnOnce(&mut IdentityRecord) -> R) -> R {
        let mut records = self.lock();
        f(records.entry(identity.clone()).or_default())
    }

    fn forget(&self, identity: &Identity) {
        self.lock().remove(identity);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn count(&self, f: impl Fn(&IdentityRecord) -> bool) -> usize {
        self.lock().values().filter(|r| f(r)).count()
    }
}

/// How one descriptor ended up in this pass
#[derive(Debug, Clone, PartialEq)]
enum DescriptorState {
    InSync,
    Waiting(String),
    Created,
    Updated { drift: bool },
}

#[derive(Debug, Clone, Copy)]
enum FinalizerChange {
    Add,
    Remove,
}

enum Verdict {
    Converged { resources: usize },
    Converging { reason: &'static str, message: String },
    Failed { resource: Option<String>, error: StoreError },
    Invalid(BuildError),
}

/// The reconciliation engine
pub struct Engine {
    desired: Arc<dyn DesiredStateStore>,
    builder: Arc<dyn DescriptorBuilder>,
    cluster: Arc<dyn ClusterStore>,
    status: Arc<dyn StatusReporter>,
    config: EngineConfig,
    records: RecordBook,
}

impl Engine {
    pub fn new(
        desired: Arc<dyn DesiredStateStore>,
        builder: Arc<dyn DescriptorBuilder>,
        cluster: Arc<dyn ClusterStore>,
        status: Arc<dyn StatusReporter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            desired,
            builder,
            cluster,
            status,
            config,
            records: RecordBook::default(),
        }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State kept for `identity`, if any
    pub fn record(&self, identity: &Identity) -> Option<IdentityRecord> {
        self.records.lock().get(identity).cloned()
    }

    /// Number of identities with a live record
    pub fn tracked_identities(&self) -> usize {
        self.records.len()
    }

    /// Identities whose last reported condition is Degraded
    pub fn degraded_identities(&self) -> usize {
        self.records.count(IdentityRecord::is_degraded)
    }

    /// Count a failure that happened outside a pass (timeout, panic) and
    /// return the backoff before the next attempt
    pub fn record_failure(&self, identity: &Identity) -> Duration {
        let failures = self.records.update(identity, |r| {
            r.consecutive_failures = r.consecutive_failures.saturating_add(1);
            r.consecutive_failures
        });
        self.config.backoff.delay(failures)
    }

    /// Run one reconciliation pass for `identity`
    pub async fn reconcile(&self, identity: &Identity) -> ReconcileOutcome {
        let span = info_span!("reconcile", identity = %identity, pass = %Uuid::new_v4());
        self.run_pass(identity).instrument(span).await
    }

    async fn run_pass(&self, identity: &Identity) -> ReconcileOutcome {
        let desired = match self.desired.fetch(identity).await {
            Ok(Some(desired)) => desired,
            Ok(None) => return self.release(identity).await,
            Err(error) => {
                let delay = self.record_failure(identity);
                warn!(error = %error, delay_ms = delay.as_millis() as u64, "failed to fetch desired state");
                return ReconcileOutcome::retry(None, delay);
            }
        };

        if desired.is_deleting() {
            return self.teardown(&desired).await;
        }
        self.converge(&desired).await
    }

    /// The custom resource is gone: remove whatever we still know we own
    async fn release(&self, identity: &Identity) -> ReconcileOutcome {
        let owned = self.records.snapshot(identity).teardown_order();

        for key in &owned {
            if let Err(error) = self.cluster.delete(key).await {
                let delay = self.record_failure(identity);
                warn!(resource = %key, error = %error, "failed to remove orphaned resource");
                return ReconcileOutcome::retry(None, delay);
            }
            self.records.update(identity, |r| r.owned.remove(key));
        }

        if !owned.is_empty() {
            info!(resources = owned.len(), "removed resources of deleted identity");
        }
        self.records.forget(identity);
        ReconcileOutcome::done(None)
    }

    async fn teardown(&self, desired: &DesiredState) -> ReconcileOutcome {
        let identity = &desired.identity;
        if !desired.has_finalizer(&self.config.finalizer) {
            debug!("deletion in progress without our finalizer; nothing to do");
            self.records.forget(identity);
            return ReconcileOutcome::done(None);
        }

        let owned = self.owned_keys(desired);
        info!(resources = owned.len(), "tearing down owned resources");
        for key in &owned {
            if let Err(error) = self.cluster.delete(key).await {
                return self
                    .finish(
                        desired,
                        Verdict::Failed {
                            resource: Some(key.to_string()),
                            error,
                        },
                    )
                    .await;
            }
            debug!(resource = %key, "deleted");
            self.records.update(identity, |r| r.owned.remove(key));
        }

        if let Err(error) = self.update_finalizer(identity, FinalizerChange::Remove).await {
            return self.finish(desired, Verdict::Failed { resource: None, error }).await;
        }

        info!("teardown complete; finalizer removed");
        self.records.forget(identity);
        ReconcileOutcome::done(None)
    }

    /// Owned resources, most dependent first
    fn owned_keys(&self, desired: &DesiredState) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = match self.build(desired) {
            Ok(descriptors) => descriptors.into_iter().rev().map(|d| d.key).collect(),
            Err(error) => {
                debug!(error = %error, "spec does not build; falling back to recorded resources");
                Vec::new()
            }
        };

        let extra: Vec<ResourceKey> = self
            .records
            .snapshot(&desired.identity)
            .teardown_order()
            .into_iter()
            .filter(|key| !keys.contains(key))
            .collect();
        keys.splice(0..0, extra);
        keys
    }

    fn build(&self, desired: &DesiredState) -> Result<Vec<ResourceDescriptor>, BuildError> {
        self.builder.build(desired).and_then(dependency_order)
    }

    async fn converge(&self, desired: &DesiredState) -> ReconcileOutcome {
        let identity = &desired.identity;
        let record = self.records.snapshot(identity);
        if record.invalid_generation == Some(desired.generation) {
            debug!(
                generation = desired.generation,
                "spec already rejected for this generation; waiting for a change"
            );
            return ReconcileOutcome::done(record.last_result);
        }

        if !desired.has_finalizer(&self.config.finalizer) {
            if let Err(error) = self.update_finalizer(identity, FinalizerChange::Add).await {
                return self.finish(desired, Verdict::Failed { resource: None, error }).await;
            }
            debug!(finalizer = %self.config.finalizer, "finalizer added");
        }

        let descriptors = match self.build(desired) {
            Ok(descriptors) => descriptors,
            Err(error) => return self.finish(desired, Verdict::Invalid(error)).await,
        };

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut waiting = Vec::new();
        for (position, descriptor) in descriptors.iter().enumerate() {
            match self.converge_descriptor(identity, position, descriptor).await {
                Ok(DescriptorState::InSync) => {}
                Ok(DescriptorState::Waiting(detail)) => waiting.push(detail),
                Ok(DescriptorState::Created) => created += 1,
                Ok(DescriptorState::Updated { .. }) => updated += 1,
                Err(error) => {
                    warn!(resource = %descriptor.key, error = %error, "descriptor failed; skipping the rest of the pass");
                    let verdict = Verdict::Failed {
                        resource: Some(descriptor.key.to_string()),
                        error,
                    };
                    return self.finish(desired, verdict).await;
                }
            }
        }

        let verdict = if created + updated > 0 {
            Verdict::Converging {
                reason: if created > 0 { "Creating" } else { "Updating" },
                message: format!("created {created}, updated {updated} of {} resources", descriptors.len()),
            }
        } else if !waiting.is_empty() {
            Verdict::Converging {
                reason: "WaitingForReadiness",
                message: waiting.join("; "),
            }
        } else {
            Verdict::Converged {
                resources: descriptors.len(),
            }
        };
        self.finish(desired, verdict).await
    }

    /// Add or remove our finalizer, re-reading the custom resource after conflicts
    async fn update_finalizer(
        &self,
        identity: &Identity,
        change: FinalizerChange,
    ) -> Result<(), StoreError> {
        let finalizer = self.config.finalizer.as_str();
        let mut conflicts = 0u32;
        loop {
            let result = match change {
                FinalizerChange::Add => self.desired.add_finalizer(identity, finalizer).await,
                FinalizerChange::Remove => self.desired.remove_finalizer(identity, finalizer).await,
            };
            match result {
                Err(StoreError::Conflict { resource, message }) => {
                    if conflicts >= self.config.max_conflict_retries {
                        return Err(StoreError::transient(format!(
                            "{resource} kept changing after {conflicts} re-reads: {message}"
                        )));
                    }
                    conflicts += 1;
                    debug!(?change, attempt = conflicts, "finalizer conflict; re-reading");
                }
                other => return other,
            }
        }
    }

    /// Converge one descriptor, re-reading after version conflicts
    async fn converge_descriptor(
        &self,
        identity: &Identity,
        position: usize,
        descriptor: &ResourceDescriptor,
    ) -> Result<DescriptorState, StoreError> {
        let mut conflicts = 0u32;
        loop {
            match self.converge_once(identity, position, descriptor).await {
                Err(StoreError::Conflict { resource, message }) => {
                    if conflicts >= self.config.max_conflict_retries {
                        return Err(StoreError::transient(format!(
                            "{resource} kept changing after {conflicts} re-reads: {message}"
                        )));
                    }
                    conflicts += 1;
                    debug!(resource = %resource, attempt = conflicts, "version conflict; re-reading");
                }
                other => return other,
            }
        }
    }

    async fn converge_once(
        &self,
        identity: &Identity,
        position: usize,
        descriptor: &ResourceDescriptor,
    ) -> Result<DescriptorState, StoreError> {
        let key = &descriptor.key;
        let recorded = self
            .records
            .update(identity, |r| r.version(key).map(str::to_string));

        let Some(observed) = self.cluster.get(key).await? else {
            if recorded.is_some() {
                info!(resource = %key, "owned resource disappeared; recreating");
            }
            let version = self.cluster.apply(descriptor, None).await?;
            info!(resource = %key, version = %version, "created");
            self.remember(identity, key, position, version);
            return Ok(DescriptorState::Created);
        };

        let drift = recorded.as_deref().is_some_and(|v| v != observed.version);
        if compare::semantically_equal(&descriptor.body, &observed.body) {
            if drift {
                debug!(resource = %key, "only server-managed fields changed; adopting version");
            }
            self.remember(identity, key, position, observed.version.clone());
            return Ok(match compare::pending_readiness(descriptor, &observed.body) {
                Some(detail) => DescriptorState::Waiting(detail),
                None => DescriptorState::InSync,
            });
        }

        if drift {
            info!(resource = %key, "external change detected; restoring desired state");
        } else {
            info!(resource = %key, "desired state changed; updating");
        }
        let version = self.cluster.apply(descriptor, Some(&observed.version)).await?;
        self.remember(identity, key, position, version);
        Ok(DescriptorState::Updated { drift })
    }

    fn remember(&self, identity: &Identity, key: &ResourceKey, position: usize, version: String) {
        self.records.update(identity, |r| {
            r.owned.insert(key.clone(), OwnedResource { position, version });
        });
    }

    /// Turn a verdict into a result, report it and pick the next requeue
    async fn finish(&self, desired: &DesiredState, verdict: Verdict) -> ReconcileOutcome {
        let identity = &desired.identity;
        let (condition, reason, message, requeue_after) = match verdict {
            Verdict::Converged { resources } => {
                self.records.update(identity, |r| {
                    r.consecutive_failures = 0;
                    r.invalid_generation = None;
                });
                (
                    Condition::Ready,
                    "Reconciled".to_string(),
                    format!("all {resources} resources in sync"),
                    None,
                )
            }
            Verdict::Converging { reason, message } => {
                self.records.update(identity, |r| {
                    r.consecutive_failures = 0;
                    r.invalid_generation = None;
                });
                (
                    Condition::Progressing,
                    reason.to_string(),
                    message,
                    Some(self.config.settle_interval),
                )
            }
            Verdict::Invalid(error) => {
                warn!(error = %error, generation = desired.generation, "invalid spec; not requeuing");
                self.records.update(identity, |r| {
                    r.invalid_generation = Some(desired.generation);
                });
                (Condition::Degraded, "InvalidSpec".to_string(), error.to_string(), None)
            }
            Verdict::Failed { resource, error } => {
                let failures = self.records.update(identity, |r| {
                    r.consecutive_failures = r.consecutive_failures.saturating_add(1);
                    r.consecutive_failures
                });
                let message = match resource {
                    Some(resource) => format!("{resource}: {error}"),
                    None => error.to_string(),
                };
                match error.class() {
                    ErrorClass::Rejected => {
                        warn!(error = %error, "cluster rejected desired state");
                        (
                            Condition::Degraded,
                            "Rejected".to_string(),
                            message,
                            Some(self.config.rejected_retry_delay),
                        )
                    }
                    _ => {
                        let delay = self.config.backoff.delay(failures);
                        let escalated = failures >= self.config.degraded_after_failures;
                        warn!(
                            error = %error,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            escalated,
                            "transient failure; retrying with backoff"
                        );
                        let (condition, reason) = if escalated {
                            (Condition::Degraded, "RetryThresholdExceeded")
                        } else {
                            (Condition::Progressing, "TransientFailure")
                        };
                        (condition, reason.to_string(), message, Some(delay))
                    }
                }
            }
        };

        let previous = self.records.snapshot(identity).last_result;
        let last_transition_time = match &previous {
            Some(previous) if previous.condition == condition => previous.last_transition_time,
            _ => Utc::now(),
        };
        let result = ReconciliationResult {
            desired_generation: desired.generation,
            condition,
            reason,
            message,
            last_transition_time,
        };

        if previous.as_ref().is_some_and(|p| p.same_state(&result)) {
            debug!(condition = %result.condition, "status unchanged; skipping write");
            return ReconcileOutcome {
                result: Some(result),
                requeue_after,
            };
        }

        match self.write_status(identity, &result).await {
            Ok(()) => {
                self.records
                    .update(identity, |r| r.last_result = Some(result.clone()));
                info!(condition = %result.condition, reason = %result.reason, "status reported");
                ReconcileOutcome {
                    result: Some(result),
                    requeue_after,
                }
            }
            Err(error) => {
                let delay = self.record_failure(identity);
                warn!(error = %error, "failed to report status");
                let requeue_after = Some(requeue_after.map_or(delay, |d| d.min(delay)));
                ReconcileOutcome {
                    result: Some(result),
                    requeue_after,
                }
            }
        }
    }

    async fn write_status(
        &self,
        identity: &Identity,
        result: &ReconciliationResult,
    ) -> Result<(), StatusError> {
        let mut attempt = 1;
        loop {
            match self.status.write(identity, result).await {
                Err(StatusError::Conflict(message)) if attempt < self.config.max_status_attempts => {
                    debug!(attempt, message = %message, "status conflict; retrying with a fresh read");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    desired: Option<Arc<dyn DesiredStateStore>>,
    builder: Option<Arc<dyn DescriptorBuilder>>,
    cluster: Option<Arc<dyn ClusterStore>>,
    status: Option<Arc<dyn StatusReporter>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired_store(mut self, store: Arc<dyn DesiredStateStore>) -> Self {
        self.desired = Some(store);
        self
    }

    pub fn descriptor_builder(mut self, builder: Arc<dyn DescriptorBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn cluster_store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.cluster = Some(store);
        self
    }

    pub fn status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status = Some(reporter);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        Ok(Engine::new(
            self.desired.ok_or(ConfigError::Missing("desired state store"))?,
            self.builder.ok_or(ConfigError::Missing("descriptor builder"))?,
            self.cluster.ok_or(ConfigError::Missing("cluster store"))?,
            self.status.ok_or(ConfigError::Missing("status reporter"))?,
            self.config,
        ))
    }
}
