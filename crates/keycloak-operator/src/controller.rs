//! # Event Dispatcher
//!
//! Watches `KeycloakOperator` objects and the resources they own, and turns
//! every change into a [`ResourceEvent`] for the work queue.

use crate::crds::KeycloakOperator;
use crate::descriptors::{DEPLOYMENT_CONFIG_API_VERSION, ROUTE_API_VERSION};
use crate::{INSTANCE_LABEL, MANAGED_BY_LABEL, MANAGER_NAME};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use keycloak_reconciler::{EventKind, Identity, ResourceEvent, ResourceKey, MAX_REQUEUE_DELAY};
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Kinds created for every `KeycloakOperator`
pub const OWNED_KINDS: [(&str, &str); 4] = [
    ("v1", "PersistentVolumeClaim"),
    ("v1", "Service"),
    (ROUTE_API_VERSION, "Route"),
    (DEPLOYMENT_CONFIG_API_VERSION, "DeploymentConfig"),
];

/// Identity of the custom resource owning a labelled child
pub fn owner_of<K: Resource>(child: &K) -> Option<Identity> {
    let labels = child.labels();
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGER_NAME) {
        return None;
    }
    let instance = labels.get(INSTANCE_LABEL)?;
    Some(Identity::new(child.namespace()?, instance.clone()))
}

/// Remembers which identities exist so watch events can be classified
#[derive(Debug, Default)]
pub struct EventTracker {
    known: HashSet<Identity>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }

    pub fn on_primary(&mut self, event: Event<KeycloakOperator>) -> Vec<ResourceEvent> {
        match event {
            Event::Applied(object) => {
                let Some(identity) = object.identity() else {
                    return Vec::new();
                };
                let kind = if self.known.insert(identity.clone()) {
                    EventKind::Created
                } else {
                    EventKind::Updated
                };
                vec![ResourceEvent::new(identity, kind)]
            }
            Event::Deleted(object) => object
                .identity()
                .map(|identity| {
                    self.known.remove(&identity);
                    ResourceEvent::new(identity, EventKind::Deleted)
                })
                .into_iter()
                .collect(),
            Event::Restarted(objects) => {
                let listed: HashSet<Identity> =
                    objects.iter().filter_map(KeycloakOperator::identity).collect();
                // Anything not in the relist was deleted while the watch was down
                let mut events: Vec<ResourceEvent> = self
                    .known
                    .difference(&listed)
                    .map(|identity| ResourceEvent::new(identity.clone(), EventKind::Deleted))
                    .collect();
                events.extend(
                    listed
                        .iter()
                        .map(|identity| ResourceEvent::new(identity.clone(), EventKind::Resynced)),
                );
                self.known = listed;
                events
            }
        }
    }

    /// A change to an owned child re-triggers its owner
    pub fn on_owned(&self, event: Event<DynamicObject>) -> Vec<ResourceEvent> {
        let objects = match event {
            Event::Applied(object) | Event::Deleted(object) => vec![object],
            Event::Restarted(objects) => objects,
        };
        let owners: HashSet<Identity> = objects.iter().filter_map(owner_of).collect();
        owners
            .into_iter()
            .map(|identity| ResourceEvent::new(identity, EventKind::Updated))
            .collect()
    }

    pub fn resync(&self) -> Vec<ResourceEvent> {
        self.known
            .iter()
            .map(|identity| ResourceEvent::new(identity.clone(), EventKind::Resynced))
            .collect()
    }
}

/// Feeds watch events and periodic resyncs into the controller
pub struct EventDispatcher {
    client: Client,
    namespace: Option<String>,
    resync: Duration,
}

impl EventDispatcher {
    pub fn new(client: Client, namespace: Option<String>, resync: Duration) -> Self {
        Self {
            client,
            namespace,
            resync,
        }
    }

    fn primary_api(&self) -> Api<KeycloakOperator> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn owned_api(&self, api_version: &str, kind: &str) -> Api<DynamicObject> {
        let key = ResourceKey::new(api_version, kind, "", "");
        let resource = ApiResource::from_gvk(&crate::cluster::gvk_for(&key));
        match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    /// Run until the receiving side of `events` is dropped
    pub async fn run(self, events: mpsc::Sender<ResourceEvent>) {
        info!(
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            resync_secs = self.resync.as_secs(),
            "starting event dispatcher"
        );

        let mut primary = watcher::watcher(self.primary_api(), watcher::Config::default())
            .default_backoff()
            .boxed();

        let owned_selector = format!("{MANAGED_BY_LABEL}={MANAGER_NAME}");
        let owned_streams: Vec<BoxStream<'static, _>> = OWNED_KINDS
            .iter()
            .map(|(api_version, kind)| {
                let config = watcher::Config::default().labels(&owned_selector);
                watcher::watcher(self.owned_api(api_version, kind), config)
                    .default_backoff()
                    .boxed()
            })
            .collect();
        let mut owned = stream::select_all(owned_streams);

        let period = self.resync.min(MAX_REQUEUE_DELAY);
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tracker = EventTracker::new();
        loop {
            let batch = tokio::select! {
                Some(item) = primary.next() => match item {
                    Ok(event) => tracker.on_primary(event),
                    Err(e) => {
                        warn!(error = %e, "primary watch error");
                        continue;
                    }
                },
                Some(item) = owned.next() => match item {
                    Ok(event) => tracker.on_owned(event),
                    Err(e) => {
                        warn!(error = %e, "owned resource watch error");
                        continue;
                    }
                },
                _ = resync.tick() => {
                    debug!(identities = tracker.known(), "periodic resync");
                    tracker.resync()
                }
                else => break,
            };

            for event in batch {
                if events.send(event).await.is_err() {
                    info!("event receiver closed, stopping dispatcher");
                    return;
                }
            }
        }
        warn!("watch streams ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::KeycloakOperatorSpec;
    use std::collections::BTreeMap;

    fn operator(namespace: &str, name: &str) -> KeycloakOperator {
        let mut object = KeycloakOperator::new(
            name,
            KeycloakOperatorSpec {
                admin_credentials_secret: "admin".to_string(),
                ..Default::default()
            },
        );
        object.metadata.namespace = Some(namespace.to_string());
        object
    }

    fn child(namespace: &str, labels: &[(&str, &str)]) -> DynamicObject {
        let resource = ApiResource::from_gvk(&crate::cluster::gvk_for(&ResourceKey::new(
            "v1", "Service", namespace, "keycloak",
        )));
        let mut object = DynamicObject::new("keycloak", &resource).within(namespace);
        object.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        object
    }

    fn kinds(mut events: Vec<ResourceEvent>) -> Vec<(String, EventKind)> {
        events.sort_by(|a, b| a.identity.name.cmp(&b.identity.name));
        events
            .into_iter()
            .map(|e| (e.identity.name, e.kind))
            .collect()
    }

    #[test]
    fn test_applied_is_created_then_updated() {
        let mut tracker = EventTracker::new();
        let first = tracker.on_primary(Event::Applied(operator("sso", "kc")));
        assert_eq!(kinds(first), vec![("kc".to_string(), EventKind::Created)]);
        let second = tracker.on_primary(Event::Applied(operator("sso", "kc")));
        assert_eq!(kinds(second), vec![("kc".to_string(), EventKind::Updated)]);
    }

    #[test]
    fn test_deleted_forgets_identity() {
        let mut tracker = EventTracker::new();
        tracker.on_primary(Event::Applied(operator("sso", "kc")));
        let deleted = tracker.on_primary(Event::Deleted(operator("sso", "kc")));
        assert_eq!(kinds(deleted), vec![("kc".to_string(), EventKind::Deleted)]);
        assert!(tracker.resync().is_empty());
    }

    #[test]
    fn test_restart_resyncs_and_reports_vanished() {
        let mut tracker = EventTracker::new();
        tracker.on_primary(Event::Applied(operator("sso", "a")));
        tracker.on_primary(Event::Applied(operator("sso", "b")));

        let events = tracker.on_primary(Event::Restarted(vec![operator("sso", "b"), operator("sso", "c")]));
        assert_eq!(
            kinds(events),
            vec![
                ("a".to_string(), EventKind::Deleted),
                ("b".to_string(), EventKind::Resynced),
                ("c".to_string(), EventKind::Resynced),
            ]
        );
        assert_eq!(tracker.known(), 2);
    }

    #[test]
    fn test_owned_change_maps_to_owner() {
        let tracker = EventTracker::new();
        let labelled = child("sso", &[(MANAGED_BY_LABEL, MANAGER_NAME), (INSTANCE_LABEL, "kc")]);
        let events = tracker.on_owned(Event::Deleted(labelled));
        assert_eq!(events, vec![ResourceEvent::new(Identity::new("sso", "kc"), EventKind::Updated)]);
    }

    #[test]
    fn test_foreign_children_are_ignored() {
        let tracker = EventTracker::new();
        let foreign = child("sso", &[(MANAGED_BY_LABEL, "helm"), (INSTANCE_LABEL, "kc")]);
        let unlabelled = child("sso", &[]);
        assert!(tracker.on_owned(Event::Restarted(vec![foreign, unlabelled])).is_empty());
    }

    #[test]
    fn test_restarted_children_coalesce_per_owner() {
        let tracker = EventTracker::new();
        let labels = [(MANAGED_BY_LABEL, MANAGER_NAME), (INSTANCE_LABEL, "kc")];
        let events = tracker.on_owned(Event::Restarted(vec![child("sso", &labels), child("sso", &labels)]));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_resync_covers_known_identities() {
        let mut tracker = EventTracker::new();
        tracker.on_primary(Event::Applied(operator("sso", "a")));
        tracker.on_primary(Event::Applied(operator("other", "b")));
        let events = tracker.resync();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Resynced));
    }
}
