//! Semantic comparison of desired and observed bodies.
//!
//! The desired body is matched as a subset of the observed one: every field
//! the operator sets must be present with the same value, while fields added
//! by the server (defaults, status, bookkeeping metadata) are ignored.

use crate::types::{Readiness, ResourceDescriptor};
use serde_json::Value;

/// Metadata populated by the API server, never owned by the operator
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "generateName",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

/// True when `observed` already carries everything `desired` asks for
pub fn semantically_equal(desired: &Value, observed: &Value) -> bool {
    let mut path = Vec::new();
    contains(desired, observed, &mut path)
}

fn contains<'a>(desired: &'a Value, observed: &Value, path: &mut Vec<&'a str>) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, want_value)| {
            if is_ignored(path, key) {
                return true;
            }
            match have.get(key) {
                Some(have_value) => {
                    path.push(key);
                    let matches = contains(want_value, have_value, path);
                    path.pop();
                    matches
                }
                None => is_empty(want_value),
            }
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want
                    .iter()
                    .zip(have)
                    .all(|(want_item, have_item)| contains(want_item, have_item, path))
        }
        (Value::Number(want), Value::Number(have)) => match (want.as_i64(), have.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => want.as_f64() == have.as_f64(),
        },
        (want, Value::Null) => is_empty(want),
        (want, have) => want == have,
    }
}

fn is_ignored(path: &[&str], key: &str) -> bool {
    match path {
        [] => key == "status",
        ["metadata"] => SERVER_MANAGED_METADATA.contains(&key),
        _ => false,
    }
}

// The API server drops nulls and empty collections
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// `None` when the observed resource is converged, otherwise what it is waiting for
pub fn pending_readiness(descriptor: &ResourceDescriptor, observed: &Value) -> Option<String> {
    match descriptor.readiness {
        Readiness::Exists => None,
        Readiness::ReplicasReady => {
            let wanted = descriptor
                .body
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);

            let generation = observed.pointer("/metadata/generation").and_then(Value::as_i64);
            let seen = observed
                .pointer("/status/observedGeneration")
                .and_then(Value::as_i64);
            if let (Some(generation), Some(seen)) = (generation, seen) {
                if seen < generation {
                    return Some(format!(
                        "{} has not observed generation {} yet",
                        descriptor.key, generation
                    ));
                }
            }

            let ready = observed
                .pointer("/status/readyReplicas")
                .or_else(|| observed.pointer("/status/availableReplicas"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if ready >= wanted {
                None
            } else {
                Some(format!("{}: {}/{} replicas ready", descriptor.key, ready, wanted))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKey;
    use proptest::prelude::*;
    use serde_json::json;

    fn workload(replicas: i64) -> ResourceDescriptor {
        ResourceDescriptor::new(
            ResourceKey::new("apps.openshift.io/v1", "DeploymentConfig", "sso", "keycloak"),
            json!({"spec": {"replicas": replicas}}),
        )
        .with_readiness(Readiness::ReplicasReady)
    }

    #[test]
    fn test_ignores_server_managed_fields() {
        let desired = json!({
            "metadata": {"name": "keycloak", "labels": {"application": "keycloak"}},
            "spec": {"ports": [{"port": 8443}]}
        });
        let observed = json!({
            "metadata": {
                "name": "keycloak",
                "labels": {"application": "keycloak"},
                "resourceVersion": "4711",
                "uid": "c0ffee",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "managedFields": [{"manager": "keycloak-operator"}]
            },
            "spec": {"ports": [{"port": 8443, "protocol": "TCP"}], "clusterIP": "10.0.0.1"},
            "status": {"loadBalancer": {}}
        });
        assert!(semantically_equal(&desired, &observed));
    }

    #[test]
    fn test_detects_changed_value() {
        let desired = json!({"spec": {"replicas": 1}});
        let observed = json!({"spec": {"replicas": 3}});
        assert!(!semantically_equal(&desired, &observed));
    }

    #[test]
    fn test_desired_status_is_never_compared() {
        let desired = json!({"spec": {}, "status": {"phase": "Bound"}});
        let observed = json!({"spec": {}, "status": {"phase": "Pending"}});
        assert!(semantically_equal(&desired, &observed));
    }

    #[test]
    fn test_array_length_matters() {
        let desired = json!({"args": ["-b", "0.0.0.0"]});
        let observed = json!({"args": ["-b", "0.0.0.0", "--debug"]});
        assert!(!semantically_equal(&desired, &observed));
    }

    #[test]
    fn test_empty_values_match_absent_fields() {
        let desired = json!({"metadata": {"annotations": {}}, "spec": {"volumes": [], "host": null}});
        let observed = json!({"metadata": {}, "spec": {}});
        assert!(semantically_equal(&desired, &observed));
    }

    #[test]
    fn test_integer_and_float_forms() {
        assert!(semantically_equal(&json!({"n": 1}), &json!({"n": 1.0})));
    }

    #[test]
    fn test_replicas_readiness() {
        let desc = workload(2);
        let observed = json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 1}});
        assert!(pending_readiness(&desc, &observed).is_some());

        let observed = json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 2}});
        assert!(pending_readiness(&desc, &observed).is_none());

        let observed = json!({"spec": {"replicas": 2}});
        assert!(pending_readiness(&desc, &observed).is_some());
    }

    #[test]
    fn test_readiness_waits_for_observed_generation() {
        let desc = workload(1);
        let observed = json!({
            "metadata": {"generation": 4},
            "status": {"observedGeneration": 3, "readyReplicas": 1}
        });
        let pending = pending_readiness(&desc, &observed);
        assert!(pending.is_some_and(|p| p.contains("generation 4")));
    }

    #[test]
    fn test_exists_readiness_is_immediate() {
        let desc = ResourceDescriptor::new(
            ResourceKey::new("v1", "Service", "sso", "keycloak"),
            json!({}),
        );
        assert!(pending_readiness(&desc, &json!({})).is_none());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{1,8}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 1..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_body_matches_itself(body in arb_json()) {
            prop_assert!(semantically_equal(&body, &body));
        }

        #[test]
        fn prop_extra_observed_fields_are_tolerated(
            spec in prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 1..6),
            extra in any::<i32>(),
        ) {
            let desired = json!({"spec": spec});
            let mut observed = desired.clone();
            observed["spec"]["zzServerDefault"] = json!(extra);
            observed["metadata"] = json!({"resourceVersion": extra.to_string()});
            prop_assert!(semantically_equal(&desired, &observed));
        }
    }
}
