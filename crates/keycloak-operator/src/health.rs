//! Health monitor backed by the controller's counters.

use async_trait::async_trait;
use keycloak_observability::{HealthCheck, HealthMonitor, HealthStatus, OperatorMetrics};
use keycloak_reconciler::{Controller, StatsSnapshot};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Queue depth above which the operator reports itself degraded
pub const BACKLOG_THRESHOLD: usize = 256;

pub struct ControllerHealth {
    controller: Arc<Controller>,
    dispatcher_alive: Arc<AtomicBool>,
    started: Instant,
}

impl ControllerHealth {
    pub fn new(controller: Arc<Controller>, dispatcher_alive: Arc<AtomicBool>) -> Self {
        Self {
            controller,
            dispatcher_alive,
            started: Instant::now(),
        }
    }

    fn controller_check(&self, stats: &StatsSnapshot) -> HealthCheck {
        let status = if self.controller.queue().is_shutting_down() {
            HealthStatus::Down
        } else if stats.queue_depth > BACKLOG_THRESHOLD {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };
        HealthCheck::new("controller", status)
            .with_message(format!(
                "{} queued, {} in flight, {} scheduled",
                stats.queue_depth, stats.in_flight, stats.scheduled_requeues
            ))
            .with_details(json!({
                "passes": stats.passes,
                "failures": stats.failures,
                "timeouts": stats.timeouts,
                "panics": stats.panics,
            }))
    }

    fn dispatcher_check(&self) -> HealthCheck {
        if self.dispatcher_alive.load(Ordering::Relaxed) {
            HealthCheck::new("event-dispatcher", HealthStatus::Up)
        } else {
            HealthCheck::new("event-dispatcher", HealthStatus::Down).with_message("watch loop stopped")
        }
    }

    fn resources_check(&self, stats: &StatsSnapshot) -> HealthCheck {
        // Degraded custom resources are reported but do not fail readiness
        let status = if stats.degraded_identities > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };
        HealthCheck::new("resources", status)
            .with_message(format!("{} degraded", stats.degraded_identities))
            .with_details(json!({
                "degraded_now": stats.degraded_identities,
                "ready_passes": stats.ready,
                "progressing_passes": stats.progressing,
                "degraded_passes": stats.degraded,
            }))
    }
}

#[async_trait]
impl HealthMonitor for ControllerHealth {
    async fn get_overall_health(&self) -> HealthStatus {
        self.run_health_checks()
            .await
            .into_iter()
            .fold(HealthStatus::Up, |acc, check| acc.combine(check.status))
    }

    async fn run_health_checks(&self) -> Vec<HealthCheck> {
        let stats = self.controller.stats();
        vec![
            self.controller_check(&stats),
            self.dispatcher_check(),
            self.resources_check(&stats),
        ]
    }

    async fn get_metrics(&self) -> OperatorMetrics {
        let stats = self.controller.stats();
        OperatorMetrics {
            uptime_seconds: self.started.elapsed().as_secs(),
            events_received: stats.events,
            reconcile_passes: stats.passes,
            reconcile_failures: stats.failures,
            reconcile_timeouts: stats.timeouts,
            reconcile_panics: stats.panics,
            ready: stats.ready,
            progressing: stats.progressing,
            degraded: stats.degraded,
            degraded_resources: stats.degraded_identities,
            queue_depth: stats.queue_depth,
            in_flight: stats.in_flight,
            scheduled_requeues: stats.scheduled_requeues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{KeycloakOperator, KeycloakOperatorSpec};
    use crate::descriptors::KeycloakDescriptorBuilder;
    use keycloak_reconciler::memory::{
        InMemoryClusterStore, InMemoryDesiredStore, InMemoryStatusReporter,
    };
    use keycloak_reconciler::{Condition, ControllerConfig, Engine, Identity};

    fn health() -> (ControllerHealth, Arc<AtomicBool>) {
        health_over(Arc::new(InMemoryDesiredStore::new()))
    }

    fn health_over(desired: Arc<InMemoryDesiredStore>) -> (ControllerHealth, Arc<AtomicBool>) {
        let engine = Engine::builder()
            .desired_store(desired)
            .descriptor_builder(Arc::new(KeycloakDescriptorBuilder::default()))
            .cluster_store(Arc::new(InMemoryClusterStore::new()))
            .status_reporter(Arc::new(InMemoryStatusReporter::new()))
            .build()
            .unwrap();
        let controller = Arc::new(Controller::new(Arc::new(engine), ControllerConfig::default()));
        let alive = Arc::new(AtomicBool::new(true));
        (ControllerHealth::new(controller, Arc::clone(&alive)), alive)
    }

    #[tokio::test]
    async fn test_idle_operator_is_up() {
        let (health, _) = health();
        assert_eq!(health.get_overall_health().await, HealthStatus::Up);
        assert!(health.is_ready().await);
        assert_eq!(health.run_health_checks().await.len(), 3);
        assert_eq!(health.get_metrics().await.reconcile_passes, 0);
    }

    #[tokio::test]
    async fn test_dead_dispatcher_is_down() {
        let (health, alive) = health();
        alive.store(false, Ordering::Relaxed);
        assert_eq!(health.get_overall_health().await, HealthStatus::Down);
        assert!(!health.is_ready().await);
    }

    #[tokio::test]
    async fn test_shutdown_is_down() {
        let (health, _) = health();
        health.controller.queue().shutdown();
        assert_eq!(health.get_overall_health().await, HealthStatus::Down);
    }

    #[tokio::test]
    async fn test_resources_check_recovers_after_degraded_spec_is_fixed() {
        let desired = Arc::new(InMemoryDesiredStore::new());
        let (health, _) = health_over(Arc::clone(&desired));
        let engine = health.controller.engine();
        let id = Identity::new("sso", "keycloak");

        let mut object = KeycloakOperator::new("keycloak", KeycloakOperatorSpec::default());
        object.metadata.namespace = Some("sso".to_string());
        object.metadata.generation = Some(1);
        desired.put(object.desired_state().unwrap());
        let broken = engine.reconcile(&id).await;
        assert_eq!(broken.condition(), Some(Condition::Degraded));
        assert_eq!(health.get_overall_health().await, HealthStatus::Degraded);
        assert_eq!(health.get_metrics().await.degraded_resources, 1);

        object.spec.admin_credentials_secret = "keycloak-admin".to_string();
        desired.put(object.desired_state().unwrap());
        let fixed = engine.reconcile(&id).await;
        assert_eq!(fixed.condition(), Some(Condition::Progressing));

        assert_eq!(health.get_overall_health().await, HealthStatus::Up);
        assert_eq!(health.get_metrics().await.degraded_resources, 0);
    }
}
