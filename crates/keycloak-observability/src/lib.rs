//! Health and statistics abstractions for the operator, served over Axum

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

impl HealthStatus {
    /// Worst of two statuses
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Down, _) | (_, Down) => Down,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Up,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: Utc::now(),
            message: None,
            details: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Controller counters exposed on `/metrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorMetrics {
    pub uptime_seconds: u64,
    pub events_received: u64,
    pub reconcile_passes: u64,
    pub reconcile_failures: u64,
    pub reconcile_timeouts: u64,
    pub reconcile_panics: u64,
    pub ready: u64,
    pub progressing: u64,
    pub degraded: u64,
    /// Custom resources currently reported Degraded
    pub degraded_resources: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub scheduled_requeues: usize,
}

#[async_trait::async_trait]
pub trait HealthMonitor: Send + Sync + 'static {
    async fn get_overall_health(&self) -> HealthStatus;
    async fn run_health_checks(&self) -> Vec<HealthCheck>;
    async fn get_metrics(&self) -> OperatorMetrics;

    /// Whether the operator is ready to process events
    async fn is_ready(&self) -> bool {
        self.get_overall_health().await != HealthStatus::Down
    }
}

pub mod routes {
    use super::*;
    use axum::{
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Json},
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower_http::trace::TraceLayer;

    pub fn monitoring_routes(monitor: Arc<dyn HealthMonitor>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/health/detailed", get(health_detailed))
            .route("/ready", get(ready))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(monitor)
    }

    async fn health(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        let status = m.get_overall_health().await;
        let status_code = match status {
            HealthStatus::Up | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status_code, Json(status))
    }

    async fn health_detailed(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        Json(m.run_health_checks().await)
    }

    async fn ready(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        if m.is_ready().await {
            (StatusCode::OK, "ready")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
    }

    async fn metrics(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        Json(m.get_metrics().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_takes_worst() {
        assert_eq!(HealthStatus::Up.combine(HealthStatus::Up), HealthStatus::Up);
        assert_eq!(HealthStatus::Up.combine(HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.combine(HealthStatus::Down), HealthStatus::Down);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
    }
}
