//! Error types for the reconciliation engine.

use serde::{Deserialize, Serialize};

/// How the engine reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// The desired state cannot be turned into descriptors; waits for a new generation
    InvalidSpec,
    /// Store unavailable or timed out; retried with backoff
    Transient,
    /// The store refused the desired body; retried at a reduced frequency
    Rejected,
    /// The observed version moved underneath an update; re-read and recompute
    Conflict,
}

/// Errors returned by the cluster store and the desired state store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("rejected by the cluster: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Transient(_) => ErrorClass::Transient,
            Self::Rejected(_) => ErrorClass::Rejected,
        }
    }
}

/// Errors produced while turning a desired state into ordered descriptors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("duplicate descriptor {0}")]
    DuplicateResource(String),

    #[error("{resource} depends on unknown resource {dependency}")]
    UnknownDependency { resource: String, dependency: String },

    #[error("dependency cycle among {0}")]
    DependencyCycle(String),
}

impl BuildError {
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec(reason.into())
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::InvalidSpec
    }
}

/// Errors returned by the status reporter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    /// Someone else updated the status concurrently; retry with a fresh read
    #[error("status update conflict: {0}")]
    Conflict(String),

    #[error("status update failed: {0}")]
    Transient(String),
}

/// Invalid engine or controller settings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("missing collaborator: {0}")]
    Missing(&'static str),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classes() {
        assert_eq!(StoreError::transient("timeout").class(), ErrorClass::Transient);
        assert_eq!(StoreError::rejected("quota").class(), ErrorClass::Rejected);
        assert_eq!(
            StoreError::conflict("Service sso/keycloak", "version moved").class(),
            ErrorClass::Conflict
        );
        assert_eq!(BuildError::invalid_spec("bad").class(), ErrorClass::InvalidSpec);
    }

    #[test]
    fn test_error_display() {
        let err = BuildError::UnknownDependency {
            resource: "Route sso/keycloak".to_string(),
            dependency: "Service sso/missing".to_string(),
        };
        assert!(err.to_string().contains("Service sso/missing"));

        let err = ConfigError::invalid("concurrency", "must be at least 1");
        assert_eq!(err.to_string(), "invalid value for concurrency: must be at least 1");
    }
}
