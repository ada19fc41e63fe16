//! Operator errors and Kubernetes API error classification.

use keycloak_reconciler::{ConfigError, StatusError, StoreError};
use std::path::PathBuf;

/// Errors raised while bootstrapping the operator
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to read config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ConfigFormat(#[from] serde_yaml::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("health server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Map a Kubernetes API error onto the engine's store error classes.
///
/// 409 is a conflict; 400, 403 and 422 mean the body was refused; everything
/// else, including transport failures, is transient.
pub fn classify(resource: &str, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(response) => match response.code {
            409 => StoreError::conflict(resource, response.message),
            400 | 403 | 422 => StoreError::rejected(format!("{resource}: {}", response.message)),
            code => StoreError::transient(format!("{resource}: HTTP {code}: {}", response.message)),
        },
        other => StoreError::transient(format!("{resource}: {other}")),
    }
}

/// Status writes only distinguish conflicts from everything else
pub fn classify_status(resource: &str, error: kube::Error) -> StatusError {
    match error {
        kube::Error::Api(response) if response.code == 409 => {
            StatusError::Conflict(format!("{resource}: {}", response.message))
        }
        other => StatusError::Transient(format!("{resource}: {other}")),
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}
