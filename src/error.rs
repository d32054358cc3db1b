//! Error types for the multi-VPC operator
//!
//! Every failure here is framed as "not yet converged": the controllers log
//! the error and requeue the object. None of the variants stop the process.

use std::time::Duration;

use kube::runtime::finalizer;
use thiserror::Error;

use crate::config::OperatorConfig;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    /// Target object or pod is absent
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// More than one candidate pod for a gateway, usually a rollout in progress
    #[error("gateway {gateway} is backed by {count} pods, expected exactly one")]
    Ambiguous { gateway: String, count: usize },

    /// The single candidate pod exists but is not Running yet
    #[error("gateway pod {pod} is not running (phase: {phase})")]
    NotReady { pod: String, phase: String },

    /// Remote command wrote to stderr or the exec transport failed
    #[error("remote command failed in {pod}: {message}")]
    RemoteExecutionFailed { pod: String, message: String },

    /// Optimistic-concurrency failure on the API server
    #[error("update conflict: {0}")]
    UpdateConflict(String),

    /// Teardown finished but the probe still reports connectivity
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 409 => Error::UpdateConflict(resp.message),
            other => Error::KubeError(other),
        }
    }
}

impl From<finalizer::Error<Error>> for Error {
    fn from(e: finalizer::Error<Error>) -> Self {
        match e {
            finalizer::Error::ApplyFailed(inner) | finalizer::Error::CleanupFailed(inner) => inner,
            finalizer::Error::AddFinalizer(inner) | finalizer::Error::RemoveFinalizer(inner) => {
                Error::from(inner)
            }
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::Ambiguous { .. } => "ambiguous",
            Error::NotReady { .. } => "not_ready",
            Error::RemoteExecutionFailed { .. } => "remote_exec",
            Error::UpdateConflict(_) => "conflict",
            Error::VerificationFailed(_) => "verification",
            Error::ConfigError(_) => "config",
            Error::FinalizerError(_) => "finalizer",
            Error::SerializationError(_) => "serialization",
        }
    }

    /// Pod-selection races clear up on their own once the rollout settles
    pub fn is_pod_race(&self) -> bool {
        matches!(self, Error::Ambiguous { .. } | Error::NotReady { .. })
    }

    /// How long the dispatcher waits before retrying after this error
    pub fn requeue_after(&self, config: &OperatorConfig) -> Duration {
        if self.is_pod_race() {
            config.pod_backoff
        } else {
            config.error_requeue
        }
    }
}

/// Returns true when the error is an API 404, which callers usually treat as absent
pub fn is_kube_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_conflict_maps_to_update_conflict() {
        let err = Error::from(api_error(409));
        assert!(matches!(err, Error::UpdateConflict(_)));
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_other_api_errors_stay_kube_errors() {
        let err = Error::from(api_error(500));
        assert!(matches!(err, Error::KubeError(_)));
        assert!(is_kube_not_found(&api_error(404)));
        assert!(!is_kube_not_found(&api_error(409)));
    }

    #[test]
    fn test_pod_races_use_pod_backoff() {
        let config = OperatorConfig {
            pod_backoff: Duration::from_secs(5),
            error_requeue: Duration::from_secs(15),
            ..OperatorConfig::default()
        };

        let ambiguous = Error::Ambiguous {
            gateway: "gw1".to_string(),
            count: 2,
        };
        let not_ready = Error::NotReady {
            pod: "vpc-nat-gw-gw1-0".to_string(),
            phase: "Pending".to_string(),
        };
        let remote = Error::RemoteExecutionFailed {
            pod: "vpc-nat-gw-gw1-0".to_string(),
            message: "RTNETLINK answers: File exists".to_string(),
        };

        assert_eq!(ambiguous.requeue_after(&config), Duration::from_secs(5));
        assert_eq!(not_ready.requeue_after(&config), Duration::from_secs(5));
        assert_eq!(remote.requeue_after(&config), Duration::from_secs(15));
    }

    #[test]
    fn test_finalizer_apply_failure_unwraps_inner_error() {
        let inner = Error::VerificationFailed("still resolving".to_string());
        let err = Error::from(finalizer::Error::ApplyFailed(inner));
        assert!(matches!(err, Error::VerificationFailed(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = Error::not_found("pod", "gw1");
        assert_eq!(err.to_string(), "pod gw1 not found");

        let err = Error::Ambiguous {
            gateway: "gw1".to_string(),
            count: 3,
        };
        assert!(err.to_string().contains("3 pods"));
    }
}
