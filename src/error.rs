//! Error types for the Pool Fleet Operator
//!
//! Provides structured error types for topology validation, device claims,
//! reconciliation and the store adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes / Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Transient store error: {0}")]
    TransientStore(String),

    // =========================================================================
    // Topology Errors
    // =========================================================================
    #[error("Node selector {selector} matched {matches} nodes, expected exactly one")]
    AmbiguousSelector { selector: String, matches: usize },

    #[error("Block device {device} is already in use by {owner}")]
    AlreadyInUse { device: String, owner: String },

    #[error("Block device {device} has tag {tag} which is not in the allowed tag list")]
    TagNotAllowed { device: String, tag: String },

    #[error(
        "Block device {new_device} ({new_bytes} bytes) is smaller than {old_device} ({old_bytes} bytes)"
    )]
    CapacityTooSmall {
        new_device: String,
        new_bytes: u64,
        old_device: String,
        old_bytes: u64,
    },

    #[error("Replacement already in progress for block device {device}")]
    ReplacementInProgress { device: String },

    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    // =========================================================================
    // Instance Errors
    // =========================================================================
    #[error("Pool destroy failed for {instance}: {reason}")]
    PoolDestroy { instance: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::TransientStore(_) => ErrorAction::RequeueWithBackoff,

            // Waiting on the data plane to finish resilvering
            Error::ReplacementInProgress { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Destroy failures are retried indefinitely
            Error::PoolDestroy { .. } => ErrorAction::RequeueAfter(Duration::from_secs(20)),

            // Placement and ownership issues - medium retry
            Error::AmbiguousSelector { .. }
            | Error::AlreadyInUse { .. }
            | Error::ResourceNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::StructuralViolation(_)
            | Error::TagNotAllowed { .. }
            | Error::CapacityTooSmall { .. }
            | Error::CapacityParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientStore(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 || resp.code == 429 || resp.code >= 500,
            Error::Kube(_) => true,
            _ => false,
        }
    }

    /// Errors that the validation gate reports as a rejected edit
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Error::StructuralViolation(_)
                | Error::AmbiguousSelector { .. }
                | Error::AlreadyInUse { .. }
                | Error::TagNotAllowed { .. }
                | Error::CapacityTooSmall { .. }
                | Error::ReplacementInProgress { .. }
                | Error::ResourceNotFound { .. }
                | Error::CapacityParse(_)
        )
    }

    /// Map a kube API error into the store taxonomy
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Error::not_found(kind, name),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 || resp.code == 429 || resp.code >= 500 => {
                Error::TransientStore(format!("{}/{}: {}", kind, name, resp.message))
            }
            other => Error::Kube(other),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_error_actions() {
        let err = Error::ReplacementInProgress {
            device: "bd-1".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::StructuralViolation("mirror needs 2 devices".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::AlreadyInUse {
            device: "bd-1".into(),
            owner: "cluster-b".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::TransientStore("conflict".into());
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_from_kube_mapping() {
        assert!(matches!(
            Error::from_kube(api_error(404, "NotFound"), "BlockDevice", "bd-1"),
            Error::ResourceNotFound { .. }
        ));
        assert!(matches!(
            Error::from_kube(api_error(409, "AlreadyExists"), "BlockDeviceClaim", "bdc-1"),
            Error::ResourceExists { .. }
        ));
        assert!(matches!(
            Error::from_kube(api_error(409, "Conflict"), "PoolCluster", "pc"),
            Error::TransientStore(_)
        ));
        assert!(matches!(
            Error::from_kube(api_error(403, "Forbidden"), "PoolCluster", "pc"),
            Error::Kube(_)
        ));
    }

    #[test]
    fn test_admission_rejection_classes() {
        assert!(Error::StructuralViolation("x".into()).is_admission_rejection());
        assert!(Error::TagNotAllowed {
            device: "bd".into(),
            tag: "fast".into()
        }
        .is_admission_rejection());
        assert!(!Error::TransientStore("x".into()).is_admission_rejection());
        assert!(!Error::Internal("x".into()).is_admission_rejection());
    }
}
