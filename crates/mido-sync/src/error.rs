//! Reconciliation error taxonomy

use crate::backend::BackendError;
use mido_sync_common::CidrError;
use thiserror::Error;

/// Errors raised while reconciling one entity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Bad CIDR, route or rule in the desired-state model
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Backend call failed after retries, or was rejected
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Router-ID pool or another bounded table is full
    #[error("{what} capacity exceeded (max {max})")]
    CapacityExceeded { what: String, max: usize },

    /// Child operation attempted before its parent was present
    #[error("{child} requires {parent} to be present")]
    DependencyMissing { child: String, parent: String },

    /// Rule the backend cannot express
    #[error("unsupported rule: {0}")]
    UnsupportedRule(String),

    /// Host named in the model or configuration is not registered
    #[error("host '{0}' is not registered with the backend")]
    HostNotFound(String),

    /// Identifier matches no entity and no managed object
    #[error("unknown object '{0}'")]
    UnknownObject(String),

    /// Run stopped through its cancellation token
    #[error("run cancelled after {after}")]
    Cancelled { after: String },
}

impl SyncError {
    pub fn dependency(child: impl Into<String>, parent: impl Into<String>) -> Self {
        SyncError::DependencyMissing {
            child: child.into(),
            parent: parent.into(),
        }
    }

    /// Errors that stop the whole run rather than one entity
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::DependencyMissing { .. } | SyncError::Cancelled { .. }
        )
    }

    /// Errors that only skip one model item
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedInput(_) | SyncError::UnsupportedRule(_)
        )
    }
}

impl From<CidrError> for SyncError {
    fn from(e: CidrError) -> Self {
        SyncError::MalformedInput(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use mido_sync_common::split_cidr;

    #[test]
    fn test_cidr_errors_are_malformed_input() {
        let err: SyncError = split_cidr("nope").unwrap_err().into();
        assert!(matches!(err, SyncError::MalformedInput(_)));
        assert!(err.is_skippable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(SyncError::dependency("subnet subnet-1", "vpc vpc-1").is_fatal());
        assert!(
            SyncError::Cancelled {
                after: "pass 1".to_string()
            }
            .is_fatal()
        );
        assert!(
            !SyncError::CapacityExceeded {
                what: "router id".to_string(),
                max: 10
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_backend_errors_pass_through() {
        let err: SyncError = BackendError::Transient("503".to_string()).into();
        assert_eq!(err.to_string(), "transient backend failure: 503");
    }
}
