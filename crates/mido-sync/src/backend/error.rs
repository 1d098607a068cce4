//! Backend error classification
//!
//! Typed errors for network-virtualization API calls, classified by HTTP
//! status instead of string matching on messages.

use mido_sync_common::ObjectKind;
use thiserror::Error;

/// Backend error categories for retry and cleanup logic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Object does not exist (safe to skip in deletes)
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ObjectKind, id: String },

    /// Object already exists (treated as already-present on create)
    #[error("{kind} '{name}' already exists")]
    Conflict { kind: ObjectKind, name: String },

    /// Transport failure, overload or server error (retryable with backoff)
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Request was understood and refused; retrying will not help
    #[error("backend rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl BackendError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    /// Check if this is an "already exists" error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::Conflict { .. })
    }
}

/// HTTP statuses meaning the object is gone
const NOT_FOUND_STATUSES: &[u16] = &[404, 410];

/// HTTP statuses meaning the object already exists
const CONFLICT_STATUSES: &[u16] = &[409];

/// HTTP statuses worth retrying
const TRANSIENT_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

/// Classify a non-success HTTP response.
///
/// `subject` names the object involved (id for reads and deletes, name for
/// creates) and `message` is the response body.
pub fn classify_status(status: u16, kind: ObjectKind, subject: &str, message: &str) -> BackendError {
    match status {
        s if NOT_FOUND_STATUSES.contains(&s) => BackendError::NotFound {
            kind,
            id: subject.to_string(),
        },
        s if CONFLICT_STATUSES.contains(&s) => BackendError::Conflict {
            kind,
            name: subject.to_string(),
        },
        s if TRANSIENT_STATUSES.contains(&s) => {
            BackendError::Transient(format!("status {s}: {message}"))
        }
        s => BackendError::Rejected {
            status: s,
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_statuses() {
        for status in NOT_FOUND_STATUSES {
            let err = classify_status(*status, ObjectKind::Port, "port-1", "gone");
            assert!(err.is_not_found(), "Expected NotFound for status: {status}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn conflict_statuses() {
        for status in CONFLICT_STATUSES {
            let err = classify_status(*status, ObjectKind::Router, "vr_vpc-1_2", "dup");
            assert!(err.is_already_exists(), "Expected Conflict for status: {status}");
        }
    }

    #[test]
    fn transient_statuses() {
        for status in TRANSIENT_STATUSES {
            let err = classify_status(*status, ObjectKind::Chain, "x", "busy");
            assert!(err.is_retryable(), "Expected retryable for status: {status}");
        }
    }

    #[test]
    fn other_statuses_are_rejections() {
        let err = classify_status(400, ObjectKind::Rule, "x", "bad position");
        assert_eq!(
            err,
            BackendError::Rejected {
                status: 400,
                message: "bad position".to_string()
            }
        );
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn display_mentions_kind() {
        let err = BackendError::NotFound {
            kind: ObjectKind::Bridge,
            id: "bridge-000001".to_string(),
        };
        assert_eq!(err.to_string(), "bridge 'bridge-000001' not found");
    }
}
