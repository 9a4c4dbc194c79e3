//! Error types for intake-relay.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions. None of them is fatal: the record store and the
//! distribution channel stay usable after any single failure.

use thiserror::Error;

use crate::record::SessionId;
use crate::channel::SubscriptionId;

/// Errors raised by record mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record for session {session_id} is submitted and can no longer be edited")]
    ImmutableRecord {
        session_id: SessionId,
    },
}

/// Errors raised by the distribution channel and observer handles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Delivery to observer {subscription_id} failed: {reason}")]
    Delivery {
        subscription_id: SubscriptionId,
        reason: String,
    },

    #[error("Subscription not found: {subscription_id}")]
    SubscriptionNotFound {
        subscription_id: SubscriptionId,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Receive timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Errors reported by external collaborators (summary generation, persistence).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Summary generation failed: {message}")]
    Summary {
        message: String,
    },

    #[error("Persistence failed: {message}")]
    Persistence {
        message: String,
    },
}

/// Input and configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown patient field '{name}'")]
    UnknownField {
        name: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Submission rejected: {} field(s) failed validation", .issues.len())]
    Submission {
        issues: Vec<FieldIssue>,
    },

    #[error("Payload of {actual} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        actual: usize,
        max: usize,
    },

    #[error("Malformed message: {reason}")]
    MalformedMessage {
        reason: String,
    },
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldIssue {
    /// Wire name of the offending field.
    pub field: String,
    /// Human-readable message.
    pub message: String,
}

/// Top-level error type for intake-relay.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl IntakeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is an edit-after-submit rejection.
    #[must_use]
    pub const fn is_immutable_record(&self) -> bool {
        matches!(self, Self::Record(RecordError::ImmutableRecord { .. }))
    }

    /// Returns true if this is a channel error.
    #[must_use]
    pub const fn is_channel(&self) -> bool {
        matches!(self, Self::Channel(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the caller can safely ignore this error and carry on.
    ///
    /// Rejected edits, isolated delivery failures, unknown subscriptions and
    /// collaborator failures never corrupt shared state.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Record(_) | Self::Collaborator(_) => true,
            Self::Channel(e) => matches!(
                e,
                ChannelError::Delivery { .. } | ChannelError::SubscriptionNotFound { .. } | ChannelError::Timeout { .. }
            ),
            Self::Validation(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for intake-relay operations.
pub type IntakeResult<T> = Result<T, IntakeError>;

pub(crate) fn lock_poisoned(context: &'static str) -> IntakeError {
    IntakeError::internal(format!("poisoned lock: {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immutable_record_message() {
        let err = RecordError::ImmutableRecord {
            session_id: SessionId::nil(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("submitted"));
        assert!(msg.contains("00000000"));
    }

    #[test]
    fn test_channel_error_timeout() {
        let err = ChannelError::Timeout { duration_ms: 250 };
        assert!(format!("{err}").contains("250ms"));
    }

    #[test]
    fn test_submission_error_counts_issues() {
        let err = ValidationError::Submission {
            issues: vec![
                FieldIssue {
                    field: "phone".to_string(),
                    message: "Invalid phone".to_string(),
                },
                FieldIssue {
                    field: "email".to_string(),
                    message: "Invalid email".to_string(),
                },
            ],
        };
        assert!(format!("{err}").contains("2 field(s)"));
    }

    #[test]
    fn test_intake_error_from_record() {
        let err: IntakeError = RecordError::ImmutableRecord {
            session_id: SessionId::new(),
        }
        .into();
        assert!(err.is_immutable_record());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_intake_error_recoverable() {
        let delivery: IntakeError = ChannelError::Delivery {
            subscription_id: SubscriptionId::new(),
            reason: "closed".to_string(),
        }
        .into();
        assert!(delivery.is_channel());
        assert!(delivery.is_recoverable());

        let disconnected: IntakeError = ChannelError::Disconnected {
            path: "observer".to_string(),
        }
        .into();
        assert!(!disconnected.is_recoverable());

        let summary: IntakeError = CollaboratorError::Summary {
            message: "upstream 500".to_string(),
        }
        .into();
        assert!(summary.is_recoverable());

        let config: IntakeError = ValidationError::InvalidConfig {
            reason: "idle window".to_string(),
        }
        .into();
        assert!(config.is_validation());
        assert!(!config.is_recoverable());
    }

    #[test]
    fn test_internal_error() {
        let err = IntakeError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_recoverable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
