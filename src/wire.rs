//! JSON wire messages exchanged over a network boundary.
//!
//! Both message types carry the complete current state, never a diff.

use serde::{Deserialize, Serialize};

use crate::error::{IntakeResult, ValidationError};
use crate::record::PatientRecord;
use crate::snapshot::Snapshot;

/// Maximum size of an encoded wire message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// A message on the intake wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WireMessage {
    /// Full record from the editing side.
    #[serde(rename = "patient-update")]
    PatientUpdate(PatientRecord),

    /// Full snapshot fanned out to staff observers.
    #[serde(rename = "staff-update")]
    StaffUpdate(Snapshot),
}

impl WireMessage {
    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PatientUpdate(_) => "patient-update",
            Self::StaffUpdate(_) => "staff-update",
        }
    }
}

/// Encodes a message, enforcing [`MAX_MESSAGE_BYTES`].
///
/// # Errors
/// `ValidationError::PayloadTooLarge` if the encoding exceeds the limit.
pub fn encode(message: &WireMessage) -> IntakeResult<Vec<u8>> {
    let bytes = serde_json::to_vec(message).map_err(|e| ValidationError::MalformedMessage {
        reason: format!("failed to serialize {}: {e}", message.kind()),
    })?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            actual: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        }
        .into());
    }
    Ok(bytes)
}

/// Decodes a message, rejecting empty and oversized payloads.
///
/// # Errors
/// `ValidationError::PayloadTooLarge` or `ValidationError::MalformedMessage`.
pub fn decode(bytes: &[u8]) -> IntakeResult<WireMessage> {
    if bytes.is_empty() {
        return Err(ValidationError::MalformedMessage {
            reason: "empty payload".to_string(),
        }
        .into());
    }
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            actual: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        }
        .into());
    }
    serde_json::from_slice(bytes).map_err(|e| {
        ValidationError::MalformedMessage {
            reason: e.to_string(),
        }
        .into()
    })
}
