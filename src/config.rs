//! Top-level configuration.

use crate::activity::ActivityConfig;
use crate::channel::ChannelConfig;
use crate::completion::RequiredFields;
use crate::error::ValidationError;
use crate::persistence::PersistenceConfig;

/// Everything an intake session and its channel need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeConfig {
    /// Idle timer settings.
    pub activity: ActivityConfig,
    /// Distribution channel settings.
    pub channel: ChannelConfig,
    /// Persistence hand-off settings.
    pub persistence: PersistenceConfig,
    /// Fields counted by the completion percentage.
    pub required_fields: RequiredFields,
}

impl IntakeConfig {
    /// Validates every section.
    ///
    /// # Errors
    /// The first `ValidationError::InvalidConfig` found.
    pub fn validate(self) -> Result<Self, ValidationError> {
        Ok(Self {
            activity: self.activity.validate()?,
            channel: self.channel.validate()?,
            persistence: self.persistence.validate()?,
            required_fields: RequiredFields::new(self.required_fields.fields().iter().copied())?,
        })
    }
}
