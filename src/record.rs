//! Patient record types.
//!
//! A `PatientRecord` is the single shared piece of state that the intake form
//! mutates and staff observe. Field names on the wire are camelCase, matching
//! what the form collaborator sends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Namespace for deriving stable session ids from external keys.
const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_43d2_9a0e_4c55_8e21_3f7d_c0a4_91b6);

/// Identity of one patient session (the record identity).
///
/// A fresh id is minted every time the record is reset, so snapshots from an
/// earlier session are never confused with the current one.
///
/// # Examples
///
/// ```
/// use intake_relay::SessionId;
///
/// let id = SessionId::new();
/// assert!(!id.is_nil());
/// assert_eq!(SessionId::from_key("kiosk-3"), SessionId::from_key("kiosk-3"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a stable session id from an external key (e.g. a kiosk name).
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        Self(Uuid::new_v5(&SESSION_NAMESPACE, key.as_bytes()))
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is the nil UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Nil session id (tests and sentinels).
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Activity-derived status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatientStatus {
    /// The patient edited the form within the idle window.
    #[default]
    Active,
    /// No edit for at least the idle window.
    Inactive,
    /// The form was submitted. Terminal for the session.
    Submitted,
}

impl PatientStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Submitted => "submitted",
        }
    }

    /// Returns true once the record can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Submitted)
    }
}

impl fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The editable fields of a patient record, in form order.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatientField {
    FirstName,
    MiddleName,
    LastName,
    Dob,
    Gender,
    Phone,
    Email,
    Address,
    Language,
    Nationality,
    Religion,
    EmergencyName,
    EmergencyRelation,
}

impl PatientField {
    /// Every field in form order.
    pub const ALL: [Self; 13] = [
        Self::FirstName,
        Self::MiddleName,
        Self::LastName,
        Self::Dob,
        Self::Gender,
        Self::Phone,
        Self::Email,
        Self::Address,
        Self::Language,
        Self::Nationality,
        Self::Religion,
        Self::EmergencyName,
        Self::EmergencyRelation,
    ];

    /// Wire (camelCase) name of the field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstName => "firstName",
            Self::MiddleName => "middleName",
            Self::LastName => "lastName",
            Self::Dob => "dob",
            Self::Gender => "gender",
            Self::Phone => "phone",
            Self::Email => "email",
            Self::Address => "address",
            Self::Language => "language",
            Self::Nationality => "nationality",
            Self::Religion => "religion",
            Self::EmergencyName => "emergencyName",
            Self::EmergencyRelation => "emergencyRelation",
        }
    }

    /// Returns true for fields the form may leave unset.
    #[must_use]
    pub const fn is_optional(self) -> bool {
        matches!(
            self,
            Self::MiddleName | Self::Religion | Self::EmergencyName | Self::EmergencyRelation
        )
    }
}

impl fmt::Display for PatientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatientField {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownField { name: s.to_string() })
    }
}

/// The shared patient record.
///
/// Optional fields are `None` until first written and are omitted on the wire
/// while unset.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    #[serde(default)]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub dob: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub nationality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub religion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_relation: Option<String>,
    #[serde(default)]
    pub status: PatientStatus,
}

impl PatientRecord {
    /// An empty, active record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a field; unset optional fields read as `""`.
    #[must_use]
    pub fn get(&self, field: PatientField) -> &str {
        match field {
            PatientField::FirstName => &self.first_name,
            PatientField::MiddleName => self.middle_name.as_deref().unwrap_or(""),
            PatientField::LastName => &self.last_name,
            PatientField::Dob => &self.dob,
            PatientField::Gender => &self.gender,
            PatientField::Phone => &self.phone,
            PatientField::Email => &self.email,
            PatientField::Address => &self.address,
            PatientField::Language => &self.language,
            PatientField::Nationality => &self.nationality,
            PatientField::Religion => self.religion.as_deref().unwrap_or(""),
            PatientField::EmergencyName => self.emergency_name.as_deref().unwrap_or(""),
            PatientField::EmergencyRelation => self.emergency_relation.as_deref().unwrap_or(""),
        }
    }

    /// Overwrites a field. Status is left untouched.
    pub fn set(&mut self, field: PatientField, value: impl Into<String>) {
        let value = value.into();
        match field {
            PatientField::FirstName => self.first_name = value,
            PatientField::MiddleName => self.middle_name = Some(value),
            PatientField::LastName => self.last_name = value,
            PatientField::Dob => self.dob = value,
            PatientField::Gender => self.gender = value,
            PatientField::Phone => self.phone = value,
            PatientField::Email => self.email = value,
            PatientField::Address => self.address = value,
            PatientField::Language => self.language = value,
            PatientField::Nationality => self.nationality = value,
            PatientField::Religion => self.religion = Some(value),
            PatientField::EmergencyName => self.emergency_name = Some(value),
            PatientField::EmergencyRelation => self.emergency_relation = Some(value),
        }
    }

    /// Returns true if the field holds a non-empty value.
    #[must_use]
    pub fn is_filled(&self, field: PatientField) -> bool {
        !self.get(field).is_empty()
    }

    /// Copies every field value from `other`, leaving status untouched.
    pub fn copy_fields_from(&mut self, other: &Self) {
        let status = self.status;
        *self = other.clone();
        self.status = status;
    }

    /// `(field, value)` pairs for every non-empty field, in form order.
    #[must_use]
    pub fn filled_fields(&self) -> Vec<(PatientField, &str)> {
        PatientField::ALL
            .iter()
            .copied()
            .filter(|f| self.is_filled(*f))
            .map(|f| (f, self.get(f)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_roundtrip_through_from_str() {
        for field in PatientField::ALL {
            assert_eq!(field.as_str().parse::<PatientField>().unwrap(), field);
        }
        let err = "shoeSize".parse::<PatientField>().unwrap_err();
        assert_eq!(err, ValidationError::UnknownField { name: "shoeSize".to_string() });
    }

    #[test]
    fn new_record_is_empty_and_active() {
        let record = PatientRecord::new();
        assert_eq!(record.status, PatientStatus::Active);
        assert!(PatientField::ALL.iter().all(|f| !record.is_filled(*f)));
        assert!(record.filled_fields().is_empty());
    }

    #[test]
    fn set_and_get_optional_field() {
        let mut record = PatientRecord::new();
        assert_eq!(record.get(PatientField::Religion), "");
        record.set(PatientField::Religion, "Buddhist");
        assert_eq!(record.religion.as_deref(), Some("Buddhist"));
        assert!(record.is_filled(PatientField::Religion));
    }

    #[test]
    fn wire_shape_uses_camel_case_and_skips_unset_optionals() {
        let mut record = PatientRecord::new();
        record.set(PatientField::FirstName, "Ada");
        record.set(PatientField::EmergencyName, "Byron");
        let v = serde_json::to_value(&record).unwrap();

        assert_eq!(v["firstName"], "Ada");
        assert_eq!(v["emergencyName"], "Byron");
        assert_eq!(v["status"], "active");
        assert!(v.get("middleName").is_none());
        assert!(v.get("religion").is_none());
    }

    #[test]
    fn deserializes_partial_form_payload() {
        let record: PatientRecord =
            serde_json::from_str(r#"{"firstName":"Ada","status":"inactive"}"#).unwrap();
        assert_eq!(record.first_name, "Ada");
        assert_eq!(record.last_name, "");
        assert_eq!(record.status, PatientStatus::Inactive);
    }

    #[test]
    fn copy_fields_keeps_status() {
        let mut target = PatientRecord::new();
        target.status = PatientStatus::Inactive;

        let mut source = PatientRecord::new();
        source.set(PatientField::Phone, "+66 2 123 4567");
        source.status = PatientStatus::Submitted;

        target.copy_fields_from(&source);
        assert_eq!(target.phone, "+66 2 123 4567");
        assert_eq!(target.status, PatientStatus::Inactive);
    }

    #[test]
    fn session_id_from_key_is_stable() {
        assert_eq!(SessionId::from_key("desk-1"), SessionId::from_key("desk-1"));
        assert_ne!(SessionId::from_key("desk-1"), SessionId::from_key("desk-2"));
        let parsed: SessionId = SessionId::from_key("desk-1").to_string().parse().unwrap();
        assert_eq!(parsed, SessionId::from_key("desk-1"));
    }
}
