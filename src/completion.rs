//! Required-field configuration and the completion percentage.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::record::{PatientField, PatientRecord};

/// The fields that count towards completion.
///
/// # Examples
///
/// ```
/// use intake_relay::{PatientField, PatientRecord, RequiredFields};
///
/// let required = RequiredFields::dashboard();
/// let mut record = PatientRecord::new();
/// record.set(PatientField::FirstName, "Ada");
/// record.set(PatientField::LastName, "Lovelace");
/// record.set(PatientField::Phone, "0812345678");
/// assert_eq!(required.completion_percentage(&record), 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredFields {
    fields: Vec<PatientField>,
}

impl Default for RequiredFields {
    fn default() -> Self {
        Self::dashboard()
    }
}

impl RequiredFields {
    /// An explicit required set.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` if the set is empty or names a field
    /// twice.
    pub fn new(fields: impl IntoIterator<Item = PatientField>) -> Result<Self, ValidationError> {
        let fields: Vec<PatientField> = fields.into_iter().collect();
        if fields.is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "required field set must not be empty".to_string(),
            });
        }
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(*field) {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("required field '{field}' listed twice"),
                });
            }
        }
        Ok(Self { fields })
    }

    /// Parses wire field names, e.g. from a command line.
    pub fn parse<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, ValidationError> {
        let fields = names
            .into_iter()
            .map(|n| n.trim().parse::<PatientField>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields)
    }

    /// Staff dashboard set: first name, last name, date of birth, gender, phone.
    #[must_use]
    pub fn dashboard() -> Self {
        Self {
            fields: vec![
                PatientField::FirstName,
                PatientField::LastName,
                PatientField::Dob,
                PatientField::Gender,
                PatientField::Phone,
            ],
        }
    }

    /// Registration set: every field the intake form requires before submit.
    #[must_use]
    pub fn registration() -> Self {
        Self {
            fields: vec![
                PatientField::FirstName,
                PatientField::LastName,
                PatientField::Dob,
                PatientField::Gender,
                PatientField::Phone,
                PatientField::Email,
                PatientField::Address,
                PatientField::Language,
                PatientField::Nationality,
            ],
        }
    }

    /// The configured fields.
    #[must_use]
    pub fn fields(&self) -> &[PatientField] {
        &self.fields
    }

    /// Required fields holding a non-empty value.
    #[must_use]
    pub fn filled(&self, record: &PatientRecord) -> usize {
        self.fields.iter().filter(|f| record.is_filled(**f)).count()
    }

    /// Required fields still empty, in configured order.
    #[must_use]
    pub fn missing(&self, record: &PatientRecord) -> Vec<PatientField> {
        self.fields.iter().copied().filter(|f| !record.is_filled(*f)).collect()
    }

    /// `round(100 * filled / total)`, halves rounded up.
    #[must_use]
    pub fn completion_percentage(&self, record: &PatientRecord) -> u8 {
        let total = self.fields.len();
        if total == 0 {
            return 0;
        }
        let filled = self.filled(record);
        let pct = (200 * filled + total) / (2 * total);
        u8::try_from(pct).unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(fields: &[PatientField]) -> PatientRecord {
        let mut r = PatientRecord::new();
        for f in fields {
            r.set(*f, "x");
        }
        r
    }

    #[test]
    fn three_of_five_is_sixty() {
        let r = record_with(&[PatientField::FirstName, PatientField::Dob, PatientField::Phone]);
        assert_eq!(RequiredFields::dashboard().completion_percentage(&r), 60);
    }

    #[test]
    fn empty_and_full_records() {
        let required = RequiredFields::registration();
        assert_eq!(required.completion_percentage(&PatientRecord::new()), 0);
        let full = record_with(required.fields());
        assert_eq!(required.completion_percentage(&full), 100);
    }

    #[test]
    fn rounds_half_up() {
        // 1 of 8 = 12.5 -> 13; 1 of 3 = 33.3 -> 33; 2 of 3 = 66.7 -> 67
        let eight = RequiredFields::new(PatientField::ALL[..8].iter().copied()).unwrap();
        assert_eq!(eight.completion_percentage(&record_with(&[PatientField::FirstName])), 13);

        let three = RequiredFields::new([PatientField::FirstName, PatientField::LastName, PatientField::Dob]).unwrap();
        assert_eq!(three.completion_percentage(&record_with(&[PatientField::Dob])), 33);
        assert_eq!(
            three.completion_percentage(&record_with(&[PatientField::Dob, PatientField::LastName])),
            67
        );
    }

    #[test]
    fn non_required_fields_do_not_count() {
        let r = record_with(&[PatientField::Religion, PatientField::Email]);
        assert_eq!(RequiredFields::dashboard().completion_percentage(&r), 0);
        assert_eq!(RequiredFields::dashboard().missing(&r).len(), 5);
    }

    #[test]
    fn rejects_empty_and_duplicate_sets() {
        assert!(RequiredFields::new(Vec::new()).is_err());
        assert!(RequiredFields::new([PatientField::Phone, PatientField::Phone]).is_err());
    }

    #[test]
    fn parses_wire_names() {
        let required = RequiredFields::parse(["firstName", " phone "]).unwrap();
        assert_eq!(required.fields(), &[PatientField::FirstName, PatientField::Phone]);
        assert!(matches!(
            RequiredFields::parse(["shoeSize"]),
            Err(ValidationError::UnknownField { .. })
        ));
    }
}
