//! Submission validation.
//!
//! Edits are never validated; only the transition to `submitted` is gated.
//! Validators report every failing field at once so the form can show all
//! messages together.

use regex::Regex;

use crate::error::{FieldIssue, ValidationError};
use crate::record::{PatientField, PatientRecord};

/// Phone numbers: digits, spaces, `+`, `-` and parentheses.
pub const PHONE_PATTERN: &str = r"^[0-9+\-() ]+$";

// Local part of letters, digits and `_'+-.`, then a dotted domain with an
// alphabetic TLD. Leading dots and `..` are rejected separately.
const EMAIL_PATTERN: &str = r"^[A-Za-z0-9_'+\-.]*[A-Za-z0-9_+\-]@([A-Za-z0-9][A-Za-z0-9\-]*\.)+[A-Za-z]{2,}$";

/// Decides whether a record may be submitted.
pub trait SubmissionValidator: Send + Sync {
    /// Every field-level problem with `record`; empty means valid.
    fn issues(&self, record: &PatientRecord) -> Vec<FieldIssue>;

    /// `Ok` if the record may be submitted.
    ///
    /// # Errors
    /// `ValidationError::Submission` listing every failing field.
    fn check(&self, record: &PatientRecord) -> Result<(), ValidationError> {
        let issues = self.issues(record);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Submission { issues })
        }
    }
}

/// Validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SubmissionValidator for AcceptAll {
    fn issues(&self, _record: &PatientRecord) -> Vec<FieldIssue> {
        Vec::new()
    }
}

/// The intake form's rules.
///
/// - first name, last name, date of birth, gender, address, language and
///   nationality must be non-empty
/// - phone must match [`PHONE_PATTERN`]
/// - email must be a plausible address
#[derive(Debug, Clone)]
pub struct IntakeFormValidator {
    phone: Regex,
    email: Regex,
}

const NON_EMPTY: [(PatientField, &str); 7] = [
    (PatientField::FirstName, "First name required"),
    (PatientField::LastName, "Last name required"),
    (PatientField::Dob, "Date of birth required"),
    (PatientField::Gender, "Gender required"),
    (PatientField::Address, "Address required"),
    (PatientField::Language, "Preferred language required"),
    (PatientField::Nationality, "Nationality required"),
];

impl IntakeFormValidator {
    /// Builds the validator with the standard phone rule.
    pub fn new() -> Result<Self, ValidationError> {
        Self::with_phone_pattern(PHONE_PATTERN)
    }

    /// Builds the validator with a custom phone rule.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` if `pattern` is not a valid regex.
    pub fn with_phone_pattern(pattern: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            phone: compile(pattern)?,
            email: compile(EMAIL_PATTERN)?,
        })
    }

    fn is_email(&self, value: &str) -> bool {
        !value.starts_with('.') && !value.contains("..") && self.email.is_match(value)
    }
}

impl SubmissionValidator for IntakeFormValidator {
    fn issues(&self, record: &PatientRecord) -> Vec<FieldIssue> {
        // Walk the form in order so issues come back in display order.
        PatientField::ALL
            .iter()
            .filter_map(|field| match field {
                PatientField::Phone => (!self.phone.is_match(&record.phone)).then(|| issue(*field, "Invalid phone")),
                PatientField::Email => (!self.is_email(&record.email)).then(|| issue(*field, "Invalid email")),
                _ => NON_EMPTY
                    .iter()
                    .find(|(required, _)| required == field)
                    .filter(|_| !record.is_filled(*field))
                    .map(|(_, message)| issue(*field, message)),
            })
            .collect()
    }
}

fn issue(field: PatientField, message: &str) -> FieldIssue {
    FieldIssue {
        field: field.as_str().to_string(),
        message: message.to_string(),
    }
}

fn compile(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::InvalidConfig {
        reason: format!("invalid regex '{pattern}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> PatientRecord {
        let mut r = PatientRecord::new();
        r.set(PatientField::FirstName, "Ada");
        r.set(PatientField::LastName, "Lovelace");
        r.set(PatientField::Dob, "1815-12-10");
        r.set(PatientField::Gender, "Female");
        r.set(PatientField::Phone, "+44 (20) 7946-0958");
        r.set(PatientField::Email, "ada@analytical.engine.org");
        r.set(PatientField::Address, "12 St James's Square");
        r.set(PatientField::Language, "English");
        r.set(PatientField::Nationality, "British");
        r
    }

    fn fields(issues: &[FieldIssue]) -> Vec<&str> {
        issues.iter().map(|i| i.field.as_str()).collect()
    }

    #[test]
    fn complete_record_passes() {
        let v = IntakeFormValidator::new().unwrap();
        assert!(v.check(&valid_record()).is_ok());
    }

    #[test]
    fn empty_record_lists_every_problem_in_form_order() {
        let v = IntakeFormValidator::new().unwrap();
        let issues = v.issues(&PatientRecord::new());
        assert_eq!(
            fields(&issues),
            vec!["firstName", "lastName", "dob", "gender", "phone", "email", "address", "language", "nationality"]
        );
    }

    #[test]
    fn phone_rule() {
        let v = IntakeFormValidator::new().unwrap();
        let mut r = valid_record();
        r.set(PatientField::Phone, "081-234 5678");
        assert!(v.check(&r).is_ok());
        r.set(PatientField::Phone, "call me");
        assert_eq!(fields(&v.issues(&r)), vec!["phone"]);
    }

    #[test]
    fn email_rule() {
        let v = IntakeFormValidator::new().unwrap();
        let mut r = valid_record();
        for bad in ["ada", "ada@", "@x.org", ".ada@x.org", "a..b@x.org", "ada@x"] {
            r.set(PatientField::Email, bad);
            assert_eq!(fields(&v.issues(&r)), vec!["email"], "{bad}");
        }
        r.set(PatientField::Email, "first.last+tag@mail.example.co");
        assert!(v.check(&r).is_ok());
    }

    #[test]
    fn optional_fields_are_not_required() {
        let v = IntakeFormValidator::new().unwrap();
        let r = valid_record();
        assert!(r.middle_name.is_none());
        assert!(v.check(&r).is_ok());
    }

    #[test]
    fn bad_custom_pattern_is_a_config_error() {
        assert!(matches!(
            IntakeFormValidator::with_phone_pattern("(["),
            Err(ValidationError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn accept_all_accepts_empty_record() {
        assert!(AcceptAll.check(&PatientRecord::new()).is_ok());
    }
}
