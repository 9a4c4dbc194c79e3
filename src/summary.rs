//! Intake summary generation through an external text generator.
//!
//! The summary path is read-only: it takes a record, builds a prompt, and
//! asks a [`SummaryGenerator`] for one paragraph. It never touches the
//! record store or the channel, and any failure degrades to
//! [`SUMMARY_PLACEHOLDER`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::CollaboratorError;
use crate::record::PatientRecord;

/// Text returned when no summary could be generated.
pub const SUMMARY_PLACEHOLDER: &str = "Error generating summary.";

const SYSTEM_PROMPT: &str = "You generate concise hospital registration notes in a single professional \
paragraph without greetings, bullet points, or formatting.";

const INSTRUCTIONS: &str = "You are a hospital intake assistant.

Based on the patient data below, write a realistic, professional medical intake summary in a natural \
paragraph format (not bullet points and not section headings).

The summary should read like a clinician's note and flow naturally in complete sentences.

Guidelines:
- Begin by introducing the patient with name, age, gender, and nationality if available.
- Include contact details naturally in sentence form.
- Include all information from the patient data without listing fields; weave the details into a coherent narrative.
- Keep the tone clinical and professional.
- Do not use headings, bullet points, or labels.
- Write everything as one cohesive paragraph.";

/// One request to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    /// System instruction.
    pub system: String,
    /// User prompt including the serialized record.
    pub prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
}

/// External text generator (request/response).
pub trait SummaryGenerator: Send + Sync {
    /// Produces the summary text for `request`.
    fn generate(&self, request: &SummaryRequest) -> Result<String, CollaboratorError>;
}

impl<F> SummaryGenerator for F
where
    F: Fn(&SummaryRequest) -> Result<String, CollaboratorError> + Send + Sync,
{
    fn generate(&self, request: &SummaryRequest) -> Result<String, CollaboratorError> {
        self(request)
    }
}

/// Builds prompts and shields callers from generator failures.
#[derive(Clone)]
pub struct SummaryService {
    generator: Arc<dyn SummaryGenerator>,
    temperature: f32,
    max_tokens: u32,
}

impl std::fmt::Debug for SummaryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryService")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl SummaryService {
    /// Wraps a generator with the default sampling settings.
    #[must_use]
    pub fn new(generator: Arc<dyn SummaryGenerator>) -> Self {
        Self {
            generator,
            temperature: 0.3,
            max_tokens: 400,
        }
    }

    /// Overrides the sampling settings.
    #[must_use]
    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Builds the generator request for `record`.
    ///
    /// # Errors
    /// `CollaboratorError::Summary` if the record cannot be serialized.
    pub fn request_for(&self, record: &PatientRecord) -> Result<SummaryRequest, CollaboratorError> {
        let data = serde_json::to_string_pretty(record).map_err(|e| CollaboratorError::Summary {
            message: format!("failed to serialize record: {e}"),
        })?;
        Ok(SummaryRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: format!("{INSTRUCTIONS}\n\n{data}\n"),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }

    /// Generates a summary, surfacing failures.
    ///
    /// A blank response counts as a failure.
    pub fn try_summarize(&self, record: &PatientRecord) -> Result<String, CollaboratorError> {
        let request = self.request_for(record)?;
        let text = self.generator.generate(&request)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(CollaboratorError::Summary {
                message: "generator returned an empty summary".to_string(),
            });
        }
        debug!(chars = text.len(), "summary generated");
        Ok(text.to_string())
    }

    /// Generates a summary, or [`SUMMARY_PLACEHOLDER`] on any failure.
    #[must_use]
    pub fn summarize(&self, record: &PatientRecord) -> String {
        match self.try_summarize(record) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "summary generation failed");
                SUMMARY_PLACEHOLDER.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PatientField;
    use std::sync::Mutex;

    fn generator<F>(f: F) -> Arc<dyn SummaryGenerator>
    where
        F: Fn(&SummaryRequest) -> Result<String, CollaboratorError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn record() -> PatientRecord {
        let mut r = PatientRecord::new();
        r.set(PatientField::FirstName, "Ada");
        r.set(PatientField::Nationality, "British");
        r
    }

    #[test]
    fn prompt_embeds_the_record() {
        let service = SummaryService::new(generator(|_| Ok("ok".to_string())));
        let request = service.request_for(&record()).unwrap();
        assert!(request.prompt.contains("\"firstName\": \"Ada\""));
        assert!(request.prompt.contains("one cohesive paragraph"));
        assert_eq!(request.max_tokens, 400);
    }

    #[test]
    fn successful_generation_is_trimmed() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in = Arc::clone(&seen);
        let service = SummaryService::new(generator(move |req| {
            *seen_in.lock().unwrap() = Some(req.temperature);
            Ok("  Ada is a British patient.\n".to_string())
        }))
        .with_sampling(0.5, 200);

        assert_eq!(service.summarize(&record()), "Ada is a British patient.");
        assert_eq!(*seen.lock().unwrap(), Some(0.5));
    }

    #[test]
    fn failure_degrades_to_placeholder() {
        let service = SummaryService::new(generator(|_| {
            Err(CollaboratorError::Summary {
                message: "upstream 503".to_string(),
            })
        }));
        assert_eq!(service.summarize(&record()), SUMMARY_PLACEHOLDER);
        assert!(service.try_summarize(&record()).is_err());
    }

    #[test]
    fn blank_response_is_a_failure() {
        let service = SummaryService::new(generator(|_| Ok("   ".to_string())));
        assert_eq!(service.summarize(&record()), SUMMARY_PLACEHOLDER);
    }
}
