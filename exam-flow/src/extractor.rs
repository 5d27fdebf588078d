use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExtractionError, GenerationError, PayloadError};
use crate::generation::{GenerationOptions, TextGenerator};
use crate::models::ExtractionResult;
use crate::payload::{locate_json_payload, parse_extraction_payload};

const EXTRACTION_INSTRUCTIONS: &str = r#"You are an assistant specialized in extracting information from medical documents.

Analyze the text of a medical exam report and extract the following information as JSON.

1. Patient information (use these exact keys):
   - patient: object with
     - name: full patient name
     - birthDate: birth date (format YYYY-MM-DD, or null if not found)
     - collectionDate: date the sample was collected (format YYYY-MM-DD)
     - requestingPhysician: name of the physician who requested the exam

2. Exams performed (use these exact keys):
   - exams: array of objects, each with
     - type: exam or parameter name (e.g. "Colesterol Total", "Glicemia", "Hemoglobina")
     - value: numeric result (number only, no unit)
     - unit: unit of measure (e.g. "mg/dL", "g/dL", "%")
     - referenceMin: lower bound of the reference range (number or null)
     - referenceMax: upper bound of the reference range (number or null)
     - status: interpretation of the result ("normal", "low", "high", "critical", or null)
     - observations: any additional remark (or null)

IMPORTANT:
- Return ONLY valid JSON, with no additional text
- Use the keys EXACTLY as specified above
- Use null when a piece of information is not available
- Dates use the format YYYY-MM-DD
- Numbers use a dot as decimal separator (5.2, never 5,2)
- For status, compare the value against the reference range
- Include every exam found in the document
- The JSON must have exactly this structure:

{
  "patient": {
    "name": "string or null",
    "birthDate": "YYYY-MM-DD or null",
    "collectionDate": "YYYY-MM-DD",
    "requestingPhysician": "string or null"
  },
  "exams": [
    {
      "type": "string",
      "value": number or null,
      "unit": "string or null",
      "referenceMin": number or null,
      "referenceMax": number or null,
      "status": "normal|low|high|critical or null",
      "observations": "string or null"
    }
  ]
}"#;

/// Tuning for the extraction round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub temperature: f64,
    pub max_output_tokens: u32,
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_output_tokens: 4096,
            max_retries: 1,
            retry_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Turns document text into an [`ExtractionResult`] through a text-generation service.
#[derive(Clone)]
pub struct StructuredExtractor {
    generator: Arc<dyn TextGenerator>,
    config: ExtractorConfig,
}

enum AttemptError {
    Generation(GenerationError),
    Payload(PayloadError),
}

impl StructuredExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, config: ExtractorConfig) -> Self {
        Self { generator, config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub async fn extract(
        &self,
        document_text: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, ExtractionError> {
        if document_text.trim().is_empty() {
            return Err(ExtractionError::EmptyInput);
        }

        info!(
            chars = document_text.chars().count(),
            "Starting structured extraction"
        );
        debug!("Document text sent to model: {}", preview(document_text, 300));

        let prompt = build_prompt(document_text);
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(attempt, max_attempts, "Extraction attempt");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
                outcome = self.attempt(&prompt) => outcome,
            };

            let failure = match outcome {
                Ok(result) => {
                    info!(
                        exam_count = result.exams.len(),
                        patient = result
                            .patient
                            .as_ref()
                            .and_then(|p| p.name.as_deref())
                            .unwrap_or("N/A"),
                        "Extraction successful"
                    );
                    return Ok(result);
                }
                Err(failure) => failure,
            };

            if attempt >= max_attempts {
                error!(attempts = attempt, "Extraction failed, retry budget exhausted");
                return Err(match failure {
                    AttemptError::Payload(source) => ExtractionError::MalformedOutput {
                        attempts: attempt,
                        source,
                    },
                    AttemptError::Generation(source) => ExtractionError::Generation {
                        attempts: attempt,
                        source,
                    },
                });
            }

            match &failure {
                AttemptError::Payload(e) => {
                    warn!(attempt, max_attempts, "Failed to parse model output: {}", e)
                }
                AttemptError::Generation(e) => {
                    warn!(attempt, max_attempts, "Text generation failed: {}", e)
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    async fn attempt(&self, prompt: &str) -> Result<ExtractionResult, AttemptError> {
        let options = GenerationOptions {
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        };

        let response = tokio::time::timeout(
            self.config.request_timeout,
            self.generator.generate(prompt, &options),
        )
        .await
        .map_err(|_| AttemptError::Generation(GenerationError::Timeout(self.config.request_timeout)))?
        .map_err(AttemptError::Generation)?;

        debug!(
            chars = response.chars().count(),
            "Model raw response: {}",
            preview(&response, 500)
        );

        parse_extraction_payload(locate_json_payload(&response)).map_err(AttemptError::Payload)
    }
}

/// Instructions followed by the document text.
pub fn build_prompt(document_text: &str) -> String {
    format!(
        "{}\n\nAnalyze the following medical document text and extract the information as JSON:\n\n```\n{}\n```\n\nReturn only the structured JSON as instructed.",
        EXTRACTION_INSTRUCTIONS, document_text
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedGenerator;

    const VALID_RESPONSE: &str = r#"```json
{"patient": {"name": "Maria Silva", "collectionDate": "2024-03-10"},
 "exams": [{"type": "HDL", "value": 45, "unit": "mg/dL"}]}
```"#;

    fn fast_config() -> ExtractorConfig {
        ExtractorConfig {
            retry_delay: Duration::from_millis(1),
            ..ExtractorConfig::default()
        }
    }

    fn extractor(generator: Arc<ScriptedGenerator>) -> StructuredExtractor {
        StructuredExtractor::new(generator, fast_config())
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_calling_the_model() {
        let generator = Arc::new(ScriptedGenerator::repeating(VALID_RESPONSE, 1));
        let err = extractor(generator.clone())
            .extract("   \n", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::EmptyInput));
        assert_eq!(generator.calls().await, 0);
    }

    #[tokio::test]
    async fn prompt_embeds_instructions_and_document_text() {
        let generator = Arc::new(ScriptedGenerator::repeating(VALID_RESPONSE, 1));
        let result = extractor(generator.clone())
            .extract("HDL 45 mg/dL", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exams.len(), 1);

        let prompts = generator.prompts().await;
        assert!(prompts[0].contains("requestingPhysician"));
        assert!(prompts[0].contains("HDL 45 mg/dL"));
    }

    #[tokio::test]
    async fn malformed_output_is_retried_once() {
        let generator = Arc::new(ScriptedGenerator::new([
            Ok("Sorry, I cannot help with that.".to_string()),
            Ok(VALID_RESPONSE.to_string()),
        ]));
        let result = extractor(generator.clone())
            .extract("HDL 45 mg/dL", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exams[0].exam_type, "HDL");
        assert_eq!(generator.calls().await, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_report_malformed_output() {
        let generator = Arc::new(ScriptedGenerator::repeating("{ not json", 5));
        let err = extractor(generator.clone())
            .extract("HDL 45 mg/dL", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedOutput { attempts: 2, .. }));
        assert_eq!(generator.calls().await, 2);
    }

    #[tokio::test]
    async fn service_failures_share_the_retry_budget() {
        let generator = Arc::new(ScriptedGenerator::new([
            Err(GenerationError::Connection("http://localhost:11434".into())),
            Err(GenerationError::Connection("http://localhost:11434".into())),
            Ok(VALID_RESPONSE.to_string()),
        ]));
        let err = extractor(generator.clone())
            .extract("HDL 45 mg/dL", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Generation {
                attempts: 2,
                source: GenerationError::Connection(_)
            }
        ));
        assert_eq!(generator.calls().await, 2);
    }

    #[tokio::test]
    async fn mixed_failures_surface_the_last_cause() {
        let generator = Arc::new(ScriptedGenerator::new([
            Err(GenerationError::Connection("http://localhost:11434".into())),
            Ok("still not json".to_string()),
        ]));
        let err = extractor(generator)
            .extract("HDL 45 mg/dL", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedOutput { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_before_calling_the_model() {
        let generator = Arc::new(ScriptedGenerator::repeating(VALID_RESPONSE, 1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extractor(generator.clone())
            .extract("HDL 45 mg/dL", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Cancelled));
        assert_eq!(generator.calls().await, 0);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("Hemácias", 4), "Hemá...");
        assert_eq!(preview("TSH", 10), "TSH");
    }
}
