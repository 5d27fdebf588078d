//! ExamPipeline: the single sequencing contract of the crate.
//!
//! A document goes through four stages, strictly in order and never in parallel:
//!
//! 1. **parse**: raw bytes to text through the [`TextExtractionRouter`]
//! 2. **extract**: text to [`ExtractionResult`] through the [`StructuredExtractor`]
//! 3. **validate**: advisory warnings from the [`ConsistencyValidator`]
//! 4. **normalize**: canonical exam names from the [`NameNormalizer`]
//!
//! The first failing stage ends the run. The returned [`PipelineResult`] is then
//! unsuccessful, carries a stage-prefixed message and only the timings of the
//! stages that completed. Validation warnings never fail a run.
//!
//! Validation and normalization cannot fail: both are total functions over an
//! [`ExtractionResult`], so only the first two stages have error prefixes.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::extractor::StructuredExtractor;
use crate::models::{ExtractionResult, PipelineResult};
use crate::normalizer::NameNormalizer;
use crate::router::TextExtractionRouter;
use crate::validator::ConsistencyValidator;

/// Keys of [`ProcessingStats::step_durations`](crate::models::ProcessingStats).
pub mod steps {
    pub const PARSE: &str = "1_parse";
    pub const EXTRACT: &str = "2_extract";
    pub const VALIDATE: &str = "3_validate";
    pub const NORMALIZE: &str = "4_normalize";
}

#[derive(Clone)]
pub struct ExamPipeline {
    router: Arc<TextExtractionRouter>,
    extractor: StructuredExtractor,
    validator: ConsistencyValidator,
    normalizer: NameNormalizer,
}

impl ExamPipeline {
    pub fn new(router: Arc<TextExtractionRouter>, extractor: StructuredExtractor) -> Self {
        Self {
            router,
            extractor,
            validator: ConsistencyValidator::new(),
            normalizer: NameNormalizer::new(),
        }
    }

    pub fn router(&self) -> &TextExtractionRouter {
        &self.router
    }

    /// Run the four stages over `content`. Never returns an error: failures are
    /// reported inside the result.
    pub async fn process(
        &self,
        content: &[u8],
        file_name: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let mut result = PipelineResult::started(file_name, content.len() as u64);

        info!(file_name = %file_name, size = content.len(), "Starting document processing");

        // 1. parse
        let step = Instant::now();
        let text = match self.router.extract_text(content, file_name, cancel).await {
            Ok(text) => text,
            Err(e) => return fail(result, format!("Parse error: {}", e)),
        };
        result.stats.step_durations.insert(steps::PARSE.to_string(), step.elapsed());
        result.extracted_text_length = text.chars().count();

        if text.trim().is_empty() {
            warn!(file_name = %file_name, "Document produced no text");
        }

        // 2. extract
        let step = Instant::now();
        let extraction: ExtractionResult = match self.extractor.extract(&text, cancel).await {
            Ok(extraction) => extraction,
            Err(e) => return fail(result, format!("Extraction error: {}", e)),
        };
        result.stats.step_durations.insert(steps::EXTRACT.to_string(), step.elapsed());
        result.stats.extracted_exams = extraction.exams.len();

        // 3. validate
        let step = Instant::now();
        let validation = self.validator.validate(&extraction);
        result.stats.step_durations.insert(steps::VALIDATE.to_string(), step.elapsed());
        result.stats.validation_warnings = validation.warnings.len();
        result.validation = Some(validation);

        // 4. normalize
        let step = Instant::now();
        let normalized = self.normalizer.normalize(extraction);
        result.stats.step_durations.insert(steps::NORMALIZE.to_string(), step.elapsed());
        result.stats.normalized_exams = normalized.exams.len();

        result.data = Some(normalized);
        result.success = true;
        result.stats.completed_at = Some(Utc::now());

        info!(
            file_name = %file_name,
            exams = result.stats.normalized_exams,
            warnings = result.stats.validation_warnings,
            duration_ms = result.stats.duration().num_milliseconds(),
            "Document processed"
        );

        result
    }
}

fn fail(mut result: PipelineResult, message: String) -> PipelineResult {
    error!(file_name = %result.file_name, "Document processing failed: {}", message);
    result.success = false;
    result.data = None;
    result.error_message = Some(message);
    result.stats.completed_at = Some(Utc::now());
    result
}
