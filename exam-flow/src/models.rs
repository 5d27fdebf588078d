use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Patient header as read from the document. Not an identity yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "birthdate")]
    pub birth_date: Option<String>,
    #[serde(default, alias = "collectiondate")]
    pub collection_date: Option<String>,
    #[serde(default, alias = "requestingphysician")]
    pub requesting_physician: Option<String>,
}

/// One measured parameter read from the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamObservation {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub exam_type: String,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, alias = "referencemin")]
    pub reference_min: Option<Decimal>,
    #[serde(default, alias = "referencemax")]
    pub reference_max: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub observations: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub patient: Option<PatientInfo>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub exams: Vec<ExamObservation>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Non-fatal data quality finding attached to a field path such as `exams[2].value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub current_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn add_warning(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        current_value: Option<String>,
    ) {
        self.warnings.push(ValidationWarning {
            field: field.into(),
            message: message.into(),
            current_value,
        });
    }

    /// Warnings reported for exactly `field`.
    pub fn warnings_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ValidationWarning> {
        self.warnings.iter().filter(move |w| w.field == field)
    }
}

/// Timing and counters collected while a document moves through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Keyed by step name; a step that never ran has no entry.
    pub step_durations: BTreeMap<String, Duration>,
    pub extracted_exams: usize,
    pub normalized_exams: usize,
    pub validation_warnings: usize,
}

impl ProcessingStats {
    pub fn started_now() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            step_durations: BTreeMap::new(),
            extracted_exams: 0,
            normalized_exams: 0,
            validation_warnings: 0,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at
            .map(|completed| completed - self.started_at)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

/// Envelope returned by the pipeline: either success with data or failure with a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    pub extracted_text_length: usize,
    pub data: Option<ExtractionResult>,
    pub validation: Option<ValidationResult>,
    pub stats: ProcessingStats,
}

impl PipelineResult {
    pub fn started(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            success: false,
            error_message: None,
            file_name: file_name.into(),
            file_size,
            extracted_text_length: 0,
            data: None,
            validation: None,
            stats: ProcessingStats::started_now(),
        }
    }
}
