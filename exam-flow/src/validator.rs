use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::models::{ExamObservation, ExtractionResult, PatientInfo, ValidationResult};

/// Status values the extractor is asked to produce.
pub const VALID_STATUSES: &[&str] = &["normal", "low", "high", "critical"];

/// Values above this are more likely an extraction slip than a measurement.
const IMPLAUSIBLE_VALUE: i64 = 1_000_000;

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").expect("static ISO date pattern is valid")
});

/// Rule engine producing advisory warnings. It never fails and never mutates its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyValidator;

impl ConsistencyValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, extraction: &ExtractionResult) -> ValidationResult {
        let mut result = ValidationResult::new();

        info!("Starting validation of extraction result");

        match &extraction.patient {
            Some(patient) => validate_patient(patient, &mut result),
            None => result.add_warning("patient", "No patient information was extracted", None),
        }

        if extraction.exams.is_empty() {
            result.add_warning("exams", "No exams were extracted from the document", None);
        } else {
            for (index, exam) in extraction.exams.iter().enumerate() {
                validate_exam(exam, index, &mut result);
            }
        }

        info!(
            warning_count = result.warnings.len(),
            "Validation completed"
        );
        for warning in &result.warnings {
            warn!(
                field = %warning.field,
                value = warning.current_value.as_deref().unwrap_or("null"),
                "Validation warning: {}",
                warning.message
            );
        }

        result
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

fn validate_patient(patient: &PatientInfo, result: &mut ValidationResult) {
    match patient.name.as_deref() {
        Some(name) if !name.trim().is_empty() => {
            if name.chars().count() < 3 {
                result.add_warning("patient.name", "Patient name is too short", Some(name.to_string()));
            }
        }
        _ => result.add_warning("patient.name", "Patient name is empty", None),
    }

    if let Some(birth_date) = patient.birth_date.as_deref().filter(|d| !d.trim().is_empty()) {
        if !is_valid_iso_date(birth_date) {
            result.add_warning(
                "patient.birthDate",
                "Birth date has an invalid format (expected YYYY-MM-DD)",
                Some(birth_date.to_string()),
            );
        }
    }

    match patient.collection_date.as_deref() {
        Some(collection_date) if !collection_date.trim().is_empty() => {
            if !is_valid_iso_date(collection_date) {
                result.add_warning(
                    "patient.collectionDate",
                    "Collection date has an invalid format (expected YYYY-MM-DD)",
                    Some(collection_date.to_string()),
                );
            }
        }
        _ => result.add_warning("patient.collectionDate", "Collection date was not provided", None),
    }

    if is_blank(patient.requesting_physician.as_deref()) {
        result.add_warning(
            "patient.requestingPhysician",
            "Requesting physician was not provided",
            None,
        );
    }
}

fn validate_exam(exam: &ExamObservation, index: usize, result: &mut ValidationResult) {
    let prefix = format!("exams[{}]", index);

    if exam.exam_type.trim().is_empty() {
        result.add_warning(format!("{prefix}.type"), "Exam type is empty", None);
    } else if exam.exam_type.chars().count() < 3 {
        result.add_warning(
            format!("{prefix}.type"),
            "Exam type is too short",
            Some(exam.exam_type.clone()),
        );
    }

    match exam.value {
        Some(value) => {
            if value < Decimal::ZERO {
                result.add_warning(
                    format!("{prefix}.value"),
                    "Negative numeric value may be invalid",
                    Some(value.to_string()),
                );
            }
            if value > Decimal::from(IMPLAUSIBLE_VALUE) {
                result.add_warning(
                    format!("{prefix}.value"),
                    "Numeric value is very high and may be an extraction error",
                    Some(value.to_string()),
                );
            }
        }
        None => result.add_warning(format!("{prefix}.value"), "Exam value was not provided", None),
    }

    if is_blank(exam.unit.as_deref()) {
        result.add_warning(format!("{prefix}.unit"), "Unit of measure was not provided", None);
    }

    match (exam.reference_min, exam.reference_max) {
        (Some(_), None) => result.add_warning(
            format!("{prefix}.reference"),
            "Reference minimum provided but maximum is missing",
            None,
        ),
        (None, Some(_)) => result.add_warning(
            format!("{prefix}.reference"),
            "Reference maximum provided but minimum is missing",
            None,
        ),
        (Some(min), Some(max)) if min > max => result.add_warning(
            format!("{prefix}.reference"),
            "Reference minimum is greater than maximum",
            Some(format!("min: {}, max: {}", min, max)),
        ),
        _ => {}
    }

    let status = exam
        .status
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    if let Some(status) = &status {
        if !VALID_STATUSES.contains(&status.as_str()) {
            result.add_warning(
                format!("{prefix}.status"),
                format!("Invalid status (allowed: {})", VALID_STATUSES.join(", ")),
                exam.status.clone(),
            );
        }
    }

    if let (Some(value), Some(min), Some(max), Some(status)) =
        (exam.value, exam.reference_min, exam.reference_max, &status)
    {
        let in_range = value >= min && value <= max;
        let snapshot = format!("value: {}, status: {}", value, exam.status.as_deref().unwrap_or_default());

        if in_range && status != "normal" {
            result.add_warning(
                format!("{prefix}.status"),
                "Value is within reference but status is not normal",
                Some(snapshot),
            );
        } else if !in_range && status == "normal" {
            result.add_warning(
                format!("{prefix}.status"),
                "Value is outside reference but status is normal",
                Some(snapshot),
            );
        }
    }
}

/// `YYYY-MM-DD` that also names a real calendar day.
pub fn is_valid_iso_date(date: &str) -> bool {
    ISO_DATE.is_match(date) && NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
}

/// Checks an 11-digit national tax identifier and its two mod-11 check digits.
/// Punctuation is ignored.
pub fn is_valid_tax_id(tax_id: &str) -> bool {
    let digits: Vec<u32> = tax_id.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 {
        return false;
    }
    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }

    let first = check_digit(&digits[..9]);
    let second = check_digit(&digits[..10]);
    digits[9] == first && digits[10] == second
}

/// Weighted sum with weights `len+1 ..= 2`, remainder below 2 maps to 0.
fn check_digit(digits: &[u32]) -> u32 {
    let weight_start = digits.len() as u32 + 1;
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| d * (weight_start - i as u32))
        .sum();
    let remainder = sum % 11;
    if remainder < 2 { 0 } else { 11 - remainder }
}
