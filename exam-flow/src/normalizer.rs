use tracing::{debug, info};

use crate::models::{ExamObservation, ExtractionResult};

/// Synonym to canonical exam name. Lookups try an exact (case-insensitive) match
/// first, then the first key contained in the name, so longer and more specific
/// keys must come before the keys they contain.
const EXAM_SYNONYMS: &[(&str, &str)] = &[
    ("Col. Total", "Colesterol Total"),
    ("Col Total", "Colesterol Total"),
    ("VLDL", "Colesterol VLDL"),
    ("LDL", "Colesterol LDL"),
    ("HDL", "Colesterol HDL"),
    ("Colesterol", "Colesterol Total"),
    ("Glicemia Jejum", "Glicemia em Jejum"),
    ("Glicose Jejum", "Glicemia em Jejum"),
    ("Glicose", "Glicemia em Jejum"),
    ("TGO", "TGO (AST)"),
    ("AST", "TGO (AST)"),
    ("TGP", "TGP (ALT)"),
    ("ALT", "TGP (ALT)"),
    ("Hemácias", "Hemácias (Eritrócitos)"),
    ("Eritrócitos", "Hemácias (Eritrócitos)"),
    ("Leucócitos", "Leucócitos (Glóbulos Brancos)"),
    ("Glóbulos Brancos", "Leucócitos (Glóbulos Brancos)"),
    ("Plaquetas", "Plaquetas (Trombócitos)"),
    ("Trombócitos", "Plaquetas (Trombócitos)"),
    ("Hemoglobina", "Hemoglobina (Hb)"),
    ("Hb", "Hemoglobina (Hb)"),
    ("Hematócrito", "Hematócrito (Ht)"),
    ("Ht", "Hematócrito (Ht)"),
    ("Triglicerídeos", "Triglicerídeos (Triglicérides)"),
    ("Triglicérides", "Triglicerídeos (Triglicérides)"),
    ("Ureia", "Ureia (Nitrogênio Ureico)"),
    ("Creatinina", "Creatinina Sérica"),
    ("TSH", "TSH (Hormônio Tireoestimulante)"),
    ("T4 Livre", "T4 Livre (Tiroxina)"),
    ("T4", "T4 Livre (Tiroxina)"),
];

/// Maps exam names onto canonical forms and tidies units and statuses.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    synonyms: Vec<(String, &'static str)>,
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl NameNormalizer {
    pub fn new() -> Self {
        Self {
            synonyms: EXAM_SYNONYMS
                .iter()
                .map(|(key, canonical)| (key.to_lowercase(), *canonical))
                .collect(),
        }
    }

    /// Returns a copy with every exam normalized; the patient block is kept as is.
    pub fn normalize(&self, extraction: ExtractionResult) -> ExtractionResult {
        info!(exam_count = extraction.exams.len(), "Starting data normalization");

        let exams: Vec<ExamObservation> = extraction
            .exams
            .into_iter()
            .map(|exam| self.normalize_exam(exam))
            .collect();

        info!(exam_count = exams.len(), "Normalization completed");

        ExtractionResult {
            patient: extraction.patient,
            exams,
        }
    }

    fn normalize_exam(&self, mut exam: ExamObservation) -> ExamObservation {
        if !exam.exam_type.trim().is_empty() {
            let canonical = self.normalize_exam_name(&exam.exam_type);
            if canonical != exam.exam_type {
                debug!(original = %exam.exam_type, canonical = %canonical, "Exam name normalized");
            }
            exam.exam_type = canonical;
        }

        exam.unit = exam.unit.map(|unit| tidy(unit, false));
        exam.status = exam.status.map(|status| tidy(status, true));
        exam
    }

    /// Canonical name for `name`: exact synonym, then first contained synonym,
    /// otherwise the trimmed input.
    pub fn normalize_exam_name(&self, name: &str) -> String {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return name.to_string();
        }

        let lowered = trimmed.to_lowercase();

        if let Some((_, canonical)) = self.synonyms.iter().find(|(key, _)| *key == lowered) {
            return canonical.to_string();
        }

        if let Some((_, canonical)) = self
            .synonyms
            .iter()
            .find(|(key, _)| lowered.contains(key.as_str()))
        {
            return canonical.to_string();
        }

        trimmed.to_string()
    }
}

/// Blank strings stay untouched; others are trimmed and optionally lower-cased.
fn tidy(value: String, lowercase: bool) -> String {
    if value.trim().is_empty() {
        return value;
    }
    let trimmed = value.trim();
    if lowercase {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}
