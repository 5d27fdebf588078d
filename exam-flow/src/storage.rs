use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{
    Document, DocumentGraph, DocumentRegistration, Exam, ExamListQuery, ExamPage, ExamQuery,
    ExamRecord, ExamResult, ExamType, GENERIC_EXAM_CATEGORY, ListedExam, NewDocument, Patient,
    ProcessingStatus,
    UNIDENTIFIED_PATIENT_NAME, normalize_tax_id,
};
use crate::error::StoreError;
use crate::models::{ExamObservation, PipelineResult};

/// Reference exam types every fresh store starts with: `(id, name, category)`.
pub const SEED_EXAM_TYPES: &[(i32, &str, &str)] = &[
    (1, "Hemograma Completo", "Hematologia"),
    (2, "Glicemia", "Bioquímica"),
    (3, "Colesterol Total", "Lipidograma"),
    (4, "HDL", "Lipidograma"),
    (5, "LDL", "Lipidograma"),
    (6, "Triglicerídeos", "Lipidograma"),
    (7, "Ureia", "Função Renal"),
    (8, "Creatinina", "Função Renal"),
    (9, "TGO/AST", "Função Hepática"),
    (10, "TGP/ALT", "Função Hepática"),
];

/// Decimal places kept for measured values and reference bounds.
pub const STORED_VALUE_SCALE: u32 = 4;

/// Exclusive bound on the magnitude of a stored value (14 integer digits).
pub const STORED_VALUE_LIMIT: i64 = 100_000_000_000_000;

/// Persistence for documents, patients and their exam graphs.
///
/// Writes are atomic per call: a failing `save_exam` leaves nothing behind, and
/// dropping its future before it resolves has the same effect.
///
/// Values and reference bounds are stored as `NUMERIC(18, 4)` in every
/// implementation: they are rounded half away from zero to
/// [`STORED_VALUE_SCALE`] places, and a result holding a magnitude of
/// [`STORED_VALUE_LIMIT`] or more is rejected with `InvalidArgument` before
/// anything is written.
#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Create a document in `processing` state, or return the graph of the document
    /// that already owns this content hash.
    async fn register_document(
        &self,
        document: NewDocument,
    ) -> Result<DocumentRegistration, StoreError>;

    async fn find_document_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<DocumentGraph>, StoreError>;

    /// Persist a successful pipeline result against a registered document and
    /// return the owning patient's id.
    async fn save_exam(&self, result: &PipelineResult, document_id: Uuid)
    -> Result<Uuid, StoreError>;

    async fn mark_document_failed(&self, document_id: Uuid, error: &str)
    -> Result<(), StoreError>;

    /// Exams of the patient owning `tax_id`, most recent collection first.
    async fn get_exams_by_patient(
        &self,
        tax_id: &str,
        query: &ExamQuery,
    ) -> Result<Vec<ExamRecord>, StoreError>;

    /// Set the patient's tax id if it has none. Returns whether it was set.
    async fn assign_patient_tax_id(&self, patient_id: Uuid, tax_id: &str)
    -> Result<bool, StoreError>;

    /// Delete a document with its exams and results. Returns whether it existed.
    async fn delete_document(&self, document_id: Uuid) -> Result<bool, StoreError>;

    /// All exams page by page, newest upload first, then newest exam first.
    async fn list_exams(&self, query: &ExamListQuery) -> Result<ExamPage, StoreError>;

    /// Cheap round trip proving the backing store answers.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// What `save_exam` writes, resolved from a pipeline result before any I/O.
#[derive(Debug, Clone)]
pub(crate) struct ExamBatch<'a> {
    pub patient_name: String,
    pub birth_date: Option<NaiveDate>,
    pub collection_date: NaiveDate,
    pub requesting_physician: Option<String>,
    pub exams: &'a [ExamObservation],
}

impl<'a> ExamBatch<'a> {
    pub fn from_result(result: &'a PipelineResult) -> Result<Self, StoreError> {
        let data = result.data.as_ref().ok_or_else(|| {
            StoreError::InvalidArgument("pipeline result carries no extracted data".into())
        })?;

        if let Some(index) = data.exams.iter().position(|e| e.exam_type.trim().is_empty()) {
            return Err(StoreError::InvalidArgument(format!(
                "exam type name cannot be empty (exams[{}])",
                index
            )));
        }

        for (index, exam) in data.exams.iter().enumerate() {
            for (field, value) in [
                ("value", exam.value),
                ("referenceMin", exam.reference_min),
                ("referenceMax", exam.reference_max),
            ] {
                if let Some(value) = stored_decimal(value).filter(|v| !fits_storage(*v)) {
                    return Err(StoreError::InvalidArgument(format!(
                        "exams[{}].{} {} exceeds the stored numeric range",
                        index, field, value
                    )));
                }
            }
        }

        let patient = data.patient.as_ref();
        let patient_name = patient
            .and_then(|p| p.name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(UNIDENTIFIED_PATIENT_NAME)
            .to_string();

        let collection_date = match patient.and_then(|p| p.collection_date.as_deref()) {
            Some(raw) => parse_date(raw).unwrap_or_else(|| {
                warn!(date = %raw, "Failed to parse collection date, using current date");
                Utc::now().date_naive()
            }),
            None => Utc::now().date_naive(),
        };

        Ok(Self {
            patient_name,
            birth_date: patient.and_then(|p| p.birth_date.as_deref()).and_then(parse_date),
            collection_date,
            requesting_physician: patient.and_then(|p| p.requesting_physician.clone()),
            exams: &data.exams,
        })
    }

    /// Distinct exam type names in first-seen order.
    pub fn exam_type_names(&self) -> Vec<&'a str> {
        let mut names: Vec<&'a str> = Vec::new();
        for exam in self.exams {
            if !names.contains(&exam.exam_type.as_str()) {
                names.push(exam.exam_type.as_str());
            }
        }
        names
    }
}

/// A value as it will be stored: rounded to [`STORED_VALUE_SCALE`] places.
pub fn stored_decimal(value: Option<Decimal>) -> Option<Decimal> {
    value.map(|v| v.round_dp_with_strategy(STORED_VALUE_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

fn fits_storage(value: Decimal) -> bool {
    value.abs() < Decimal::from(STORED_VALUE_LIMIT)
}

/// Lenient calendar date parsing: ISO dates, `dd/mm/yyyy` and RFC 3339 timestamps.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    ["%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|timestamp| timestamp.date_naive())
        })
}

/// Normalized tax id, rejecting input with nothing left after normalization.
pub(crate) fn required_tax_id(tax_id: &str) -> Result<String, StoreError> {
    let normalized = normalize_tax_id(tax_id);
    if normalized.is_empty() {
        return Err(StoreError::InvalidArgument("tax id cannot be empty".into()));
    }
    Ok(normalized)
}

/// Most recent collection first, undated exams last, newer rows first on ties.
pub(crate) fn sort_most_recent_first(records: &mut [ExamRecord]) {
    records.sort_by(|a, b| {
        b.exam
            .collection_date
            .cmp(&a.exam.collection_date)
            .then_with(|| b.exam.created_at.cmp(&a.exam.created_at))
    });
}

#[derive(Default)]
struct MemoryState {
    patients: Vec<Patient>,
    documents: HashMap<Uuid, Document>,
    hash_index: HashMap<String, Uuid>,
    exam_types: Vec<ExamType>,
    exams: Vec<Exam>,
    results: Vec<ExamResult>,
}

impl MemoryState {
    fn seeded() -> Self {
        let now = Utc::now();
        Self {
            exam_types: SEED_EXAM_TYPES
                .iter()
                .map(|(id, name, category)| ExamType {
                    id: *id,
                    name: name.to_string(),
                    description: None,
                    category: Some(category.to_string()),
                    created_at: now,
                })
                .collect(),
            ..Self::default()
        }
    }

    fn find_exam_type(&self, name: &str) -> Option<&ExamType> {
        self.exam_types
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.exam_types.iter().find(|t| t.name.contains(name)))
    }

    fn resolve_exam_type(&mut self, name: &str, now: DateTime<Utc>) -> i32 {
        if let Some(existing) = self.find_exam_type(name) {
            debug!(requested = %name, found = %existing.name, "Found existing exam type");
            return existing.id;
        }

        let id = self.exam_types.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        self.exam_types.push(ExamType {
            id,
            name: name.to_string(),
            description: None,
            category: Some(GENERIC_EXAM_CATEGORY.to_string()),
            created_at: now,
        });
        debug!(name = %name, id, "Created exam type");
        id
    }

    fn patient_for(&mut self, batch: &ExamBatch<'_>, now: DateTime<Utc>) -> Uuid {
        if let Some(existing) = self.patients.iter().find(|p| p.name == batch.patient_name) {
            debug!(patient_id = %existing.id, "Found existing patient");
            return existing.id;
        }

        let patient = Patient {
            id: Uuid::new_v4(),
            name: batch.patient_name.clone(),
            birth_date: batch.birth_date,
            tax_id: None,
            created_at: now,
            updated_at: now,
        };
        let id = patient.id;
        debug!(patient_id = %id, "Created patient");
        self.patients.push(patient);
        id
    }

    fn record(&self, exam: &Exam) -> ExamRecord {
        ExamRecord {
            exam: exam.clone(),
            exam_type: exam
                .exam_type_id
                .and_then(|id| self.exam_types.iter().find(|t| t.id == id))
                .cloned(),
            results: self
                .results
                .iter()
                .filter(|r| r.exam_id == exam.id)
                .cloned()
                .collect(),
        }
    }

    fn graph(&self, document: &Document) -> DocumentGraph {
        DocumentGraph {
            document: document.clone(),
            patient: document
                .patient_id
                .and_then(|id| self.patients.iter().find(|p| p.id == id))
                .cloned(),
            exams: self
                .exams
                .iter()
                .filter(|e| e.document_id == document.id)
                .map(|e| self.record(e))
                .collect(),
        }
    }
}

/// Process-local store, used when no database is configured and in tests.
pub struct InMemoryExamStore {
    state: Mutex<MemoryState>,
}

impl Default for InMemoryExamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExamStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::seeded()),
        }
    }

    pub async fn exam_types(&self) -> Vec<ExamType> {
        self.state.lock().await.exam_types.clone()
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn get_document(&self, document_id: Uuid) -> Option<DocumentGraph> {
        let state = self.state.lock().await;
        state.documents.get(&document_id).map(|d| state.graph(d))
    }
}

#[async_trait]
impl ExamStore for InMemoryExamStore {
    async fn register_document(
        &self,
        document: NewDocument,
    ) -> Result<DocumentRegistration, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .hash_index
            .get(&document.content_hash)
            .and_then(|id| state.documents.get(id))
        {
            info!(document_id = %existing.id, "Document with this content hash already registered");
            return Ok(DocumentRegistration::Existing(state.graph(existing)));
        }

        let document = document.into_document(Utc::now());
        state
            .hash_index
            .insert(document.content_hash.clone(), document.id);
        state.documents.insert(document.id, document.clone());
        info!(document_id = %document.id, file_name = %document.file_name, "Registered document");
        Ok(DocumentRegistration::Created(document))
    }

    async fn find_document_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<DocumentGraph>, StoreError> {
        if content_hash.trim().is_empty() {
            return Err(StoreError::InvalidArgument("content hash cannot be empty".into()));
        }
        let state = self.state.lock().await;
        Ok(state
            .hash_index
            .get(content_hash)
            .and_then(|id| state.documents.get(id))
            .map(|d| state.graph(d)))
    }

    async fn save_exam(
        &self,
        result: &PipelineResult,
        document_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let batch = ExamBatch::from_result(result)?;
        info!(document_id = %document_id, exams = batch.exams.len(), "Saving exam result");

        let mut state = self.state.lock().await;
        if !state.documents.contains_key(&document_id) {
            return Err(StoreError::DocumentNotFound(document_id));
        }

        let now = Utc::now();
        let type_ids: HashMap<&str, i32> = batch
            .exam_type_names()
            .into_iter()
            .map(|name| (name, state.resolve_exam_type(name, now)))
            .collect();

        let patient_id = state.patient_for(&batch, now);

        if let Some(document) = state.documents.get_mut(&document_id) {
            document.patient_id = Some(patient_id);
            document.processing_status = ProcessingStatus::Completed;
            document.processing_error = None;
        }

        for observation in batch.exams {
            let exam = Exam {
                id: Uuid::new_v4(),
                document_id,
                exam_type_id: type_ids.get(observation.exam_type.as_str()).copied(),
                collection_date: Some(batch.collection_date),
                requesting_physician: batch.requesting_physician.clone(),
                laboratory: None,
                created_at: now,
            };
            state.results.push(ExamResult {
                id: Uuid::new_v4(),
                exam_id: exam.id,
                parameter: observation.exam_type.clone(),
                numeric_value: stored_decimal(observation.value),
                text_value: None,
                unit: observation.unit.clone(),
                reference_min: stored_decimal(observation.reference_min),
                reference_max: stored_decimal(observation.reference_max),
                status: observation.status.clone(),
                observations: observation.observations.clone(),
                created_at: now,
            });
            state.exams.push(exam);
        }

        info!(
            document_id = %document_id,
            patient_id = %patient_id,
            exams = batch.exams.len(),
            "Saved exam result"
        );
        Ok(patient_id)
    }

    async fn mark_document_failed(
        &self,
        document_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        document.processing_status = ProcessingStatus::Failed;
        document.processing_error = Some(error.to_string());
        warn!(document_id = %document_id, "Document marked as failed: {}", error);
        Ok(())
    }

    async fn get_exams_by_patient(
        &self,
        tax_id: &str,
        query: &ExamQuery,
    ) -> Result<Vec<ExamRecord>, StoreError> {
        let tax_id = required_tax_id(tax_id)?;
        let state = self.state.lock().await;

        let Some(patient) = state
            .patients
            .iter()
            .find(|p| p.tax_id.as_deref() == Some(tax_id.as_str()))
        else {
            info!("No patient registered for tax id");
            return Ok(Vec::new());
        };

        let mut records: Vec<ExamRecord> = state
            .exams
            .iter()
            .filter(|exam| {
                state
                    .documents
                    .get(&exam.document_id)
                    .is_some_and(|d| d.patient_id == Some(patient.id))
            })
            .map(|exam| state.record(exam))
            .filter(|record| {
                query.matches(
                    record.exam.collection_date,
                    record.exam_type.as_ref().map(|t| t.name.as_str()),
                )
            })
            .collect();
        sort_most_recent_first(&mut records);

        info!(patient_id = %patient.id, count = records.len(), "Found exams for patient");
        Ok(records)
    }

    async fn assign_patient_tax_id(
        &self,
        patient_id: Uuid,
        tax_id: &str,
    ) -> Result<bool, StoreError> {
        let tax_id = required_tax_id(tax_id)?;
        let mut state = self.state.lock().await;

        if state
            .patients
            .iter()
            .any(|p| p.id != patient_id && p.tax_id.as_deref() == Some(tax_id.as_str()))
        {
            return Err(StoreError::Conflict(
                "tax id already belongs to another patient".into(),
            ));
        }

        let patient = state
            .patients
            .iter_mut()
            .find(|p| p.id == patient_id)
            .ok_or(StoreError::PatientNotFound(patient_id))?;

        if patient.tax_id.is_some() {
            return Ok(false);
        }
        patient.tax_id = Some(tax_id);
        patient.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(document) = state.documents.remove(&document_id) else {
            return Ok(false);
        };
        state.hash_index.remove(&document.content_hash);

        let exam_ids: Vec<Uuid> = state
            .exams
            .iter()
            .filter(|e| e.document_id == document_id)
            .map(|e| e.id)
            .collect();
        state.exams.retain(|e| e.document_id != document_id);
        state.results.retain(|r| !exam_ids.contains(&r.exam_id));

        info!(document_id = %document_id, exams = exam_ids.len(), "Deleted document");
        Ok(true)
    }

    async fn list_exams(&self, query: &ExamListQuery) -> Result<ExamPage, StoreError> {
        let state = self.state.lock().await;

        let mut matching: Vec<(&Exam, &Document, Option<&Patient>)> = state
            .exams
            .iter()
            .filter_map(|exam| {
                let document = state.documents.get(&exam.document_id)?;
                let patient = document
                    .patient_id
                    .and_then(|id| state.patients.iter().find(|p| p.id == id));
                query
                    .matches_patient(patient.map(|p| p.name.as_str()))
                    .then_some((exam, document, patient))
            })
            .collect();
        matching.sort_by(|(a, a_doc, _), (b, b_doc, _)| {
            b_doc
                .upload_date
                .cmp(&a_doc.upload_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.effective_page_size() as usize)
            .map(|(exam, document, patient)| ListedExam {
                record: state.record(exam),
                document: document.clone(),
                patient: patient.cloned(),
            })
            .collect();

        debug!(page = query.effective_page(), total, "Listed exams");
        Ok(ExamPage::new(items, query, total))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
