use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Name given to a patient when the document does not identify one.
pub const UNIDENTIFIED_PATIENT_NAME: &str = "Unidentified patient";

/// Category assigned to exam types created on the fly.
pub const GENERIC_EXAM_CATEGORY: &str = "Outros";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Patient {
    pub id: Uuid,
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub tax_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status '{}'", other)),
        }
    }
}

/// One uploaded file and its processing lifecycle. The content hash is its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub patient_id: Option<Uuid>,
    pub file_name: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub upload_date: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to register a freshly uploaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub file_name: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
}

impl NewDocument {
    /// Describe an upload; the file type is the lower-cased `.ext` of the name.
    pub fn describe(file_name: &str, content: &[u8], content_hash: impl Into<String>) -> Self {
        let file_type = std::path::Path::new(file_name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        Self {
            file_name: file_name.to_string(),
            file_type,
            size_bytes: i64::try_from(content.len()).unwrap_or(i64::MAX),
            content_hash: content_hash.into(),
        }
    }

    pub(crate) fn into_document(self, now: DateTime<Utc>) -> Document {
        Document {
            id: Uuid::new_v4(),
            patient_id: None,
            file_name: self.file_name,
            file_type: self.file_type,
            size_bytes: self.size_bytes,
            content_hash: self.content_hash,
            upload_date: now,
            processing_status: ProcessingStatus::Processing,
            processing_error: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExamType {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Exam {
    pub id: Uuid,
    pub document_id: Uuid,
    pub exam_type_id: Option<i32>,
    pub collection_date: Option<NaiveDate>,
    pub requesting_physician: Option<String>,
    pub laboratory: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExamResult {
    pub id: Uuid,
    pub exam_id: Uuid,
    pub parameter: String,
    pub numeric_value: Option<Decimal>,
    pub text_value: Option<String>,
    pub unit: Option<String>,
    pub reference_min: Option<Decimal>,
    pub reference_max: Option<Decimal>,
    pub status: Option<String>,
    pub observations: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An exam with its type and measured results loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamRecord {
    pub exam: Exam,
    pub exam_type: Option<ExamType>,
    pub results: Vec<ExamResult>,
}

/// A document with its owner and full exam/result graph, as returned by hash lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentGraph {
    pub document: Document,
    pub patient: Option<Patient>,
    pub exams: Vec<ExamRecord>,
}

/// Outcome of registering an upload against the content-hash index.
#[derive(Debug, Clone)]
pub enum DocumentRegistration {
    Created(Document),
    Existing(DocumentGraph),
}

/// Optional filters for patient exam history lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExamQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub exam_type: Option<String>,
}

impl ExamQuery {
    /// The exam type filter, ignoring blank input.
    pub fn exam_type_filter(&self) -> Option<&str> {
        self.exam_type
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn matches(&self, collection_date: Option<NaiveDate>, exam_type_name: Option<&str>) -> bool {
        if let Some(from) = self.from {
            if !collection_date.is_some_and(|date| date >= from) {
                return false;
            }
        }
        if let Some(to) = self.to {
            if !collection_date.is_some_and(|date| date <= to) {
                return false;
            }
        }
        match self.exam_type_filter() {
            Some(filter) => exam_type_name.is_some_and(|name| name.contains(filter)),
            None => true,
        }
    }
}

/// Page size used when a listing does not ask for one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page a listing returns, whatever was asked.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Paging and patient-name filter for the exam listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamListQuery {
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    /// Case-insensitive partial match on the owning patient's name.
    pub patient_name: Option<String>,
}

impl Default for ExamListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            patient_name: None,
        }
    }
}

impl ExamListQuery {
    pub fn effective_page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Rows skipped before the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.effective_page() - 1) * u64::from(self.effective_page_size())
    }

    pub fn patient_name_filter(&self) -> Option<&str> {
        self.patient_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Exams without an owning patient only match when no name filter is set.
    pub fn matches_patient(&self, patient_name: Option<&str>) -> bool {
        match self.patient_name_filter() {
            Some(filter) => patient_name
                .is_some_and(|name| name.to_lowercase().contains(&filter.to_lowercase())),
            None => true,
        }
    }
}

/// One row of the exam listing: an exam with the document it came from and its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedExam {
    #[serde(flatten)]
    pub record: ExamRecord,
    pub document: Document,
    pub patient: Option<Patient>,
}

/// A page of the exam listing, most recently uploaded documents first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamPage {
    pub items: Vec<ListedExam>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl ExamPage {
    pub fn new(items: Vec<ListedExam>, query: &ExamListQuery, total: u64) -> Self {
        let page_size = query.effective_page_size();
        Self {
            items,
            page: query.effective_page(),
            page_size,
            total,
            total_pages: total.div_ceil(u64::from(page_size)),
        }
    }
}

/// Strip punctuation and whitespace from a user-supplied tax identifier.
pub fn normalize_tax_id(tax_id: &str) -> String {
    tax_id
        .chars()
        .filter(|c| !c.is_ascii_punctuation() && !c.is_whitespace())
        .collect()
}
