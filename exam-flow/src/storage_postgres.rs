use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::{
    Document, DocumentGraph, DocumentRegistration, Exam, ExamListQuery, ExamPage, ExamQuery,
    ExamRecord, ExamResult, ExamType, GENERIC_EXAM_CATEGORY, ListedExam, NewDocument, Patient,
    ProcessingStatus,
};
use crate::error::StoreError;
use crate::models::PipelineResult;
use crate::storage::{ExamBatch, ExamStore, required_tax_id, stored_decimal};

const SCHEMA: &str = include_str!("../sql/schema.sql");

/// Insert attempts before giving up on a hash that keeps appearing and vanishing.
const REGISTER_ATTEMPTS: u32 = 3;

#[derive(FromRow)]
struct DocumentRow {
    id: Uuid,
    patient_id: Option<Uuid>,
    file_name: String,
    file_type: String,
    size_bytes: i64,
    content_hash: String,
    upload_date: DateTime<Utc>,
    processing_status: String,
    processing_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let processing_status = row
            .processing_status
            .parse::<ProcessingStatus>()
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?;

        Ok(Document {
            id: row.id,
            patient_id: row.patient_id,
            file_name: row.file_name,
            file_type: row.file_type,
            size_bytes: row.size_bytes,
            content_hash: row.content_hash,
            upload_date: row.upload_date,
            processing_status,
            processing_error: row.processing_error,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL-backed [`ExamStore`].
#[derive(Clone)]
pub struct PostgresExamStore {
    pool: PgPool,
}

impl PostgresExamStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create missing tables and indexes and seed the reference exam types.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Database schema is up to date");
        Ok(())
    }

    async fn document_by_hash(&self, content_hash: &str) -> Result<Option<Document>, StoreError> {
        sqlx::query_as::<_, DocumentRow>("SELECT * FROM documents WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?
            .map(Document::try_from)
            .transpose()
    }

    async fn load_graph(&self, document: Document) -> Result<DocumentGraph, StoreError> {
        let patient = match document.patient_id {
            Some(patient_id) => {
                sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE id = $1")
                    .bind(patient_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => None,
        };

        let exams = sqlx::query_as::<_, Exam>(
            "SELECT * FROM exams WHERE document_id = $1 ORDER BY created_at, id",
        )
        .bind(document.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(DocumentGraph {
            document,
            patient,
            exams: self.load_records(exams).await?,
        })
    }

    /// Attach exam types and results to already ordered exams.
    async fn load_records(&self, exams: Vec<Exam>) -> Result<Vec<ExamRecord>, StoreError> {
        if exams.is_empty() {
            return Ok(Vec::new());
        }

        let type_ids: Vec<i32> = exams.iter().filter_map(|e| e.exam_type_id).collect();
        let exam_ids: Vec<Uuid> = exams.iter().map(|e| e.id).collect();

        let types: HashMap<i32, ExamType> =
            sqlx::query_as::<_, ExamType>("SELECT * FROM exam_types WHERE id = ANY($1)")
                .bind(&type_ids)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|t| (t.id, t))
                .collect();

        let mut results: HashMap<Uuid, Vec<ExamResult>> = HashMap::new();
        for result in sqlx::query_as::<_, ExamResult>(
            "SELECT * FROM exam_results WHERE exam_id = ANY($1) ORDER BY created_at, id",
        )
        .bind(&exam_ids)
        .fetch_all(&self.pool)
        .await?
        {
            results.entry(result.exam_id).or_default().push(result);
        }

        Ok(exams
            .into_iter()
            .map(|exam| ExamRecord {
                exam_type: exam.exam_type_id.and_then(|id| types.get(&id).cloned()),
                results: results.remove(&exam.id).unwrap_or_default(),
                exam,
            })
            .collect())
    }

    /// Exact name, then the lowest-id type whose name contains `name`, else a new
    /// type in the generic category. Runs outside the main save transaction.
    async fn resolve_exam_type(&self, name: &str) -> Result<i32, StoreError> {
        let existing = sqlx::query_as::<_, (i32, String)>(
            "SELECT id, name FROM exam_types \
             WHERE name = $1 OR strpos(name, $1) > 0 \
             ORDER BY (name = $1) DESC, id \
             LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, found)) = existing {
            debug!(requested = %name, found = %found, "Found existing exam type");
            return Ok(id);
        }

        let created = sqlx::query_scalar::<_, i32>(
            "INSERT INTO exam_types (name, category) VALUES ($1, $2) \
             ON CONFLICT (name) DO NOTHING RETURNING id",
        )
        .bind(name)
        .bind(GENERIC_EXAM_CATEGORY)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(id) => {
                debug!(name = %name, id, "Created exam type");
                Ok(id)
            }
            None => Ok(
                sqlx::query_scalar::<_, i32>("SELECT id FROM exam_types WHERE name = $1")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?,
            ),
        }
    }

    async fn write_batch(
        conn: &mut PgConnection,
        batch: &ExamBatch<'_>,
        document_id: Uuid,
        type_ids: &HashMap<&str, i32>,
    ) -> Result<Uuid, StoreError> {
        let now = Utc::now();

        let patient_id = match sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM patients WHERE name = $1 ORDER BY created_at, id LIMIT 1",
        )
        .bind(&batch.patient_name)
        .fetch_optional(&mut *conn)
        .await?
        {
            Some(id) => {
                debug!(patient_id = %id, "Found existing patient");
                id
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO patients (id, name, birth_date, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $4)",
                )
                .bind(id)
                .bind(&batch.patient_name)
                .bind(batch.birth_date)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                debug!(patient_id = %id, "Created patient");
                id
            }
        };

        let updated = sqlx::query(
            "UPDATE documents \
             SET patient_id = $1, processing_status = $2, processing_error = NULL \
             WHERE id = $3",
        )
        .bind(patient_id)
        .bind(ProcessingStatus::Completed.as_str())
        .bind(document_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(document_id));
        }

        for observation in batch.exams {
            let exam_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO exams \
                 (id, document_id, exam_type_id, collection_date, requesting_physician, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(exam_id)
            .bind(document_id)
            .bind(type_ids.get(observation.exam_type.as_str()).copied())
            .bind(batch.collection_date)
            .bind(batch.requesting_physician.as_deref())
            .bind(now)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO exam_results \
                 (id, exam_id, parameter, numeric_value, unit, reference_min, reference_max, \
                  status, observations, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(Uuid::new_v4())
            .bind(exam_id)
            .bind(&observation.exam_type)
            .bind(stored_decimal(observation.value))
            .bind(observation.unit.as_deref())
            .bind(stored_decimal(observation.reference_min))
            .bind(stored_decimal(observation.reference_max))
            .bind(observation.status.as_deref())
            .bind(observation.observations.as_deref())
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        Ok(patient_id)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl ExamStore for PostgresExamStore {
    async fn register_document(
        &self,
        document: NewDocument,
    ) -> Result<DocumentRegistration, StoreError> {
        for attempt in 1..=REGISTER_ATTEMPTS {
            let candidate = document.clone().into_document(Utc::now());

            let inserted = sqlx::query(
                "INSERT INTO documents \
                 (id, file_name, file_type, size_bytes, content_hash, upload_date, \
                  processing_status, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (content_hash) DO NOTHING",
            )
            .bind(candidate.id)
            .bind(&candidate.file_name)
            .bind(&candidate.file_type)
            .bind(candidate.size_bytes)
            .bind(&candidate.content_hash)
            .bind(candidate.upload_date)
            .bind(candidate.processing_status.as_str())
            .bind(candidate.created_at)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                info!(document_id = %candidate.id, file_name = %candidate.file_name, "Registered document");
                return Ok(DocumentRegistration::Created(candidate));
            }

            if let Some(existing) = self.document_by_hash(&document.content_hash).await? {
                info!(document_id = %existing.id, "Document with this content hash already registered");
                return Ok(DocumentRegistration::Existing(self.load_graph(existing).await?));
            }

            warn!(attempt, "Conflicting document disappeared before it could be read, retrying");
        }

        Err(StoreError::Conflict(format!(
            "could not register document with hash {}",
            document.content_hash
        )))
    }

    async fn find_document_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<DocumentGraph>, StoreError> {
        if content_hash.trim().is_empty() {
            return Err(StoreError::InvalidArgument("content hash cannot be empty".into()));
        }
        debug!(hash = %content_hash, "Looking up document by content hash");

        match self.document_by_hash(content_hash).await? {
            Some(document) => {
                info!(
                    document_id = %document.id,
                    status = %document.processing_status,
                    "Found existing document with content hash"
                );
                Ok(Some(self.load_graph(document).await?))
            }
            None => Ok(None),
        }
    }

    async fn save_exam(
        &self,
        result: &PipelineResult,
        document_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let batch = ExamBatch::from_result(result)?;
        info!(document_id = %document_id, exams = batch.exams.len(), "Saving exam result");

        let mut type_ids: HashMap<&str, i32> = HashMap::new();
        for name in batch.exam_type_names() {
            type_ids.insert(name, self.resolve_exam_type(name).await?);
        }

        let mut tx = self.pool.begin().await?;
        match Self::write_batch(&mut tx, &batch, document_id, &type_ids).await {
            Ok(patient_id) => {
                tx.commit().await?;
                info!(
                    document_id = %document_id,
                    patient_id = %patient_id,
                    exams = batch.exams.len(),
                    "Saved exam result"
                );
                Ok(patient_id)
            }
            Err(e) => {
                error!(document_id = %document_id, "Failed to save exam result: {}", e);
                if let Err(rollback) = tx.rollback().await {
                    warn!(document_id = %document_id, "Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn mark_document_failed(
        &self,
        document_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE documents SET processing_status = $1, processing_error = $2 WHERE id = $3",
        )
        .bind(ProcessingStatus::Failed.as_str())
        .bind(error)
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(document_id));
        }
        warn!(document_id = %document_id, "Document marked as failed: {}", error);
        Ok(())
    }

    async fn get_exams_by_patient(
        &self,
        tax_id: &str,
        query: &ExamQuery,
    ) -> Result<Vec<ExamRecord>, StoreError> {
        let tax_id = required_tax_id(tax_id)?;

        let exams = sqlx::query_as::<_, Exam>(
            "SELECT e.* FROM exams e \
             JOIN documents d ON d.id = e.document_id \
             JOIN patients p ON p.id = d.patient_id \
             LEFT JOIN exam_types t ON t.id = e.exam_type_id \
             WHERE p.tax_id = $1 \
               AND ($2::date IS NULL OR e.collection_date >= $2) \
               AND ($3::date IS NULL OR e.collection_date <= $3) \
               AND ($4::text IS NULL OR strpos(t.name, $4) > 0) \
             ORDER BY e.collection_date DESC NULLS LAST, e.created_at DESC",
        )
        .bind(&tax_id)
        .bind(query.from)
        .bind(query.to)
        .bind(query.exam_type_filter())
        .fetch_all(&self.pool)
        .await?;

        info!(count = exams.len(), "Found exams for patient");
        self.load_records(exams).await
    }

    async fn assign_patient_tax_id(
        &self,
        patient_id: Uuid,
        tax_id: &str,
    ) -> Result<bool, StoreError> {
        let tax_id = required_tax_id(tax_id)?;

        let updated = sqlx::query(
            "UPDATE patients SET tax_id = $1, updated_at = now() \
             WHERE id = $2 AND tax_id IS NULL",
        )
        .bind(&tax_id)
        .bind(patient_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict("tax id already belongs to another patient".into())
            } else {
                StoreError::Database(e)
            }
        })?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM patients WHERE id = $1)")
            .bind(patient_id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::PatientNotFound(patient_id))
        }
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        let existed = deleted.rows_affected() > 0;
        if existed {
            info!(document_id = %document_id, "Deleted document");
        }
        Ok(existed)
    }

    async fn list_exams(&self, query: &ExamListQuery) -> Result<ExamPage, StoreError> {
        let name_filter = query.patient_name_filter();
        debug!(
            page = query.effective_page(),
            page_size = query.effective_page_size(),
            patient = ?name_filter,
            "Listing exams"
        );

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM exams e \
             JOIN documents d ON d.id = e.document_id \
             LEFT JOIN patients p ON p.id = d.patient_id \
             WHERE ($1::text IS NULL OR strpos(lower(p.name), lower($1)) > 0)",
        )
        .bind(name_filter)
        .fetch_one(&self.pool)
        .await?;

        let exams = sqlx::query_as::<_, Exam>(
            "SELECT e.* FROM exams e \
             JOIN documents d ON d.id = e.document_id \
             LEFT JOIN patients p ON p.id = d.patient_id \
             WHERE ($1::text IS NULL OR strpos(lower(p.name), lower($1)) > 0) \
             ORDER BY d.upload_date DESC, e.created_at DESC, e.id \
             LIMIT $2 OFFSET $3",
        )
        .bind(name_filter)
        .bind(i64::from(query.effective_page_size()))
        .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let document_ids: Vec<Uuid> = exams.iter().map(|e| e.document_id).collect();
        let documents: HashMap<Uuid, Document> = sqlx::query_as::<_, DocumentRow>(
            "SELECT * FROM documents WHERE id = ANY($1)",
        )
        .bind(&document_ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Document::try_from(row).map(|d| (d.id, d)))
        .collect::<Result<_, _>>()?;

        let patient_ids: Vec<Uuid> = documents.values().filter_map(|d| d.patient_id).collect();
        let patients: HashMap<Uuid, Patient> =
            sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE id = ANY($1)")
                .bind(&patient_ids)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|p| (p.id, p))
                .collect();

        let items = self
            .load_records(exams)
            .await?
            .into_iter()
            .filter_map(|record| {
                // Documents deleted between the two reads drop out of the page
                let document = documents.get(&record.exam.document_id)?.clone();
                let patient = document.patient_id.and_then(|id| patients.get(&id).cloned());
                Some(ListedExam {
                    record,
                    document,
                    patient,
                })
            })
            .collect();

        Ok(ExamPage::new(items, query, u64::try_from(total).unwrap_or_default()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
