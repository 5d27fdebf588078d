use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{DocumentGraph, DocumentRegistration, NewDocument};
use crate::error::{IngestError, StoreError};
use crate::hash::compute_content_hash;
use crate::models::PipelineResult;
use crate::pipeline::ExamPipeline;
use crate::storage::ExamStore;
use crate::validator::is_valid_tax_id;

/// What happened to an uploaded document.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The same bytes were ingested before; nothing was reprocessed.
    Duplicate(DocumentGraph),
    Processed {
        document_id: Uuid,
        patient_id: Uuid,
        result: PipelineResult,
    },
    /// The pipeline rejected the document; it is stored with status `failed`.
    Failed {
        document_id: Uuid,
        result: PipelineResult,
    },
}

/// Upload workflow: hash, deduplicate, register, run the pipeline and persist.
#[derive(Clone)]
pub struct IngestService {
    pipeline: ExamPipeline,
    store: Arc<dyn ExamStore>,
}

impl IngestService {
    pub fn new(pipeline: ExamPipeline, store: Arc<dyn ExamStore>) -> Self {
        Self { pipeline, store }
    }

    pub fn pipeline(&self) -> &ExamPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn ExamStore> {
        &self.store
    }

    pub async fn ingest(
        &self,
        content: &[u8],
        file_name: &str,
        tax_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, IngestError> {
        let tax_id = tax_id.map(str::trim).filter(|t| !t.is_empty());
        if let Some(tax_id) = tax_id {
            if !is_valid_tax_id(tax_id) {
                return Err(IngestError::InvalidTaxId(tax_id.to_string()));
            }
        }

        let content_hash = compute_content_hash(content);
        info!(file_name = %file_name, hash = %content_hash, "Ingesting document");

        if let Some(existing) =
            cancellable(cancel, self.store.find_document_by_hash(&content_hash)).await?
        {
            info!(document_id = %existing.document.id, "Duplicate document, skipping processing");
            return Ok(IngestOutcome::Duplicate(existing));
        }

        let registration = cancellable(
            cancel,
            self.store
                .register_document(NewDocument::describe(file_name, content, content_hash)),
        )
        .await?;
        let document = match registration {
            DocumentRegistration::Created(document) => document,
            DocumentRegistration::Existing(existing) => {
                info!(
                    document_id = %existing.document.id,
                    "Document registered concurrently, skipping processing"
                );
                return Ok(IngestOutcome::Duplicate(existing));
            }
        };

        let result = self.pipeline.process(content, file_name, cancel).await;

        if cancel.is_cancelled() {
            self.store
                .mark_document_failed(document.id, "ingest cancelled")
                .await?;
            return Err(IngestError::Cancelled);
        }

        if !result.success {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "processing failed".to_string());
            self.store.mark_document_failed(document.id, &message).await?;
            return Ok(IngestOutcome::Failed {
                document_id: document.id,
                result,
            });
        }

        let patient_id =
            match cancellable(cancel, self.store.save_exam(&result, document.id)).await {
                Ok(patient_id) => patient_id,
                Err(e) => {
                    let reason = match &e {
                        IngestError::Cancelled => "ingest cancelled".to_string(),
                        other => format!("Persistence error: {}", other),
                    };
                    if let Err(mark) = self.store.mark_document_failed(document.id, &reason).await {
                        warn!(document_id = %document.id, "Could not mark document as failed: {}", mark);
                    }
                    return Err(e);
                }
            };

        if let Some(tax_id) = tax_id {
            match self.store.assign_patient_tax_id(patient_id, tax_id).await {
                Ok(true) => info!(patient_id = %patient_id, "Tax id assigned to patient"),
                Ok(false) => info!(patient_id = %patient_id, "Patient already has a tax id"),
                Err(StoreError::Conflict(reason)) => {
                    warn!(patient_id = %patient_id, "Tax id not assigned: {}", reason)
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            document_id = %document.id,
            patient_id = %patient_id,
            exams = result.stats.normalized_exams,
            "Document ingested"
        );

        Ok(IngestOutcome::Processed {
            document_id: document.id,
            patient_id,
            result,
        })
    }
}

/// Await a store call unless `cancel` fires first; the dropped call never commits.
async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, IngestError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IngestError::Cancelled),
        outcome = call => Ok(outcome?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ProcessingStatus;
    use crate::extractor::{ExtractorConfig, StructuredExtractor};
    use crate::generation::ScriptedGenerator;
    use crate::parsers::PlainTextParser;
    use crate::router::TextExtractionRouter;
    use crate::storage::InMemoryExamStore;
    use std::time::Duration;

    const RESPONSE: &str = r#"{"patient": {"name": "Maria Silva", "collectionDate": "2024-03-10", "requestingPhysician": "Dr. Lima"},
        "exams": [{"type": "HDL", "value": 45, "unit": "mg/dL", "referenceMin": 40, "referenceMax": 60, "status": "normal"}]}"#;

    fn service(generator: Arc<ScriptedGenerator>, store: Arc<InMemoryExamStore>) -> IngestService {
        let router = TextExtractionRouter::builder()
            .register(Arc::new(PlainTextParser))
            .build();
        let config = ExtractorConfig {
            retry_delay: Duration::from_millis(1),
            ..ExtractorConfig::default()
        };
        IngestService::new(
            ExamPipeline::new(Arc::new(router), StructuredExtractor::new(generator, config)),
            store,
        )
    }

    #[tokio::test]
    async fn invalid_tax_id_is_rejected_before_any_work() {
        let generator = Arc::new(ScriptedGenerator::repeating(RESPONSE, 1));
        let store = Arc::new(InMemoryExamStore::new());
        let err = service(generator.clone(), store.clone())
            .ingest(b"HDL 45", "report.txt", Some("111.111.111-11"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::InvalidTaxId(_)));
        assert_eq!(store.document_count().await, 0);
        assert_eq!(generator.calls().await, 0);
    }

    #[tokio::test]
    async fn second_upload_of_same_bytes_is_a_duplicate() {
        let generator = Arc::new(ScriptedGenerator::repeating(RESPONSE, 1));
        let store = Arc::new(InMemoryExamStore::new());
        let service = service(generator.clone(), store.clone());
        let cancel = CancellationToken::new();

        let first = service.ingest(b"HDL 45", "report.txt", None, &cancel).await.unwrap();
        let IngestOutcome::Processed { document_id, .. } = first else {
            panic!("expected a processed document");
        };

        let second = service.ingest(b"HDL 45", "renamed.txt", None, &cancel).await.unwrap();
        match second {
            IngestOutcome::Duplicate(graph) => {
                assert_eq!(graph.document.id, document_id);
                assert_eq!(graph.exams.len(), 1);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(generator.calls().await, 1);
        assert_eq!(store.document_count().await, 1);
    }

    #[tokio::test]
    async fn pipeline_failure_marks_the_document_failed() {
        let generator = Arc::new(ScriptedGenerator::repeating("no json at all", 2));
        let store = Arc::new(InMemoryExamStore::new());
        let outcome = service(generator, store.clone())
            .ingest(b"HDL 45", "report.txt", None, &CancellationToken::new())
            .await
            .unwrap();

        let IngestOutcome::Failed { document_id, result } = outcome else {
            panic!("expected failure");
        };
        let graph = store.get_document(document_id).await.unwrap();
        assert_eq!(graph.document.processing_status, ProcessingStatus::Failed);
        assert_eq!(graph.document.processing_error, result.error_message);
    }

    #[tokio::test]
    async fn tax_id_is_attached_to_the_patient() {
        let generator = Arc::new(ScriptedGenerator::repeating(RESPONSE, 1));
        let store = Arc::new(InMemoryExamStore::new());
        let outcome = service(generator, store.clone())
            .ingest(b"HDL 45", "report.txt", Some("529.982.247-25"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Processed { .. }));

        let exams = store
            .get_exams_by_patient("52998224725", &Default::default())
            .await
            .unwrap();
        assert_eq!(exams.len(), 1);
        assert_eq!(exams[0].exam_type.as_ref().unwrap().name, "Colesterol HDL");
    }

    #[tokio::test]
    async fn cancelled_ingest_registers_nothing() {
        let generator = Arc::new(ScriptedGenerator::repeating(RESPONSE, 1));
        let store = Arc::new(InMemoryExamStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service(generator, store.clone())
            .ingest(b"HDL 45", "report.txt", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert_eq!(store.document_count().await, 0);
    }

    #[test]
    fn outcome_serializes_with_a_tag() {
        let outcome = IngestOutcome::Failed {
            document_id: Uuid::nil(),
            result: PipelineResult::started("report.txt", 3),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["result"]["fileName"], "report.txt");
    }
}
