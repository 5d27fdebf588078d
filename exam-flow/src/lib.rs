pub mod entities;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod hash;
pub mod ingest;
pub mod models;
pub mod normalizer;
pub mod parsers;
pub mod payload;
pub mod pipeline;
pub mod router;
pub mod storage;
pub mod storage_postgres;
pub mod validator;

// Re-export commonly used types
pub use entities::{
    DEFAULT_PAGE_SIZE, Document, DocumentGraph, DocumentRegistration, Exam, ExamListQuery,
    ExamPage, ExamQuery, ExamRecord, ExamResult, ExamType, ListedExam, MAX_PAGE_SIZE, NewDocument,
    Patient, ProcessingStatus, normalize_tax_id,
};
pub use error::{
    ExtractionError, GenerationError, IngestError, ParseError, PayloadError, StoreError,
};
pub use extractor::{ExtractorConfig, StructuredExtractor};
#[cfg(feature = "rig")]
pub use generation::OpenRouterGenerator;
pub use generation::{
    GenerationOptions, OllamaGenerator, OllamaHealth, ScriptedGenerator, TextGenerator,
};
pub use hash::compute_content_hash;
pub use ingest::{IngestOutcome, IngestService};
pub use models::{
    ExamObservation, ExtractionResult, PatientInfo, PipelineResult, ProcessingStats,
    ValidationResult, ValidationWarning,
};
pub use normalizer::NameNormalizer;
pub use parsers::PlainTextParser;
pub use pipeline::ExamPipeline;
pub use router::{DocumentParser, TextExtractionRouter};
pub use storage::{ExamStore, InMemoryExamStore, STORED_VALUE_LIMIT, STORED_VALUE_SCALE};
pub use storage_postgres::PostgresExamStore;
pub use validator::{ConsistencyValidator, is_valid_tax_id};
