use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failures raised while turning raw document bytes into text.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("cannot determine file type: '{0}' has no extension")]
    NoExtension(String),

    #[error("file type '{extension}' is not supported. Supported formats: {}", .supported.join(", "))]
    UnsupportedFormat {
        extension: String,
        supported: Vec<String>,
    },

    #[error("corrupt file '{file_type}': {reason}")]
    CorruptFile { file_type: String, reason: String },

    #[error("text extraction cancelled")]
    Cancelled,
}

/// Failures of the text-generation collaborator.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("text generation service is not reachable at {0}")]
    Connection(String),

    #[error("text generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("text generation service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response from text generation service: {0}")]
    Response(String),

    #[error("text generation provider error: {0}")]
    Provider(String),
}

/// Failures while decoding the JSON payload found in a model response.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload deserialized to null")]
    Null,
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("document text cannot be empty")]
    EmptyInput,

    #[error("failed to parse model output after {attempts} attempts, the response might be malformed")]
    MalformedOutput {
        attempts: u32,
        #[source]
        source: PayloadError,
    },

    #[error("text generation failed after {attempts} attempts: {source}")]
    Generation {
        attempts: u32,
        #[source]
        source: GenerationError,
    },

    #[error("extraction cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document {0} not found")]
    DocumentNotFound(Uuid),

    #[error("patient {0} not found")]
    PatientNotFound(Uuid),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid tax identifier: {0}")]
    InvalidTaxId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ingest cancelled")]
    Cancelled,
}
