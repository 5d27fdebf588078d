use anyhow::Context as _;
use exam_flow::{
    DEFAULT_PAGE_SIZE, ExamListQuery, ExamPipeline, ExamQuery, ExamStore, InMemoryExamStore,
    IngestService, OllamaGenerator, OpenRouterGenerator, PlainTextParser, PostgresExamStore,
    StructuredExtractor, TextExtractionRouter, TextGenerator, is_valid_tax_id, normalize_tax_id,
};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Cli, Command};
use crate::config::{ConfigError, LlmProvider, Settings};

pub fn build_router() -> TextExtractionRouter {
    TextExtractionRouter::builder()
        .register(Arc::new(PlainTextParser))
        .build()
}

pub fn build_generator(settings: &Settings) -> anyhow::Result<Arc<dyn TextGenerator>> {
    match &settings.provider {
        LlmProvider::Ollama { url, model } => {
            info!(url = %url, model = %model, "Using Ollama for extraction");
            Ok(Arc::new(OllamaGenerator::new(
                url,
                model,
                settings.extractor.request_timeout,
            )?))
        }
        LlmProvider::OpenRouter { api_key, model } => {
            info!(model = %model, "Using OpenRouter for extraction");
            Ok(Arc::new(OpenRouterGenerator::new(api_key, model)))
        }
    }
}

/// PostgreSQL when `DATABASE_URL` is set. Without it a memory store is only
/// handed out when the caller opted into `ephemeral`.
pub async fn build_store(settings: &Settings, ephemeral: bool) -> anyhow::Result<Arc<dyn ExamStore>> {
    match &settings.database_url {
        Some(url) => {
            let store = PostgresExamStore::connect(url, settings.database_max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store.migrate().await.context("Failed to apply database schema")?;
            Ok(Arc::new(store))
        }
        None if ephemeral => {
            warn!("Running without a database, exams are kept in memory and lost on exit");
            Ok(Arc::new(InMemoryExamStore::new()))
        }
        None => Err(ConfigError::DatabaseRequired.into()),
    }
}

pub async fn build_service(settings: &Settings, ephemeral: bool) -> anyhow::Result<IngestService> {
    let extractor = StructuredExtractor::new(build_generator(settings)?, settings.extractor.clone());
    let pipeline = ExamPipeline::new(Arc::new(build_router()), extractor);
    Ok(IngestService::new(pipeline, build_store(settings, ephemeral).await?))
}

/// Execute one command and return its JSON report.
pub async fn run(cli: Cli, cancel: &CancellationToken) -> anyhow::Result<Value> {
    match cli.command {
        Command::CheckTaxId { tax_id } => Ok(check_tax_id(&tax_id)),
        Command::Formats => Ok(formats()),
        command => {
            let settings = Settings::from_env()?;
            execute(command, &settings, cli.ephemeral, cancel).await
        }
    }
}

pub async fn execute(
    command: Command,
    settings: &Settings,
    ephemeral: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<Value> {
    match command {
        Command::CheckTaxId { tax_id } => Ok(check_tax_id(&tax_id)),
        Command::Formats => Ok(formats()),
        Command::Health => Ok(health_report(settings).await),
        Command::Ingest { path, tax_id, name } => {
            let service = build_service(settings, ephemeral).await?;
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = name.unwrap_or_else(|| display_name(&path));

            let outcome = service
                .ingest(&content, &file_name, tax_id.as_deref(), cancel)
                .await?;
            Ok(serde_json::to_value(&outcome)?)
        }
        Command::Exams {
            tax_id,
            from,
            to,
            exam_type,
            patient_name,
            page,
            page_size,
            ..
        } => {
            let store = build_store(settings, ephemeral).await?;
            match tax_id {
                Some(tax_id) => {
                    let records = store
                        .get_exams_by_patient(&tax_id, &ExamQuery { from, to, exam_type })
                        .await?;
                    Ok(serde_json::to_value(&records)?)
                }
                None => {
                    let query = ExamListQuery {
                        page: page.unwrap_or(1),
                        page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                        patient_name,
                    };
                    Ok(serde_json::to_value(&store.list_exams(&query).await?)?)
                }
            }
        }
        Command::Delete { document_id } => {
            let store = build_store(settings, ephemeral).await?;
            let deleted = store.delete_document(document_id).await?;
            Ok(json!({ "documentId": document_id, "deleted": deleted }))
        }
    }
}

fn check_tax_id(tax_id: &str) -> Value {
    json!({
        "taxId": normalize_tax_id(tax_id),
        "valid": is_valid_tax_id(tax_id),
    })
}

fn formats() -> Value {
    json!({ "formats": build_router().supported_formats() })
}

/// Status of the text-generation service and the database. Failures are
/// reported in the JSON, not raised.
pub async fn health_report(settings: &Settings) -> Value {
    let generation = generation_health(settings).await;
    let database = database_health(settings).await;
    let healthy = [&generation, &database]
        .iter()
        .all(|check| check["status"] != "unhealthy");

    json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": chrono::Utc::now(),
        "generation": generation,
        "database": database,
    })
}

async fn generation_health(settings: &Settings) -> Value {
    let LlmProvider::Ollama { url, model } = &settings.provider else {
        return json!({ "status": "skipped", "service": "OpenRouter" });
    };

    info!(url = %url, "Testing Ollama connection");
    let checked = match OllamaGenerator::new(url, model, settings.extractor.request_timeout) {
        Ok(generator) => generator.check_health().await,
        Err(e) => Err(e),
    };
    match checked {
        Ok(health) => {
            if !health.model_available {
                warn!(model = %model, "Ollama is up but the configured model is not installed");
            }
            json!({ "status": "healthy", "service": "Ollama", "details": health })
        }
        Err(e) => {
            error!(url = %url, "Ollama health check failed: {}", e);
            json!({ "status": "unhealthy", "service": "Ollama", "url": url, "error": e.to_string() })
        }
    }
}

async fn database_health(settings: &Settings) -> Value {
    let Some(url) = &settings.database_url else {
        return json!({ "status": "not_configured", "database": "PostgreSQL" });
    };

    info!("Testing database connection");
    let checked = match PostgresExamStore::connect(url, 1).await {
        Ok(store) => store.ping().await,
        Err(e) => Err(e),
    };
    match checked {
        Ok(()) => json!({ "status": "healthy", "database": "PostgreSQL" }),
        Err(e) => {
            error!("Database health check failed: {}", e);
            json!({ "status": "unhealthy", "database": "PostgreSQL", "error": e.to_string() })
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
