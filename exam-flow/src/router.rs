use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ParseError;

/// A format-specific reader that turns raw document bytes into text.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Extensions this parser handles, in `.ext` form.
    fn supported_extensions(&self) -> &[&str];

    /// Consulted once per declared extension when the router is built.
    fn supports_file_type(&self, extension: &str) -> bool {
        let extension = canonical_extension(extension);
        self.supported_extensions()
            .iter()
            .any(|supported| canonical_extension(supported) == extension)
    }

    async fn extract_text(&self, content: &[u8], extension: &str) -> Result<String, ParseError>;
}

/// Lower-cased `.ext` form of an extension given with or without the dot.
pub fn canonical_extension(extension: &str) -> String {
    let trimmed = extension.trim().trim_start_matches('.');
    format!(".{}", trimmed.to_lowercase())
}

/// Extension of a file name in `.ext` form, if it has one.
pub fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .map(|ext| ext.to_string_lossy())
        .filter(|ext| !ext.trim().is_empty())
        .map(|ext| canonical_extension(&ext))
}

/// Dispatches documents to the parser registered for their extension.
///
/// The extension table is resolved once when the router is built: the first
/// registered parser that declares an extension owns it.
#[derive(Clone)]
pub struct TextExtractionRouter {
    parsers: BTreeMap<String, Arc<dyn DocumentParser>>,
}

impl TextExtractionRouter {
    pub fn builder() -> TextExtractionRouterBuilder {
        TextExtractionRouterBuilder::default()
    }

    pub async fn extract_text(
        &self,
        content: &[u8],
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ParseError> {
        let extension = file_extension(file_name).ok_or_else(|| {
            error!(file_name = %file_name, "File has no extension");
            ParseError::NoExtension(file_name.to_string())
        })?;

        info!(file_name = %file_name, extension = %extension, "Processing document");

        let parser = self.parsers.get(&extension).ok_or_else(|| {
            let supported = self.supported_formats();
            error!(
                extension = %extension,
                supported = %supported.join(", "),
                "No parser registered for file type"
            );
            ParseError::UnsupportedFormat {
                extension: extension.clone(),
                supported,
            }
        })?;

        info!(parser = parser.name(), file_name = %file_name, "Using parser");

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ParseError::Cancelled),
            text = parser.extract_text(content, &extension) => text,
        };

        match text {
            Ok(text) => {
                info!(
                    chars = text.chars().count(),
                    file_name = %file_name,
                    "Extracted text from document"
                );
                Ok(text)
            }
            Err(e) => {
                error!(
                    parser = parser.name(),
                    file_name = %file_name,
                    "Failed to extract text: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Sorted list of every extension some parser is registered for.
    pub fn supported_formats(&self) -> Vec<String> {
        self.parsers.keys().cloned().collect()
    }

    /// Accepts a file name (`report.pdf`) or a bare extension (`.pdf`, `pdf`).
    pub fn is_format_supported(&self, name_or_extension: &str) -> bool {
        let trimmed = name_or_extension.trim();
        if trimmed.is_empty() {
            return false;
        }
        let extension = if trimmed.trim_start_matches('.').contains('.') {
            match file_extension(trimmed) {
                Some(extension) => extension,
                None => return false,
            }
        } else {
            canonical_extension(trimmed)
        };
        self.parsers.contains_key(&extension)
    }
}

#[derive(Default)]
pub struct TextExtractionRouterBuilder {
    parsers: Vec<Arc<dyn DocumentParser>>,
}

impl TextExtractionRouterBuilder {
    pub fn register(mut self, parser: Arc<dyn DocumentParser>) -> Self {
        self.parsers.push(parser);
        self
    }

    /// Every extension declared by some parser goes to the first registered parser
    /// whose `supports_file_type` accepts it. Extensions nobody accepts are dropped.
    pub fn build(self) -> TextExtractionRouter {
        let declared: BTreeSet<String> = self
            .parsers
            .iter()
            .flat_map(|parser| parser.supported_extensions().iter().map(|e| canonical_extension(e)))
            .collect();

        let mut table: BTreeMap<String, Arc<dyn DocumentParser>> = BTreeMap::new();
        for extension in declared {
            match self.parsers.iter().find(|p| p.supports_file_type(&extension)) {
                Some(parser) => {
                    debug!(extension = %extension, parser = parser.name(), "Registered parser");
                    table.insert(extension, parser.clone());
                }
                None => warn!(extension = %extension, "Declared extension rejected by every parser"),
            }
        }
        TextExtractionRouter { parsers: table }
    }
}
