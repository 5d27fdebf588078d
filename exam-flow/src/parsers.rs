use async_trait::async_trait;

use crate::error::ParseError;
use crate::router::DocumentParser;

/// Reads documents that are already text (lab exports, CSV dumps, notes).
pub struct PlainTextParser;

const UTF8_BOM: &str = "\u{FEFF}";

#[async_trait]
impl DocumentParser for PlainTextParser {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn supported_extensions(&self) -> &[&str] {
        &[".txt", ".csv", ".md"]
    }

    async fn extract_text(&self, content: &[u8], extension: &str) -> Result<String, ParseError> {
        let text = std::str::from_utf8(content).map_err(|e| ParseError::CorruptFile {
            file_type: extension.to_string(),
            reason: format!("content is not valid UTF-8: {}", e),
        })?;
        Ok(text.strip_prefix(UTF8_BOM).unwrap_or(text).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strips_byte_order_mark() {
        let content = "\u{FEFF}Glicose 92 mg/dL".as_bytes();
        let text = PlainTextParser.extract_text(content, ".txt").await.unwrap();
        assert_eq!(text, "Glicose 92 mg/dL");
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_corrupt_file() {
        let err = PlainTextParser
            .extract_text(&[0xff, 0xfe, 0x00, 0x41], ".csv")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::CorruptFile { file_type, .. } if file_type == ".csv"));
    }

    #[test]
    fn supports_declared_extensions_case_insensitively() {
        assert!(PlainTextParser.supports_file_type(".TXT"));
        assert!(PlainTextParser.supports_file_type("csv"));
        assert!(!PlainTextParser.supports_file_type(".pdf"));
    }
}
