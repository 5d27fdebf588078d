//! Decoding of the JSON object embedded in a model response.
//!
//! Models wrap their answer in prose or markdown fences and are loose with JSON:
//! keys arrive in any case, comments and trailing commas show up. The payload is
//! cut from the first `{` to the last `}`, relaxed into strict JSON, its keys are
//! lower-cased and only then deserialized into [`ExtractionResult`].

use serde_json::{Map, Value};

use crate::error::PayloadError;
use crate::models::ExtractionResult;

/// The substring from the first `{` to the last `}`, or the whole response when
/// there is no such pair.
pub fn locate_json_payload(response: &str) -> &str {
    match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response,
    }
}

pub fn parse_extraction_payload(payload: &str) -> Result<ExtractionResult, PayloadError> {
    let relaxed = strip_comments_and_trailing_commas(payload);
    let value: Value = serde_json::from_str(&relaxed)?;
    if value.is_null() {
        return Err(PayloadError::Null);
    }
    Ok(serde_json::from_value(lowercase_keys(value))?)
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.to_lowercase(), lowercase_keys(value)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Drop `//` and `/* */` comments outside string literals, then commas that
/// directly precede `}` or `]`.
///
/// Only those two relaxations are applied. Unquoted or single-quoted keys,
/// single-quoted strings and `NaN`/`Infinity` literals stay invalid JSON and fail
/// to parse. An unterminated `/*` swallows the rest of the input.
fn strip_comments_and_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                out.push(' ');
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn payload_is_cut_out_of_markdown_fences() {
        let response = "Here is the result:\n```json\n{\"exams\": []}\n```\nLet me know.";
        assert_eq!(locate_json_payload(response), "{\"exams\": []}");
    }

    #[test]
    fn response_without_braces_is_returned_whole() {
        assert_eq!(locate_json_payload("no json here"), "no json here");
        assert_eq!(locate_json_payload("} backwards {"), "} backwards {");
    }

    #[test]
    fn keys_match_case_insensitively() {
        let payload = r#"{
            "Patient": {"NAME": "Maria Silva", "BirthDate": "1980-05-01", "collectionDATE": "2024-03-10"},
            "EXAMS": [{"Type": "HDL", "Value": 45, "ReferenceMin": 40, "REFERENCEMAX": 60, "Unit": "mg/dL"}]
        }"#;
        let result = parse_extraction_payload(payload).unwrap();

        let patient = result.patient.unwrap();
        assert_eq!(patient.name.as_deref(), Some("Maria Silva"));
        assert_eq!(patient.birth_date.as_deref(), Some("1980-05-01"));
        assert_eq!(patient.collection_date.as_deref(), Some("2024-03-10"));
        assert_eq!(result.exams.len(), 1);
        assert_eq!(result.exams[0].exam_type, "HDL");
        assert_eq!(result.exams[0].reference_min, Some(Decimal::from(40)));
        assert_eq!(result.exams[0].reference_max, Some(Decimal::from(60)));
    }

    #[test]
    fn comments_and_trailing_commas_are_tolerated() {
        let payload = r#"{
            // header extracted from the first page
            "patient": {"name": "Joao", /* inline */ "requestingPhysician": "Dr. Lima",},
            "exams": [
                {"type": "Glicose", "value": 92, "observations": "jejum // 8h",},
            ],
        }"#;
        let result = parse_extraction_payload(payload).unwrap();
        assert_eq!(
            result.patient.unwrap().requesting_physician.as_deref(),
            Some("Dr. Lima")
        );
        assert_eq!(result.exams[0].observations.as_deref(), Some("jejum // 8h"));
    }

    #[test]
    fn commas_inside_strings_are_kept() {
        let payload = r#"{"exams": [{"type": "Ureia", "observations": "a,}"}]}"#;
        let result = parse_extraction_payload(payload).unwrap();
        assert_eq!(result.exams[0].observations.as_deref(), Some("a,}"));
    }

    #[test]
    fn comment_markers_inside_strings_are_kept() {
        let payload = r#"{"exams": [{"type": "HDL", "observations": "ver /* nota */ abaixo"}]}"#;
        let result = parse_extraction_payload(payload).unwrap();
        assert_eq!(result.exams[0].observations.as_deref(), Some("ver /* nota */ abaixo"));
    }

    #[test]
    fn unquoted_keys_are_not_relaxed() {
        assert!(matches!(
            parse_extraction_payload(r#"{exams: [{"type": "HDL"}]}"#),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            parse_extraction_payload(r#"{'exams': []}"#),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(
            parse_extraction_payload("I could not find any exams."),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(parse_extraction_payload("null"), Err(PayloadError::Null)));
    }
}
