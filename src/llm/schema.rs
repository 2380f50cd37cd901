//! Response schema and strict validation.
//!
//! The model's output is untrusted. It is parsed into raw structs with
//! string-typed enums, then every field is checked before a typed
//! `Suggestion` is built. One invalid suggestion rejects the whole payload.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::{Citation, CitationKind, Location, Provenance, RuleCode, Severity, Suggestion, SuggestionKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Response is not valid JSON for the schema: {0}")]
    Malformed(String),

    #[error("Suggestion {index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// A validated payload
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedResponse {
    pub suggestions: Vec<Suggestion>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    suggestions: Vec<RawSuggestion>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    #[serde(rename = "type")]
    kind: String,
    rule_code: String,
    severity: String,
    confidence: f64,
    title: String,
    description: String,
    location: RawLocation,
    original_snippet: String,
    proposed_snippet: String,
    citations: Vec<RawCitation>,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    line_start: usize,
    line_end: usize,
}

#[derive(Debug, Deserialize)]
struct RawCitation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    line_start: Option<usize>,
    #[serde(default)]
    line_end: Option<usize>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

/// JSON schema sent to the provider with every request
pub fn response_schema() -> Value {
    let llm_codes: Vec<&str> = RuleCode::LLM.iter().map(RuleCode::as_str).collect();
    json!({
        "type": "object",
        "required": ["suggestions"],
        "properties": {
            "suggestions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": [
                        "type", "rule_code", "severity", "confidence", "title", "description",
                        "location", "original_snippet", "proposed_snippet", "citations", "tags"
                    ],
                    "properties": {
                        "type": { "enum": ["text_edit", "code_edit", "delete", "insert", "question"] },
                        "rule_code": { "enum": llm_codes },
                        "severity": { "enum": ["low", "medium", "high", "critical"] },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "title": { "type": "string", "minLength": 1 },
                        "description": { "type": "string" },
                        "location": {
                            "type": "object",
                            "required": ["line_start", "line_end"],
                            "properties": {
                                "line_start": { "type": "integer", "minimum": 1 },
                                "line_end": { "type": "integer", "minimum": 1 }
                            }
                        },
                        "original_snippet": { "type": "string" },
                        "proposed_snippet": { "type": "string" },
                        "citations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["type"],
                                "properties": {
                                    "type": { "enum": ["document", "catalog", "fact"] },
                                    "path": { "type": "string" },
                                    "line_start": { "type": "integer" },
                                    "line_end": { "type": "integer" },
                                    "source": { "type": "string" },
                                    "key": { "type": "string" },
                                    "value": { "type": "string" }
                                }
                            }
                        },
                        "tags": { "type": "array", "items": { "type": "string" } }
                    }
                }
            },
            "notes": { "type": "string" }
        }
    })
}

/// Strip a surrounding markdown fence, if the model added one
pub fn unwrap_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Validate raw model output for a chunk spanning `[start_line, end_line]`
pub fn validate(text: &str, document: &str, start_line: usize, end_line: usize) -> Result<ValidatedResponse, SchemaError> {
    let raw: RawResponse =
        serde_json::from_str(unwrap_fence(text)).map_err(|e| SchemaError::Malformed(e.to_string()))?;

    let suggestions = raw
        .suggestions
        .into_iter()
        .enumerate()
        .map(|(index, s)| {
            suggestion(s, document, start_line, end_line).map_err(|reason| SchemaError::Invalid { index, reason })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ValidatedResponse {
        suggestions,
        notes: raw.notes.filter(|n| !n.trim().is_empty()),
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(field: &str, value: &str) -> Result<T, String> {
    serde_json::from_value(Value::String(value.to_string())).map_err(|_| format!("unknown {} '{}'", field, value))
}

fn suggestion(raw: RawSuggestion, document: &str, start_line: usize, end_line: usize) -> Result<Suggestion, String> {
    let kind: SuggestionKind = parse_enum("type", &raw.kind)?;
    let severity: Severity = parse_enum("severity", &raw.severity)?;
    let rule_code = RuleCode::parse(&raw.rule_code)
        .filter(RuleCode::is_llm)
        .ok_or_else(|| format!("rule_code '{}' is not an LLM rule code", raw.rule_code))?;

    if !(0.0..=1.0).contains(&raw.confidence) {
        return Err(format!("confidence {} outside [0, 1]", raw.confidence));
    }
    let title = raw.title.trim();
    if title.is_empty() {
        return Err("empty title".to_string());
    }

    let RawLocation { line_start, line_end } = raw.location;
    if line_start == 0 || line_end < line_start {
        return Err(format!("invalid line range {}-{}", line_start, line_end));
    }
    if line_start < start_line || line_end > end_line {
        return Err(format!(
            "line range {}-{} outside chunk {}-{}",
            line_start, line_end, start_line, end_line
        ));
    }

    let citations = raw
        .citations
        .into_iter()
        .map(citation)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Suggestion {
        document: document.to_string(),
        kind,
        rule_code,
        severity,
        confidence: raw.confidence,
        title: title.to_string(),
        description: raw.description.trim().to_string(),
        location: Location::new(line_start, line_end),
        original_snippet: raw.original_snippet,
        proposed_snippet: (kind != SuggestionKind::Question).then_some(raw.proposed_snippet),
        citations,
        tags: raw.tags,
        provenance: Provenance::Llm,
        evidence: Default::default(),
    })
}

fn citation(raw: RawCitation) -> Result<Citation, String> {
    let kind = match raw.kind.as_str() {
        "document" | "file" => CitationKind::Document,
        "catalog" => CitationKind::Catalog,
        "fact" => CitationKind::Fact,
        other => return Err(format!("unknown citation type '{}'", other)),
    };
    let citation = Citation {
        kind,
        path: raw.path,
        line_start: raw.line_start,
        line_end: raw.line_end,
        source: raw.source,
        key: raw.key,
        value: raw.value,
    };
    if !citation.is_checkable() {
        return Err(format!("{:?} citation lacks its locator", kind).to_lowercase());
    }
    Ok(citation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(suggestion: Value) -> String {
        json!({ "suggestions": [suggestion] }).to_string()
    }

    fn valid() -> Value {
        json!({
            "type": "text_edit",
            "rule_code": "LLM_SPELL",
            "severity": "low",
            "confidence": 0.9,
            "title": "Fix typo",
            "description": "Spelling.",
            "location": { "line_start": 12, "line_end": 12 },
            "original_snippet": "Teh run",
            "proposed_snippet": "The run",
            "citations": [{ "type": "document", "path": "a.md", "line_start": 12, "line_end": 12 }],
            "tags": ["spelling"]
        })
    }

    #[test]
    fn test_valid_payload_builds_typed_suggestions() {
        let response = validate(&payload(valid()), "a.md", 10, 20).unwrap();
        let s = &response.suggestions[0];

        assert_eq!(s.rule_code, RuleCode::LlmSpell);
        assert_eq!(s.provenance, Provenance::Llm);
        assert_eq!(s.location, Location::new(12, 12));
        assert_eq!(s.proposed_snippet.as_deref(), Some("The run"));
        assert_eq!(s.citations[0].kind, CitationKind::Document);
    }

    #[test]
    fn test_fenced_payload_is_unwrapped() {
        let fenced = format!("```json\n{}\n```", payload(valid()));
        assert_eq!(validate(&fenced, "a.md", 10, 20).unwrap().suggestions.len(), 1);
        assert_eq!(unwrap_fence("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_rejections() {
        let cases: Vec<(&str, Value)> = vec![
            ("rule_code", json!("STYLE_NO_H1")),
            ("severity", json!("urgent")),
            ("confidence", json!(1.5)),
            ("title", json!("  ")),
            ("location", json!({ "line_start": 14, "line_end": 12 })),
            ("location", json!({ "line_start": 25, "line_end": 26 })),
            ("citations", json!([{ "type": "catalog", "key": "wandb.init" }])),
            ("type", json!("rewrite")),
        ];

        for (field, value) in cases {
            let mut s = valid();
            s[field] = value;
            let err = validate(&payload(s), "a.md", 10, 20).unwrap_err();
            assert!(matches!(err, SchemaError::Invalid { index: 0, .. }), "{} accepted: {}", field, err);
        }
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let mut s = valid();
        s.as_object_mut().unwrap().remove("tags");
        assert!(matches!(validate(&payload(s), "a.md", 10, 20), Err(SchemaError::Malformed(_))));
        assert!(matches!(validate("not json", "a.md", 1, 2), Err(SchemaError::Malformed(_))));
    }

    #[test]
    fn test_question_has_no_proposed_text() {
        let mut s = valid();
        s["type"] = json!("question");
        s["rule_code"] = json!("LLM_UNSURE");
        let response = validate(&payload(s), "a.md", 10, 20).unwrap();
        assert!(response.suggestions[0].proposed_snippet.is_none());
    }

    #[test]
    fn test_schema_lists_llm_codes() {
        let schema = response_schema();
        let codes = &schema["properties"]["suggestions"]["items"]["properties"]["rule_code"]["enum"];
        assert_eq!(codes.as_array().unwrap().len(), 6);
    }
}
