//! AI document extraction.
//!
//! A backend turns one document into raw model text. The adapter owns
//! everything after that: unwrapping formatting, shape coercion, and the
//! zero-or-one draft contract.
//!
//! Anthropic is reached through rig-core; `RigExtractor` bridges rig's
//! `CompletionModel` to `ExtractionBackend`.

pub mod document;
pub mod prompt;
mod rig_adapter;

pub use rig_adapter::RigExtractor;

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::pipeline::types::{CandidateDraft, QualificationType};

/// Anthropic-backed extractor from configuration.
pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn ExtractionBackend>, ExtractionError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ExtractionError::RequestFailed {
                backend: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    info!(model = %config.model, "Using Anthropic for extraction");
    Ok(Arc::new(RigExtractor::new(
        model,
        "anthropic",
        &config.model,
        u64::from(config.max_tokens),
        config.timeout,
    )))
}

/// One admitted attachment, ready for extraction.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// An AI service that reads one document per call.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Short label used in logs and errors.
    fn name(&self) -> &str;

    /// Raw model output for a single document.
    async fn extract(&self, document: &DocumentInput) -> Result<String, ExtractionError>;
}

/// Normalized result of one extraction call.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub draft: Option<CandidateDraft>,
    /// Candidates the model returned before truncation and name filtering.
    pub candidates_returned: usize,
}

impl Extraction {
    fn empty() -> Self {
        Self {
            draft: None,
            candidates_returned: 0,
        }
    }
}

/// Wraps a backend with output normalization.
#[derive(Clone)]
pub struct ExtractionAdapter {
    backend: Arc<dyn ExtractionBackend>,
}

impl ExtractionAdapter {
    pub fn new(backend: Arc<dyn ExtractionBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Exactly one backend call.
    pub async fn extract(&self, document: &DocumentInput) -> Result<Extraction, ExtractionError> {
        let raw = self.backend.extract(document).await?;
        let extraction = parse_extraction(&raw)?;
        if extraction.candidates_returned > 1 {
            warn!(
                filename = %document.filename,
                returned = extraction.candidates_returned,
                "Extraction returned multiple candidates, keeping the first"
            );
        }
        debug!(
            filename = %document.filename,
            has_draft = extraction.draft.is_some(),
            "Extraction parsed"
        );
        Ok(extraction)
    }
}

/// Parse raw model text into at most one draft.
///
/// Text that is not JSON at all is an error. JSON of the wrong shape is
/// treated as "no candidate".
pub fn parse_extraction(raw: &str) -> Result<Extraction, ExtractionError> {
    let json_str = extract_json(raw);
    let value: Value = serde_json::from_str(&json_str).map_err(|e| {
        let preview: String = raw.chars().take(200).collect();
        ExtractionError::MalformedOutput(format!("{e}: {preview}"))
    })?;

    let candidates: Vec<&Value> = match &value {
        Value::Object(map) => match map.get("candidates") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Object(_)) => vec![&map["candidates"]],
            Some(_) => return Ok(Extraction::empty()),
            None if map.contains_key("name") => vec![&value],
            None => match map.get("candidate") {
                Some(c @ Value::Object(_)) => vec![c],
                _ => return Ok(Extraction::empty()),
            },
        },
        Value::Array(items) => items.iter().collect(),
        _ => return Ok(Extraction::empty()),
    };

    let returned = candidates.iter().filter(|c| c.is_object()).count();
    let draft = candidates
        .into_iter()
        .find(|c| c.is_object())
        .and_then(draft_from_value)
        .filter(|d| !d.name.trim().is_empty());

    Ok(Extraction {
        draft,
        candidates_returned: returned,
    })
}

/// Extract a JSON value from model output (handles markdown wrapping and prose).
fn extract_json(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

fn draft_from_value(value: &Value) -> Option<CandidateDraft> {
    let obj = value.as_object()?;

    let qualification = first_present(obj, &["qualification", "highest_qualification"]).and_then(as_text);
    let qualification_type = first_present(obj, &["qualification_type"])
        .and_then(as_text)
        .map(|l| QualificationType::from_label(&l))
        .or_else(|| qualification.as_deref().map(QualificationType::from_label))
        .unwrap_or_default();

    Some(CandidateDraft {
        name: first_present(obj, &["name", "full_name"]).and_then(as_text).unwrap_or_default(),
        email: first_present(obj, &["email"]).and_then(as_text),
        phone: first_present(obj, &["phone", "phone_number"]).and_then(as_text),
        qualification,
        institution: first_present(obj, &["institution", "university"]).and_then(as_text),
        degree_country: first_present(obj, &["degree_country"]).and_then(as_text),
        has_degree: first_present(obj, &["has_degree"]).is_some_and(as_flag),
        qualification_type,
        years_experience: first_present(obj, &["years_experience", "experience_years"])
            .and_then(as_number)
            .unwrap_or(0.0)
            .max(0.0),
        teaching_phases: first_present(obj, &["teaching_phases", "phases"]).map(as_list).unwrap_or_default(),
        subjects: first_present(obj, &["subjects"]).map(as_list).unwrap_or_default(),
        has_teaching_registration: first_present(obj, &["has_teaching_registration", "sace_registered"])
            .is_some_and(as_flag),
        has_tefl: first_present(obj, &["has_tefl", "tefl"]).is_some_and(as_flag),
        countries: first_present(obj, &["countries"]).map(as_list).unwrap_or_default(),
        current_location: first_present(obj, &["current_location", "location"]).and_then(as_text),
        holistic_score: first_present(obj, &["holistic_score"]).and_then(as_number),
        notes: first_present(obj, &["notes"]).and_then(as_text),
    })
}

fn first_present<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

/// Non-empty trimmed string; numbers are rendered.
fn as_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let lowered = s.to_lowercase();
    if s.is_empty() || lowered == "null" || lowered == "n/a" || lowered == "none" {
        None
    } else {
        Some(s)
    }
}

fn as_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "y" | "1"),
        _ => false,
    }
}

/// Numbers, or the first number inside a string ("3 years", "2.5").
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => {
            let start = s.find(|c: char| c.is_ascii_digit())?;
            let num: String = s[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            num.trim_end_matches('.').parse().ok()
        }
        _ => None,
    }
}

/// Arrays of strings, or a comma/semicolon separated string.
fn as_list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items.iter().filter_map(as_text).collect(),
        Value::String(s) => s
            .split([',', ';'])
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn extractor_constructs_with_any_key() {
        // rig accepts any key at construction; auth fails on the first request.
        let config = ExtractionConfig {
            api_key: secrecy::SecretString::from("sk-test"),
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            timeout: Duration::from_secs(30),
        };
        let extractor = create_extractor(&config).unwrap();
        assert_eq!(extractor.name(), "anthropic");
    }

    struct CannedBackend {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExtractionBackend for CannedBackend {
        fn name(&self) -> &str {
            "canned"
        }

        async fn extract(&self, _document: &DocumentInput) -> Result<String, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|reason| ExtractionError::RequestFailed {
                backend: "canned".into(),
                reason,
            })
        }
    }

    fn doc() -> DocumentInput {
        DocumentInput {
            filename: "cv.pdf".into(),
            media_type: "application/pdf".into(),
            bytes: b"%PDF-1.4".to_vec(),
        }
    }

    #[test]
    fn parses_wrapped_candidate() {
        let raw = "Here you go:\n```json\n{\"candidates\": [{\"name\": \"Nomvula Dlamini\", \"email\": \"nomvula@example.com\", \"has_degree\": true, \"qualification\": \"B.Ed\", \"years_experience\": 4, \"countries\": [\"South Africa\"]}]}\n```";
        let ex = parse_extraction(raw).unwrap();
        let draft = ex.draft.unwrap();
        assert_eq!(draft.name, "Nomvula Dlamini");
        assert_eq!(draft.email.as_deref(), Some("nomvula@example.com"));
        assert!(draft.has_degree);
        assert_eq!(draft.qualification_type, QualificationType::Bachelors);
        assert_eq!(draft.years_experience, 4.0);
        assert_eq!(ex.candidates_returned, 1);
    }

    #[test]
    fn empty_candidates_is_zero_drafts() {
        let ex = parse_extraction(r#"{"candidates": []}"#).unwrap();
        assert!(ex.draft.is_none());
        assert_eq!(ex.candidates_returned, 0);
    }

    #[test]
    fn wrong_shape_json_is_zero_drafts() {
        assert!(parse_extraction(r#"{"result": "not a cv"}"#).unwrap().draft.is_none());
        assert!(parse_extraction(r#"{"candidates": "none"}"#).unwrap().draft.is_none());
        assert!(parse_extraction("42").unwrap().draft.is_none());
    }

    #[test]
    fn non_json_is_an_error() {
        let err = parse_extraction("I could not read this document.").unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedOutput(_)));
    }

    #[test]
    fn multiple_candidates_truncated_to_first() {
        let raw = r#"{"candidates": [{"name": "First Person"}, {"name": "Second Person"}]}"#;
        let ex = parse_extraction(raw).unwrap();
        assert_eq!(ex.draft.unwrap().name, "First Person");
        assert_eq!(ex.candidates_returned, 2);
    }

    #[test]
    fn empty_name_dropped() {
        let ex = parse_extraction(r#"{"candidates": [{"name": "  ", "email": "a@b.com"}]}"#).unwrap();
        assert!(ex.draft.is_none());
        assert_eq!(ex.candidates_returned, 1);
    }

    #[test]
    fn bare_object_and_array_shapes() {
        let ex = parse_extraction(r#"{"name": "Pieter van der Merwe", "has_degree": "yes"}"#).unwrap();
        assert!(ex.draft.unwrap().has_degree);
        let ex = parse_extraction(r#"[{"name": "Ayesha Patel"}]"#).unwrap();
        assert_eq!(ex.draft.unwrap().name, "Ayesha Patel");
    }

    #[test]
    fn loose_values_coerced() {
        let raw = r#"{"candidates": [{
            "name": "Thabo Nkosi",
            "years_experience": "about 3.5 years",
            "subjects": "Maths, Physical Science; Life Orientation",
            "countries": ["South Africa", null, ""],
            "phone": 27821234567,
            "email": "null",
            "has_tefl": 1,
            "qualification_type": "Honours"
        }]}"#;
        let draft = parse_extraction(raw).unwrap().draft.unwrap();
        assert_eq!(draft.years_experience, 3.5);
        assert_eq!(draft.subjects, vec!["Maths", "Physical Science", "Life Orientation"]);
        assert_eq!(draft.countries, vec!["South Africa"]);
        assert_eq!(draft.phone.as_deref(), Some("27821234567"));
        assert_eq!(draft.email, None);
        assert!(draft.has_tefl);
        assert_eq!(draft.qualification_type, QualificationType::Honours);
    }

    #[test]
    fn missing_years_default_to_zero() {
        let draft = parse_extraction(r#"{"candidates": [{"name": "Li Na"}]}"#).unwrap().draft.unwrap();
        assert_eq!(draft.years_experience, 0.0);
        assert_eq!(draft.qualification_type, QualificationType::Unknown);
    }

    #[tokio::test]
    async fn adapter_calls_backend_once() {
        let backend = Arc::new(CannedBackend {
            reply: Ok(r#"{"candidates": [{"name": "Nomvula Dlamini"}]}"#.into()),
            calls: AtomicUsize::new(0),
        });
        let adapter = ExtractionAdapter::new(backend.clone());
        let ex = adapter.extract(&doc()).await.unwrap();
        assert!(ex.draft.is_some());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.backend_name(), "canned");
    }

    #[tokio::test]
    async fn adapter_surfaces_backend_errors() {
        let backend = Arc::new(CannedBackend {
            reply: Err("connection reset".into()),
            calls: AtomicUsize::new(0),
        });
        let adapter = ExtractionAdapter::new(backend);
        let err = adapter.extract(&doc()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::RequestFailed { .. }));
    }
}
