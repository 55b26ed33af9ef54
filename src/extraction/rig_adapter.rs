//! Bridges a rig `CompletionModel` to `ExtractionBackend`.
//!
//! PDFs go to the model as base64 document content. Every other admitted
//! format is reduced to plain text first.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rig::OneOrMany;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, DocumentMediaType, Message, UserContent};
use tracing::debug;

use crate::error::ExtractionError;
use crate::extraction::document::{DocumentKind, document_text};
use crate::extraction::prompt::{build_extraction_system_prompt, build_extraction_user_prompt};
use crate::extraction::{DocumentInput, ExtractionBackend};

/// One document per completion request.
pub struct RigExtractor<M: CompletionModel> {
    model: M,
    backend: String,
    model_name: String,
    max_tokens: u64,
    timeout: Duration,
}

impl<M: CompletionModel> RigExtractor<M> {
    pub fn new(model: M, backend: &str, model_name: &str, max_tokens: u64, timeout: Duration) -> Self {
        Self {
            model,
            backend: backend.to_string(),
            model_name: model_name.to_string(),
            max_tokens,
            timeout,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, message: Message) -> Result<String, ExtractionError> {
        let response = self
            .model
            .completion_request(message)
            .preamble(build_extraction_system_prompt())
            .max_tokens(self.max_tokens)
            .send()
            .await
            .map_err(|e| classify(&self.backend, e))?;
        response_text(&self.backend, &response.choice)
    }
}

/// The user turn for one document: the document, then the instruction.
fn document_message(document: &DocumentInput) -> Result<Message, ExtractionError> {
    let kind = DocumentKind::detect(&document.filename, &document.media_type, &document.bytes)
        .ok_or_else(|| ExtractionError::UnreadableDocument {
            filename: document.filename.clone(),
            reason: format!("unsupported document type '{}'", document.media_type),
        })?;

    let body = match kind {
        DocumentKind::Pdf => UserContent::document(
            BASE64.encode(&document.bytes),
            Some(DocumentMediaType::PDF),
        ),
        _ => UserContent::text(format!(
            "<document filename=\"{}\">\n{}\n</document>",
            document.filename,
            document_text(kind, &document.filename, &document.bytes)?
        )),
    };

    let mut content = OneOrMany::one(body);
    content.push(UserContent::text(build_extraction_user_prompt(&document.filename)));
    Ok(Message::User { content })
}

/// Join the text parts of a completion.
fn response_text(
    backend: &str,
    choice: &OneOrMany<AssistantContent>,
) -> Result<String, ExtractionError> {
    let text = choice
        .iter()
        .filter_map(|part| match part {
            AssistantContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return Err(ExtractionError::InvalidResponse {
            backend: backend.to_string(),
            reason: "response contained no text".into(),
        });
    }
    Ok(text)
}

/// rig reports provider failures as text; 429s are picked out of it.
fn classify(backend: &str, error: CompletionError) -> ExtractionError {
    let reason = error.to_string();
    if reason.contains("429") || reason.contains("rate_limit") {
        ExtractionError::RateLimited {
            backend: backend.to_string(),
            retry_after: None,
        }
    } else {
        ExtractionError::RequestFailed {
            backend: backend.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl<M> ExtractionBackend for RigExtractor<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.backend
    }

    async fn extract(&self, document: &DocumentInput) -> Result<String, ExtractionError> {
        let message = document_message(document)?;
        debug!(
            filename = %document.filename,
            model = %self.model_name,
            "Sending document for extraction"
        );

        match tokio::time::timeout(self.timeout, self.complete(message)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(self.timeout)),
        }
    }
}
