//! Gmail REST mail source.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::GmailConfig;
use crate::error::MailError;
use crate::mail::{AttachmentRef, FetchedMessage, MailSource, MessageSummary};
use crate::pipeline::calendar::DayWindow;
use crate::store::TenantRoute;

/// Prefix for attachments whose data is inline in the message payload.
const INLINE_PREFIX: &str = "part:";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    /// Milliseconds since the epoch, as a string.
    internal_date: Option<String>,
    payload: Option<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    part_id: Option<String>,
    mime_type: Option<String>,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<Body>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Body {
    attachment_id: Option<String>,
    #[serde(default)]
    size: u64,
    data: Option<String>,
}

pub struct GmailSource {
    client: reqwest::Client,
    config: GmailConfig,
}

impl GmailSource {
    pub fn new(config: GmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.config.api_base.trim_end_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, MailError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.config.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| MailError::Connection {
                host: self.config.api_base.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(MailError::AuthFailed {
                account: "gmail".into(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Http {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }
        resp.json().await.map_err(|e| MailError::Protocol(format!("Gmail response: {e}")))
    }

    async fn full_message(&self, id: &str) -> Result<GmailMessage, MailError> {
        self.get_json(&self.url(&format!("messages/{id}")), &[("format", "full".to_string())])
            .await
            .map_err(|e| match e {
                MailError::Http { status: 404, .. } => MailError::MessageNotFound(id.to_string()),
                other => other,
            })
    }
}

#[async_trait]
impl MailSource for GmailSource {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn list_messages(
        &self,
        route: &TenantRoute,
        window: &DayWindow,
    ) -> Result<Vec<MessageSummary>, MailError> {
        let query = format!(
            "deliveredto:{} after:{} before:{}",
            route.source_address,
            window.start.timestamp(),
            window.end.timestamp()
        );

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", query.clone()), ("maxResults", "100".to_string())];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: ListResponse = self.get_json(&self.url("messages"), &params).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(address = %route.source_address, count = ids.len(), "Gmail query returned");

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let minimal: GmailMessage = self
                .get_json(&self.url(&format!("messages/{id}")), &[("format", "minimal".to_string())])
                .await?;
            let Some(received_at) = minimal.internal_date.as_deref().and_then(parse_internal_date) else {
                continue;
            };
            if window.contains(received_at) {
                summaries.push(MessageSummary { id, received_at });
            }
        }
        summaries.sort_by_key(|s| s.received_at);

        info!(
            address = %route.source_address,
            day = %window.day,
            count = summaries.len(),
            "Gmail messages listed"
        );
        Ok(summaries)
    }

    async fn get_message(&self, _route: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError> {
        let message = self.full_message(id).await?;
        to_fetched(message)
    }

    async fn get_attachment(
        &self,
        _route: &TenantRoute,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailError> {
        let not_found = || MailError::AttachmentNotFound {
            message_id: message_id.to_string(),
            attachment_id: attachment_id.to_string(),
        };

        let data = if let Some(part_id) = attachment_id.strip_prefix(INLINE_PREFIX) {
            let message = self.full_message(message_id).await?;
            let payload = message.payload.ok_or_else(not_found)?;
            find_part(&payload, part_id)
                .and_then(|p| p.body.as_ref())
                .and_then(|b| b.data.clone())
                .ok_or_else(not_found)?
        } else {
            let body: Body = self
                .get_json(
                    &self.url(&format!("messages/{message_id}/attachments/{attachment_id}")),
                    &[],
                )
                .await
                .map_err(|e| match e {
                    MailError::Http { status: 404, .. } => not_found(),
                    other => other,
                })?;
            body.data.ok_or_else(not_found)?
        };

        decode_base64url(&data).map_err(|reason| MailError::Parse {
            id: message_id.to_string(),
            reason,
        })
    }
}

fn to_fetched(message: GmailMessage) -> Result<FetchedMessage, MailError> {
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(parse_internal_date)
        .ok_or_else(|| MailError::Parse {
            id: message.id.clone(),
            reason: "missing internalDate".into(),
        })?;

    let payload = message.payload.ok_or_else(|| MailError::Parse {
        id: message.id.clone(),
        reason: "missing payload".into(),
    })?;

    let mut attachments = Vec::new();
    collect_attachments(&payload, &mut attachments);

    Ok(FetchedMessage {
        id: message.id,
        thread_id: message.thread_id,
        sender: header(&payload, "From")
            .map(sender_address)
            .unwrap_or_else(|| "unknown".into()),
        subject: header(&payload, "Subject").map(|s| s.to_string()),
        received_at,
        attachments,
    })
}

/// Depth-first walk; parts with a filename are attachments.
fn collect_attachments(part: &Part, out: &mut Vec<AttachmentRef>) {
    if !part.filename.is_empty()
        && let Some(body) = &part.body
    {
        let id = match (&body.attachment_id, &part.part_id) {
            (Some(att), _) => Some(att.clone()),
            (None, Some(pid)) if body.data.is_some() => Some(format!("{INLINE_PREFIX}{pid}")),
            _ => None,
        };
        if let Some(id) = id {
            out.push(AttachmentRef {
                id,
                filename: part.filename.clone(),
                media_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".into())
                    .to_lowercase(),
                size: body.size,
            });
        }
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

fn find_part<'a>(part: &'a Part, part_id: &str) -> Option<&'a Part> {
    if part.part_id.as_deref() == Some(part_id) {
        return Some(part);
    }
    part.parts.iter().find_map(|p| find_part(p, part_id))
}

fn header<'a>(part: &'a Part, name: &str) -> Option<&'a str> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// `"Name" <addr@x>` or bare `addr@x` → lowercased address.
fn sender_address(from: &str) -> String {
    match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if end > start => from[start + 1..end].trim().to_lowercase(),
        _ => from.trim().to_lowercase(),
    }
}

fn parse_internal_date(ms: &str) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms.trim().parse().ok()?)
}

/// Gmail uses URL-safe base64, with or without padding.
fn decode_base64url(data: &str) -> Result<Vec<u8>, String> {
    URL_SAFE_NO_PAD
        .decode(data.trim().trim_end_matches('='))
        .map_err(|e| format!("invalid base64url attachment data: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_message() -> GmailMessage {
        serde_json::from_value(json!({
            "id": "18e3f",
            "threadId": "18e3a",
            "internalDate": "1710460200000",
            "payload": {
                "partId": "",
                "mimeType": "multipart/mixed",
                "filename": "",
                "headers": [
                    {"name": "From", "value": "Nomvula Dlamini <Nomvula@Example.com>"},
                    {"name": "Subject", "value": "Application: Grade R teacher"}
                ],
                "body": {"size": 0},
                "parts": [
                    {"partId": "0", "mimeType": "text/plain", "filename": "", "body": {"size": 20, "data": "SGk"}},
                    {"partId": "1", "mimeType": "application/pdf", "filename": "cv.pdf",
                     "body": {"attachmentId": "ANGjdJ8", "size": 48213}},
                    {"partId": "2", "mimeType": "multipart/alternative", "filename": "", "body": {"size": 0},
                     "parts": [
                        {"partId": "2.0", "mimeType": "application/rtf", "filename": "letter.rtf",
                         "body": {"size": 6000, "data": "e1xydGYx"}}
                     ]}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn converts_full_message() {
        let msg = to_fetched(sample_message()).unwrap();
        assert_eq!(msg.id, "18e3f");
        assert_eq!(msg.thread_id.as_deref(), Some("18e3a"));
        assert_eq!(msg.sender, "nomvula@example.com");
        assert_eq!(msg.subject.as_deref(), Some("Application: Grade R teacher"));
        assert_eq!(msg.received_at, Utc.with_ymd_and_hms(2024, 3, 14, 23, 50, 0).unwrap());
        assert_eq!(msg.attachments.len(), 2);
        assert_eq!(msg.attachments[0].id, "ANGjdJ8");
        assert_eq!(msg.attachments[0].size, 48213);
        assert_eq!(msg.attachments[1].id, "part:2.0");
        assert_eq!(msg.attachments[1].media_type, "application/rtf");
    }

    #[test]
    fn find_nested_part() {
        let msg = sample_message();
        let payload = msg.payload.unwrap();
        assert_eq!(find_part(&payload, "2.0").unwrap().filename, "letter.rtf");
        assert!(find_part(&payload, "9").is_none());
    }

    #[test]
    fn base64url_with_and_without_padding() {
        assert_eq!(decode_base64url("e1xydGYx").unwrap(), b"{\\rtf1");
        assert_eq!(decode_base64url("SGk=").unwrap(), b"Hi");
        assert_eq!(decode_base64url("_-8").unwrap(), vec![0xff, 0xef]);
        assert!(decode_base64url("***").is_err());
    }

    #[test]
    fn sender_address_forms() {
        assert_eq!(sender_address("\"A B\" <A@B.com>"), "a@b.com");
        assert_eq!(sender_address("plain@x.org"), "plain@x.org");
    }

    #[test]
    fn missing_internal_date_is_parse_error() {
        let mut msg = sample_message();
        msg.internal_date = None;
        assert!(matches!(to_fetched(msg), Err(MailError::Parse { .. })));
    }
}
