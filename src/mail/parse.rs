//! RFC 822 parsing helpers shared by mail sources.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::error::MailError;
use crate::mail::{AttachmentRef, FetchedMessage};

/// Parse a raw message. Attachment ids are their positions among the
/// message's attachment parts, so they are stable for the same bytes.
pub fn parse_message(
    id: &str,
    raw: &[u8],
    received_at: Option<DateTime<Utc>>,
) -> Result<FetchedMessage, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse {
            id: id.to_string(),
            reason: "not an RFC 822 message".into(),
        })?;

    let header_date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
    let received_at = received_at
        .or(header_date)
        .ok_or_else(|| MailError::Parse {
            id: id.to_string(),
            reason: "no receipt time or Date header".into(),
        })?;

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(index, part)| {
            let part: &mail_parser::MessagePart = part;
            AttachmentRef {
                id: index.to_string(),
                filename: MimeHeaders::attachment_name(part)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("attachment-{index}")),
                media_type: media_type_of(part),
                size: part.contents().len() as u64,
            }
        })
        .collect();

    let thread_id = parsed
        .in_reply_to()
        .as_text()
        .or_else(|| parsed.message_id())
        .map(|s| s.to_string());

    Ok(FetchedMessage {
        id: id.to_string(),
        thread_id,
        sender: extract_sender(&parsed),
        subject: parsed.subject().map(|s| s.to_string()),
        received_at,
        attachments,
    })
}

/// Bytes of the attachment at position `attachment_id`.
pub fn attachment_bytes(message_id: &str, raw: &[u8], attachment_id: &str) -> Result<Vec<u8>, MailError> {
    let not_found = || MailError::AttachmentNotFound {
        message_id: message_id.to_string(),
        attachment_id: attachment_id.to_string(),
    };
    let index: usize = attachment_id.parse().map_err(|_| not_found())?;
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse {
            id: message_id.to_string(),
            reason: "not an RFC 822 message".into(),
        })?;
    parsed
        .attachments()
        .nth(index)
        .map(|part| part.contents().to_vec())
        .ok_or_else(not_found)
}

fn media_type_of(part: &mail_parser::MessagePart) -> String {
    match MimeHeaders::content_type(part) {
        Some(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub).to_lowercase(),
            None => ct.ctype().to_lowercase(),
        },
        None => "application/octet-stream".to_string(),
    }
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::TimeZone;

    /// Build a multipart message with the given `(filename, media type, bytes)` attachments.
    pub(crate) fn build_message(from: &str, to: &str, subject: &str, attachments: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut out = format!(
            "From: Sender <{from}>\r\nTo: {to}\r\nSubject: {subject}\r\nDate: Thu, 14 Mar 2024 23:50:00 +0000\r\nMessage-ID: <abc@example.com>\r\nMIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"XYZ\"\r\n\r\n--XYZ\r\nContent-Type: text/plain\r\n\r\nPlease find my CV attached.\r\n"
        );
        for (name, media, bytes) in attachments {
            out.push_str(&format!(
                "--XYZ\r\nContent-Type: {media}; name=\"{name}\"\r\nContent-Disposition: attachment; filename=\"{name}\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n",
                BASE64.encode(bytes)
            ));
        }
        out.push_str("--XYZ--\r\n");
        out.into_bytes()
    }

    #[test]
    fn parses_headers_and_attachments() {
        let pdf = vec![b'%'; 6000];
        let raw = build_message(
            "Applicant@Example.com",
            "jobs@school.example",
            "Application",
            &[("cv.pdf", "application/pdf", &pdf), ("photo.jpg", "image/jpeg", b"jpeg")],
        );
        let msg = parse_message("42", &raw, None).unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.sender, "applicant@example.com");
        assert_eq!(msg.subject.as_deref(), Some("Application"));
        assert_eq!(msg.received_at, Utc.with_ymd_and_hms(2024, 3, 14, 23, 50, 0).unwrap());
        assert_eq!(msg.thread_id.as_deref(), Some("abc@example.com"));
        assert_eq!(msg.attachments.len(), 2);
        assert_eq!(msg.attachments[0].filename, "cv.pdf");
        assert_eq!(msg.attachments[0].media_type, "application/pdf");
        assert_eq!(msg.attachments[0].size, 6000);
        assert_eq!(msg.attachments[1].id, "1");
    }

    #[test]
    fn receipt_time_overrides_date_header() {
        let raw = build_message("a@b.com", "c@d.com", "x", &[]);
        let internal = Utc.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).unwrap();
        let msg = parse_message("1", &raw, Some(internal)).unwrap();
        assert_eq!(msg.received_at, internal);
    }

    #[test]
    fn attachment_bytes_by_index() {
        let raw = build_message(
            "a@b.com",
            "c@d.com",
            "x",
            &[("one.pdf", "application/pdf", b"first"), ("two.pdf", "application/pdf", b"second")],
        );
        assert_eq!(attachment_bytes("m", &raw, "1").unwrap(), b"second");
        assert!(matches!(
            attachment_bytes("m", &raw, "5"),
            Err(MailError::AttachmentNotFound { .. })
        ));
        assert!(attachment_bytes("m", &raw, "abc").is_err());
    }
}
