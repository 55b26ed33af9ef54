//! Mail sources: where candidate documents arrive.

pub mod gmail;
pub mod imap;
pub mod parse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::MailError;
use crate::pipeline::calendar::DayWindow;
use crate::store::TenantRoute;

pub use gmail::GmailSource;
pub use imap::ImapSource;

/// A message found in a route's window, before the full fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub received_at: DateTime<Utc>,
}

/// Attachment metadata. Bytes are fetched separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub media_type: String,
    pub size: u64,
}

/// Message headers plus attachment listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub subject: Option<String>,
    /// When the mail system received the message.
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

/// Read-only access to the mailbox behind a set of routes.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn name(&self) -> &str;

    /// Messages addressed to the route and received within `window`.
    async fn list_messages(
        &self,
        route: &TenantRoute,
        window: &DayWindow,
    ) -> Result<Vec<MessageSummary>, MailError>;

    async fn get_message(&self, route: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError>;

    async fn get_attachment(
        &self,
        route: &TenantRoute,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailError>;
}
