//! Recent-duplicate check against persisted candidates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::CandidateDraft;
use crate::store::IntakeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Unique,
    /// An existing candidate inside the window.
    Duplicate(Uuid),
}

/// Which draft field the lookup keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    Email,
    Name,
}

impl MatchKey {
    pub fn for_draft(draft: &CandidateDraft) -> Self {
        match draft.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => Self::Email,
            _ => Self::Name,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Name => "name",
        }
    }
}

/// Existence check only. Nothing is merged into the earlier record.
pub struct DedupCheck {
    store: Arc<dyn IntakeStore>,
    window: TimeDelta,
}

impl DedupCheck {
    pub fn new(store: Arc<dyn IntakeStore>, window: Duration) -> Self {
        Self {
            store,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::hours(24)),
        }
    }

    pub async fn check(
        &self,
        org_id: &str,
        draft: &CandidateDraft,
        now: DateTime<Utc>,
    ) -> Result<DedupOutcome, DatabaseError> {
        let email = match MatchKey::for_draft(draft) {
            MatchKey::Email => draft.email.as_deref(),
            MatchKey::Name => None,
        };
        let found = self
            .store
            .find_recent_candidate(org_id, email, &draft.name, now - self.window)
            .await?;
        Ok(match found {
            Some(id) => DedupOutcome::Duplicate(id),
            None => DedupOutcome::Unique,
        })
    }
}
