//! `IntakeStore` trait and the persisted records it speaks in.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::calendar::parse_offset;
use crate::pipeline::registry::InstitutionMatch;
use crate::pipeline::types::{
    AuditAction, CandidateDraft, MessageStatus, RunStats, RunStatus, Stage,
};

/// A source address and the tenant that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRoute {
    pub id: Uuid,
    pub source_address: String,
    pub user_id: String,
    pub org_id: String,
    /// UTC offset such as `+02:00`.
    pub timezone: String,
    pub active: bool,
}

impl TenantRoute {
    pub fn offset(&self) -> Result<FixedOffset, PipelineError> {
        parse_offset(&self.timezone).ok_or_else(|| PipelineError::InvalidTimezone(self.timezone.clone()))
    }
}

/// Idempotency record for one source message per org.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessageRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub route_id: Uuid,
    pub org_id: String,
    pub user_id: String,
    pub source_message_id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub attachment_count: u32,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another run holds `(source_message_id, org_id)` already.
    AlreadyClaimed,
}

/// A validated candidate. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateRecord {
    pub id: Uuid,
    pub org_id: String,
    pub user_id: String,
    pub source_address: String,
    pub message_record_id: Uuid,
    pub source_filename: String,
    /// Receipt day in the route's timezone.
    pub canonical_day: NaiveDate,
    pub draft: CandidateDraft,
    /// Registry canonical name, or the normalized stated name on a miss.
    pub institution_canonical: Option<String>,
    pub flags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Rows swept by `IntakeStore::fail_interrupted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptedWork {
    pub runs: u64,
    pub messages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub message_record_id: Option<Uuid>,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub stage: Stage,
    pub action: AuditAction,
    pub reason: String,
    pub context: serde_json::Value,
    pub candidate_id: Option<Uuid>,
    pub candidate_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingRun {
    pub id: Uuid,
    pub target_day: NaiveDate,
    pub status: RunStatus,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Persistence for routes, message claims, candidates, audit, runs and the
/// institution registry.
#[async_trait]
pub trait IntakeStore: Send + Sync {
    // ── Routes ──────────────────────────────────────────────────────

    /// Active routes, oldest first.
    async fn list_routes(&self) -> Result<Vec<TenantRoute>, DatabaseError>;

    async fn insert_route(&self, route: &TenantRoute) -> Result<(), DatabaseError>;

    // ── Inbound messages ────────────────────────────────────────────

    async fn message_exists(&self, source_message_id: &str, org_id: &str) -> Result<bool, DatabaseError>;

    /// Insert the record, or report that the `(source message, org)` key is taken.
    async fn claim_message(&self, record: &InboundMessageRecord) -> Result<ClaimOutcome, DatabaseError>;

    /// Terminal statuses also stamp `processed_at`.
    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn get_message_record(
        &self,
        source_message_id: &str,
        org_id: &str,
    ) -> Result<Option<InboundMessageRecord>, DatabaseError>;

    // ── Candidates ──────────────────────────────────────────────────

    async fn insert_candidate(&self, candidate: &CandidateRecord) -> Result<(), DatabaseError>;

    /// An existing candidate for the org created at or after `since`, matched
    /// on email (case-insensitive) when given, else on name.
    async fn find_recent_candidate(
        &self,
        org_id: &str,
        email: Option<&str>,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DatabaseError>;

    async fn list_candidates(&self, org_id: &str) -> Result<Vec<CandidateRecord>, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    async fn list_audit(&self, run_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError>;

    // ── Runs ────────────────────────────────────────────────────────

    async fn create_run(&self, run: &ProcessingRun) -> Result<(), DatabaseError>;

    /// Finalize a run. Only a `running` row is updated.
    async fn finish_run(&self, run: &ProcessingRun) -> Result<(), DatabaseError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<ProcessingRun>, DatabaseError>;

    /// Fail every `running` run and `processing` message. Callers must hold
    /// the run lock, so anything still in flight belongs to a dead run.
    async fn fail_interrupted(&self, reason: &str) -> Result<InterruptedWork, DatabaseError>;

    // ── Institution registry ────────────────────────────────────────

    async fn lookup_institution(&self, name: &str) -> Result<InstitutionMatch, DatabaseError>;

    async fn add_institution(&self, canonical: &str, variant: &str) -> Result<(), DatabaseError>;
}
