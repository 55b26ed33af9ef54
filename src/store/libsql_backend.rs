//! libSQL backend for `IntakeStore`.
//!
//! One connection, reused for every operation. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::registry::{InstitutionMatch, best_match, normalize_institution};
use crate::pipeline::types::{
    AuditAction, CandidateDraft, MessageStatus, QualificationType, RunStats, RunStatus, Stage,
};
use crate::store::migrations;
use crate::store::traits::{
    AuditEntry, CandidateRecord, ClaimOutcome, InboundMessageRecord, IntakeStore, InterruptedWork,
    ProcessingRun, TenantRoute,
};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed microsecond precision keeps lexical order chronological.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

fn parse_uuid(s: &str) -> Result<Uuid, libsql::Error> {
    Uuid::parse_str(s).map_err(|e| libsql::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, libsql::Error> {
    s.as_deref().map(parse_uuid).transpose()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn opt_millis(ms: Option<u64>) -> libsql::Value {
    match ms.and_then(|ms| i64::try_from(ms).ok()) {
        Some(ms) => libsql::Value::Integer(ms),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

const ROUTE_COLUMNS: &str = "id, source_address, user_id, org_id, timezone, active";

const MESSAGE_COLUMNS: &str = "id, run_id, route_id, org_id, user_id, source_message_id, thread_id, sender, subject, received_at, attachment_count, status, error, processed_at, created_at";

const CANDIDATE_COLUMNS: &str = "id, org_id, user_id, source_address, message_record_id, source_filename, canonical_day, name, email, phone, qualification, qualification_type, has_degree, institution, institution_canonical, degree_country, years_experience, teaching_phases, subjects, has_teaching_registration, has_tefl, countries, current_location, holistic_score, notes, flags, created_at";

const AUDIT_COLUMNS: &str = "id, run_id, message_record_id, org_id, user_id, stage, action, reason, context, candidate_id, candidate_name, created_at";

const RUN_COLUMNS: &str = "id, target_day, status, stats, started_at, completed_at, duration_ms, error";

fn row_to_route(row: &libsql::Row) -> Result<TenantRoute, libsql::Error> {
    let id: String = row.get(0)?;
    let active: i64 = row.get(5)?;
    Ok(TenantRoute {
        id: parse_uuid(&id)?,
        source_address: row.get(1)?,
        user_id: row.get(2)?,
        org_id: row.get(3)?,
        timezone: row.get(4)?,
        active: active != 0,
    })
}

fn row_to_message(row: &libsql::Row) -> Result<InboundMessageRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let route_id: String = row.get(2)?;
    let received_str: String = row.get(9)?;
    let attachment_count: i64 = row.get(10)?;
    let status_str: String = row.get(11)?;
    let processed_str: Option<String> = row.get(13)?;
    let created_str: String = row.get(14)?;

    Ok(InboundMessageRecord {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        route_id: parse_uuid(&route_id)?,
        org_id: row.get(3)?,
        user_id: row.get(4)?,
        source_message_id: row.get(5)?,
        thread_id: row.get(6)?,
        sender: row.get(7)?,
        subject: row.get(8)?,
        received_at: parse_datetime(&received_str),
        attachment_count: u32::try_from(attachment_count).unwrap_or_default(),
        status: MessageStatus::parse(&status_str).unwrap_or(MessageStatus::Failed),
        error: row.get(12)?,
        processed_at: parse_optional_datetime(&processed_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_candidate(row: &libsql::Row) -> Result<CandidateRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let message_record_id: String = row.get(4)?;
    let day_str: String = row.get(6)?;
    let qualification_type: String = row.get(11)?;
    let has_degree: i64 = row.get(12)?;
    let phases: String = row.get(17)?;
    let subjects: String = row.get(18)?;
    let registration: i64 = row.get(19)?;
    let tefl: i64 = row.get(20)?;
    let countries: String = row.get(21)?;
    let flags: String = row.get(25)?;
    let created_str: String = row.get(26)?;

    let draft = CandidateDraft {
        name: row.get(7)?,
        email: row.get(8)?,
        phone: row.get(9)?,
        qualification: row.get(10)?,
        qualification_type: QualificationType::from_label(&qualification_type),
        has_degree: has_degree != 0,
        institution: row.get(13)?,
        degree_country: row.get(15)?,
        years_experience: row.get(16)?,
        teaching_phases: json_list(&phases),
        subjects: json_list(&subjects),
        has_teaching_registration: registration != 0,
        has_tefl: tefl != 0,
        countries: json_list(&countries),
        current_location: row.get(22)?,
        holistic_score: row.get(23)?,
        notes: row.get(24)?,
    };

    Ok(CandidateRecord {
        id: parse_uuid(&id)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        source_address: row.get(3)?,
        message_record_id: parse_uuid(&message_record_id)?,
        source_filename: row.get(5)?,
        canonical_day: parse_day(&day_str),
        draft,
        institution_canonical: row.get(14)?,
        flags: json_list(&flags),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, libsql::Error> {
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let message_record_id: Option<String> = row.get(2)?;
    let stage_str: String = row.get(5)?;
    let action_str: String = row.get(6)?;
    let context_str: String = row.get(8)?;
    let candidate_id: Option<String> = row.get(9)?;
    let created_str: String = row.get(11)?;

    Ok(AuditEntry {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        message_record_id: parse_optional_uuid(message_record_id)?,
        org_id: row.get(3)?,
        user_id: row.get(4)?,
        stage: Stage::parse(&stage_str).unwrap_or(Stage::Run),
        action: AuditAction::parse(&action_str).unwrap_or(AuditAction::Error),
        reason: row.get(7)?,
        context: serde_json::from_str(&context_str).unwrap_or(serde_json::Value::Null),
        candidate_id: parse_optional_uuid(candidate_id)?,
        candidate_name: row.get(10)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<ProcessingRun, libsql::Error> {
    let id: String = row.get(0)?;
    let day_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let stats_str: String = row.get(3)?;
    let started_str: String = row.get(4)?;
    let completed_str: Option<String> = row.get(5)?;
    let duration_ms: Option<i64> = row.get(6)?;

    Ok(ProcessingRun {
        id: parse_uuid(&id)?,
        target_day: parse_day(&day_str),
        status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
        stats: serde_json::from_str::<RunStats>(&stats_str).unwrap_or_default(),
        started_at: parse_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        duration_ms: duration_ms.and_then(|ms| u64::try_from(ms).ok()),
        error: row.get(7)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl IntakeStore for LibSqlBackend {
    // ── Routes ──────────────────────────────────────────────────────

    async fn list_routes(&self) -> Result<Vec<TenantRoute>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ROUTE_COLUMNS} FROM tenant_routes WHERE active = 1 ORDER BY created_at ASC, rowid ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_routes: {e}")))?;

        let mut routes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_routes: {e}")))?
        {
            let route =
                row_to_route(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            routes.push(route);
        }
        Ok(routes)
    }

    async fn insert_route(&self, route: &TenantRoute) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenant_routes (id, source_address, user_id, org_id, timezone, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    route.id.to_string(),
                    route.source_address.as_str(),
                    route.user_id.as_str(),
                    route.org_id.as_str(),
                    route.timezone.as_str(),
                    flag(route.active),
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_route: {e}")))?;

        debug!(route_id = %route.id, address = %route.source_address, "Route inserted");
        Ok(())
    }

    // ── Inbound messages ────────────────────────────────────────────

    async fn message_exists(
        &self,
        source_message_id: &str,
        org_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM inbound_messages WHERE source_message_id = ?1 AND org_id = ?2 LIMIT 1",
                params![source_message_id, org_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("message_exists: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("message_exists: {e}"))),
        }
    }

    async fn claim_message(
        &self,
        record: &InboundMessageRecord,
    ) -> Result<ClaimOutcome, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO inbound_messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT (source_message_id, org_id) DO NOTHING"
                ),
                params![
                    record.id.to_string(),
                    record.run_id.to_string(),
                    record.route_id.to_string(),
                    record.org_id.as_str(),
                    record.user_id.as_str(),
                    record.source_message_id.as_str(),
                    opt_text(record.thread_id.as_deref()),
                    record.sender.as_str(),
                    opt_text(record.subject.as_deref()),
                    ts(record.received_at),
                    i64::from(record.attachment_count),
                    record.status.as_str(),
                    opt_text(record.error.as_deref()),
                    opt_text(record.processed_at.map(ts).as_deref()),
                    ts(record.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_message: {e}")))?;

        if inserted == 0 {
            debug!(
                source_message_id = %record.source_message_id,
                org_id = %record.org_id,
                "Message already claimed"
            );
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        Ok(ClaimOutcome::Claimed)
    }

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let processed_at = status.is_terminal().then(|| ts(Utc::now()));
        let updated = self
            .conn()
            .execute(
                "UPDATE inbound_messages
                 SET status = ?1, error = ?2, processed_at = COALESCE(?3, processed_at)
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    opt_text(error),
                    opt_text(processed_at.as_deref()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_message_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "inbound_message".into(),
                id: id.to_string(),
            });
        }
        debug!(id = %id, status = status.as_str(), "Message status updated");
        Ok(())
    }

    async fn get_message_record(
        &self,
        source_message_id: &str,
        org_id: &str,
    ) -> Result<Option<InboundMessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM inbound_messages WHERE source_message_id = ?1 AND org_id = ?2"
                ),
                params![source_message_id, org_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message_record: {e}"))),
        }
    }

    // ── Candidates ──────────────────────────────────────────────────

    async fn insert_candidate(&self, candidate: &CandidateRecord) -> Result<(), DatabaseError> {
        let d = &candidate.draft;
        let phases = to_json(&d.teaching_phases)?;
        let subjects = to_json(&d.subjects)?;
        let countries = to_json(&d.countries)?;
        let flags = to_json(&candidate.flags)?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO candidates ({CANDIDATE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                             ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
                ),
                params![
                    candidate.id.to_string(),
                    candidate.org_id.as_str(),
                    candidate.user_id.as_str(),
                    candidate.source_address.as_str(),
                    candidate.message_record_id.to_string(),
                    candidate.source_filename.as_str(),
                    candidate.canonical_day.format("%Y-%m-%d").to_string(),
                    d.name.as_str(),
                    opt_text(d.email.as_deref()),
                    opt_text(d.phone.as_deref()),
                    opt_text(d.qualification.as_deref()),
                    d.qualification_type.as_str(),
                    flag(d.has_degree),
                    opt_text(d.institution.as_deref()),
                    opt_text(candidate.institution_canonical.as_deref()),
                    opt_text(d.degree_country.as_deref()),
                    d.years_experience,
                    phases,
                    subjects,
                    flag(d.has_teaching_registration),
                    flag(d.has_tefl),
                    countries,
                    opt_text(d.current_location.as_deref()),
                    opt_real(d.holistic_score),
                    opt_text(d.notes.as_deref()),
                    flags,
                    ts(candidate.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_candidate: {e}")))?;

        debug!(candidate_id = %candidate.id, org_id = %candidate.org_id, "Candidate inserted");
        Ok(())
    }

    async fn find_recent_candidate(
        &self,
        org_id: &str,
        email: Option<&str>,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let email = email.map(str::trim).filter(|e| !e.is_empty());
        let (sql, key) = match email {
            Some(email) => (
                "SELECT id FROM candidates
                 WHERE org_id = ?1 AND created_at >= ?2 AND lower(email) = lower(?3)
                 ORDER BY created_at DESC LIMIT 1",
                email,
            ),
            None => (
                "SELECT id FROM candidates
                 WHERE org_id = ?1 AND created_at >= ?2 AND lower(name) = lower(?3)
                 ORDER BY created_at DESC LIMIT 1",
                name.trim(),
            ),
        };

        let mut rows = self
            .conn()
            .query(sql, params![org_id, ts(since), key])
            .await
            .map_err(|e| DatabaseError::Query(format!("find_recent_candidate: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                let id = parse_uuid(&id)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(id))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_recent_candidate: {e}"))),
        }
    }

    async fn list_candidates(&self, org_id: &str) -> Result<Vec<CandidateRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE org_id = ?1 ORDER BY created_at ASC"
                ),
                params![org_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_candidates: {e}")))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_candidate(&row) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => warn!("Skipping candidate row: {e}"),
            }
        }
        Ok(candidates)
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        let context = to_json(&entry.context)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO audit_log ({AUDIT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    entry.id.to_string(),
                    entry.run_id.to_string(),
                    opt_uuid(entry.message_record_id),
                    opt_text(entry.org_id.as_deref()),
                    opt_text(entry.user_id.as_deref()),
                    entry.stage.as_str(),
                    entry.action.as_str(),
                    entry.reason.as_str(),
                    context,
                    opt_uuid(entry.candidate_id),
                    opt_text(entry.candidate_name.as_deref()),
                    ts(entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_audit: {e}")))?;
        Ok(())
    }

    async fn list_audit(&self, run_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_audit: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_audit(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping audit row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn create_run(&self, run: &ProcessingRun) -> Result<(), DatabaseError> {
        let stats = to_json(&run.stats)?;
        self.conn()
            .execute(
                &format!("INSERT INTO processing_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    run.id.to_string(),
                    run.target_day.format("%Y-%m-%d").to_string(),
                    run.status.as_str(),
                    stats,
                    ts(run.started_at),
                    opt_text(run.completed_at.map(ts).as_deref()),
                    opt_millis(run.duration_ms),
                    opt_text(run.error.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_run: {e}")))?;

        debug!(run_id = %run.id, target_day = %run.target_day, "Run created");
        Ok(())
    }

    async fn finish_run(&self, run: &ProcessingRun) -> Result<(), DatabaseError> {
        let stats = to_json(&run.stats)?;
        let updated = self
            .conn()
            .execute(
                "UPDATE processing_runs
                 SET status = ?1, stats = ?2, completed_at = ?3, duration_ms = ?4, error = ?5
                 WHERE id = ?6 AND status = 'running'",
                params![
                    run.status.as_str(),
                    stats,
                    opt_text(run.completed_at.map(ts).as_deref()),
                    opt_millis(run.duration_ms),
                    opt_text(run.error.as_deref()),
                    run.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_run: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "running processing_run".into(),
                id: run.id.to_string(),
            });
        }
        debug!(run_id = %run.id, status = run.status.as_str(), "Run finished");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ProcessingRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM processing_runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let run =
                    row_to_run(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(run))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_run: {e}"))),
        }
    }

    async fn fail_interrupted(&self, reason: &str) -> Result<InterruptedWork, DatabaseError> {
        let now = ts(Utc::now());
        let messages = self
            .conn()
            .execute(
                "UPDATE inbound_messages
                 SET status = 'failed', error = ?1, processed_at = ?2
                 WHERE status = 'processing'",
                params![reason, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted messages: {e}")))?;
        let runs = self
            .conn()
            .execute(
                "UPDATE processing_runs
                 SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE status = 'running'",
                params![reason, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted runs: {e}")))?;

        if runs > 0 || messages > 0 {
            warn!(runs, messages, reason, "Interrupted work marked failed");
        }
        Ok(InterruptedWork { runs, messages })
    }

    // ── Institution registry ────────────────────────────────────────

    async fn lookup_institution(&self, name: &str) -> Result<InstitutionMatch, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT canonical_name, variant FROM institutions ORDER BY id ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_institution: {e}")))?;

        let mut entries: Vec<(String, String)> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let canonical: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let variant: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            entries.push((canonical, variant));
        }

        Ok(best_match(
            name,
            entries.iter().map(|(c, v)| (c.as_str(), v.as_str())),
        ))
    }

    async fn add_institution(&self, canonical: &str, variant: &str) -> Result<(), DatabaseError> {
        let variant = normalize_institution(variant);
        if variant.is_empty() {
            return Err(DatabaseError::Query(
                "add_institution: variant is empty after normalization".into(),
            ));
        }
        self.conn()
            .execute(
                "INSERT INTO institutions (canonical_name, variant) VALUES (?1, ?2)
                 ON CONFLICT (variant) DO UPDATE SET canonical_name = excluded.canonical_name",
                params![canonical, variant.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_institution: {e}")))?;

        info!(canonical, variant = %variant, "Institution variant registered");
        Ok(())
    }
}
