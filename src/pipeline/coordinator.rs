//! Run coordinator: drives one intake run end to end.
//!
//! Flow per route:
//! 1. List messages received on the target day (route timezone)
//! 2. Skip anything already claimed, fetch the rest, claim atomically
//! 3. Per attachment: admission → fetch → extraction (optionally concurrent)
//! 4. Per draft, folded in attachment order: fabrication → eligibility →
//!    dedup → persist
//!
//! Failures are caught at the narrowest scope. A message failure never
//! stops the route, a route failure never stops the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use futures::{FutureExt, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ExtractionError, MailError, PipelineError};
use crate::extraction::{DocumentInput, Extraction, ExtractionAdapter};
use crate::mail::{AttachmentRef, FetchedMessage, MailSource, MessageSummary};
use crate::pipeline::admission::{Admission, AdmissionFilter};
use crate::pipeline::audit::{AuditRecorder, AuditScope, CandidateRef};
use crate::pipeline::calendar::{DayWindow, canonical_day};
use crate::pipeline::dedup::{DedupCheck, DedupOutcome, MatchKey};
use crate::pipeline::eligibility::{Decision, EligibilityGate, OriginProfile};
use crate::pipeline::fabrication::{FabricationScreen, Screening};
use crate::pipeline::registry::{InstitutionMatch, normalize_institution};
use crate::pipeline::types::{
    AuditAction, CandidateDraft, MessageStatus, RunReport, RunStats, RunStatus, Stage,
};
use crate::store::{
    CandidateRecord, ClaimOutcome, InboundMessageRecord, IntakeStore, ProcessingRun, TenantRoute,
};

/// What happened to one attachment before any candidate work.
enum AttachmentOutcome {
    Denied(&'static str),
    FetchFailed(MailError),
    ExtractionFailed(ExtractionError),
    Extracted(Extraction),
    /// The run budget ran out before or during the work.
    OutOfTime { extraction_started: bool },
}

/// Per-run state shared by every step.
struct RunContext {
    run_id: Uuid,
    target_day: NaiveDate,
    deadline: Instant,
    audit: AuditRecorder,
}

impl RunContext {
    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn tokio_deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::from_std(self.deadline)
    }
}

/// A claimed message and the route it arrived on.
struct ClaimedMessage<'a> {
    route: &'a TenantRoute,
    record_id: Uuid,
    message: FetchedMessage,
    day: NaiveDate,
    scope: AuditScope,
}

pub struct RunCoordinator {
    store: Arc<dyn IntakeStore>,
    mail: Arc<dyn MailSource>,
    extractor: ExtractionAdapter,
    admission: AdmissionFilter,
    fabrication: FabricationScreen,
    eligibility: EligibilityGate,
    dedup: DedupCheck,
    concurrency: usize,
    run_budget: Duration,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn IntakeStore>,
        mail: Arc<dyn MailSource>,
        extractor: ExtractionAdapter,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            dedup: DedupCheck::new(Arc::clone(&store), config.dedup_window),
            store,
            mail,
            extractor,
            admission: AdmissionFilter::new(config.min_attachment_bytes, config.max_attachment_bytes),
            fabrication: FabricationScreen::new(),
            eligibility: EligibilityGate::new(OriginProfile::south_africa()),
            concurrency: config.extraction_concurrency.max(1),
            run_budget: config.run_deadline,
        }
    }

    pub fn store(&self) -> &Arc<dyn IntakeStore> {
        &self.store
    }

    /// Execute one run for `target_day`.
    ///
    /// Only failing to create the run row is an `Err`; everything after that
    /// ends up in the report.
    pub async fn run(&self, target_day: NaiveDate) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let row = ProcessingRun {
            id: run_id,
            target_day,
            status: RunStatus::Running,
            stats: RunStats::default(),
            started_at,
            completed_at: None,
            duration_ms: None,
            error: None,
        };
        self.store
            .create_run(&row)
            .await
            .map_err(|e| PipelineError::Infrastructure(format!("cannot create run: {e}")))?;

        info!(run_id = %run_id, target_day = %target_day, "Intake run started");

        let ctx = RunContext {
            run_id,
            target_day,
            deadline: clock + self.run_budget,
            audit: AuditRecorder::new(Arc::clone(&self.store), run_id),
        };
        ctx.audit.record(
            &AuditScope::run(),
            Stage::Run,
            AuditAction::Info,
            "run started",
            json!({ "target_day": target_day, "mail_source": self.mail.name(), "extractor": self.extractor.backend_name() }),
            CandidateRef::default(),
        );

        let mut stats = RunStats::default();
        let (status, run_error) = match self.store.list_routes().await {
            Ok(routes) => {
                self.process_routes(&ctx, &routes, &mut stats).await;
                (stats.final_status(), None)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Cannot load routes, run failed");
                stats.errors += 1;
                ctx.audit.record(
                    &AuditScope::run(),
                    Stage::Run,
                    AuditAction::Error,
                    format!("cannot load routes: {e}"),
                    Value::Null,
                    CandidateRef::default(),
                );
                (RunStatus::Failed, Some(format!("cannot load routes: {e}")))
            }
        };

        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        ctx.audit.record(
            &AuditScope::run(),
            Stage::Run,
            AuditAction::Info,
            format!("run finished: {}", status.as_str()),
            json!({ "stats": stats, "duration_ms": duration_ms }),
            CandidateRef::default(),
        );
        ctx.audit.flush().await;

        let completed_at = Utc::now();
        let finished = ProcessingRun {
            status,
            stats: stats.clone(),
            completed_at: Some(completed_at),
            duration_ms: Some(duration_ms),
            error: run_error.clone(),
            ..row
        };
        if let Err(e) = self.store.finish_run(&finished).await {
            error!(run_id = %run_id, error = %e, "Failed to finalize run row");
        }

        info!(
            run_id = %run_id,
            status = status.as_str(),
            duration_ms,
            emails_found = stats.emails_found,
            candidates_inserted = stats.candidates_inserted,
            errors = stats.errors,
            deadline_exceeded = stats.deadline_exceeded,
            "Intake run finished"
        );

        Ok(RunReport {
            run_id,
            target_day,
            status,
            started_at,
            completed_at,
            duration_ms,
            stats,
            error: run_error,
        })
    }

    async fn process_routes(&self, ctx: &RunContext, routes: &[TenantRoute], stats: &mut RunStats) {
        debug!(run_id = %ctx.run_id, count = routes.len(), "Routes loaded");

        for route in routes {
            if ctx.deadline_passed() {
                stats.deadline_exceeded = true;
                break;
            }
            stats.routes_processed += 1;

            if let Err(e) = self.process_route(ctx, route, stats).await {
                warn!(
                    run_id = %ctx.run_id,
                    org_id = %route.org_id,
                    address = %route.source_address,
                    error = %e,
                    "Route abandoned"
                );
                stats.errors += 1;
                ctx.audit.record(
                    &AuditScope::route(route),
                    Stage::Route,
                    AuditAction::Error,
                    format!("route abandoned: {e}"),
                    json!({ "route_id": route.id, "source_address": route.source_address }),
                    CandidateRef::default(),
                );
            }
        }

        if stats.deadline_exceeded {
            warn!(run_id = %ctx.run_id, "Run deadline exceeded, remaining messages left for a later run");
            ctx.audit.record(
                &AuditScope::run(),
                Stage::Run,
                AuditAction::Error,
                "run deadline exceeded",
                json!({ "routes_processed": stats.routes_processed, "of": routes.len() }),
                CandidateRef::default(),
            );
        }
    }

    async fn process_route(
        &self,
        ctx: &RunContext,
        route: &TenantRoute,
        stats: &mut RunStats,
    ) -> Result<(), PipelineError> {
        let offset = route.offset()?;
        let window = DayWindow::for_day(ctx.target_day, offset);
        let scope = AuditScope::route(route);

        let summaries = self.mail.list_messages(route, &window).await?;
        stats.emails_found += summaries.len() as u32;

        info!(
            run_id = %ctx.run_id,
            org_id = %route.org_id,
            address = %route.source_address,
            count = summaries.len(),
            "Messages listed for route"
        );
        ctx.audit.record(
            &scope,
            Stage::Route,
            AuditAction::Info,
            format!("{} message(s) in window", summaries.len()),
            json!({
                "source_address": route.source_address,
                "timezone": route.timezone,
                "window_start": window.start,
                "window_end": window.end,
            }),
            CandidateRef::default(),
        );

        for summary in &summaries {
            if ctx.deadline_passed() {
                stats.deadline_exceeded = true;
                return Ok(());
            }
            self.process_message(ctx, route, offset, &scope, summary, stats).await;
        }
        Ok(())
    }

    /// Everything below this point is caught here.
    async fn process_message(
        &self,
        ctx: &RunContext,
        route: &TenantRoute,
        offset: FixedOffset,
        scope: &AuditScope,
        summary: &MessageSummary,
        stats: &mut RunStats,
    ) {
        match self.store.message_exists(&summary.id, &route.org_id).await {
            Ok(true) => {
                debug!(message_id = %summary.id, org_id = %route.org_id, "Already processed, skipping");
                stats.emails_skipped += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                self.message_error(ctx, scope, &summary.id, "existence check failed", &e.to_string(), stats);
                return;
            }
        }

        let message = match self.mail.get_message(route, &summary.id).await {
            Ok(m) => m,
            Err(e) => {
                self.message_error(ctx, scope, &summary.id, "fetch failed", &e.to_string(), stats);
                return;
            }
        };

        let now = Utc::now();
        let record = InboundMessageRecord {
            id: Uuid::new_v4(),
            run_id: ctx.run_id,
            route_id: route.id,
            org_id: route.org_id.clone(),
            user_id: route.user_id.clone(),
            source_message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            received_at: message.received_at,
            attachment_count: message.attachments.len() as u32,
            status: MessageStatus::Processing,
            error: None,
            processed_at: None,
            created_at: now,
        };
        match self.store.claim_message(&record).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyClaimed) => {
                debug!(message_id = %message.id, org_id = %route.org_id, "Claimed elsewhere, abandoning");
                stats.emails_skipped += 1;
                return;
            }
            Err(e) => {
                self.message_error(ctx, scope, &message.id, "claim failed", &e.to_string(), stats);
                return;
            }
        }

        let claimed = ClaimedMessage {
            route,
            record_id: record.id,
            day: canonical_day(message.received_at, offset),
            scope: scope.with_message(record.id),
            message,
        };

        ctx.audit.record(
            &claimed.scope,
            Stage::MessageFetch,
            AuditAction::Info,
            "message claimed",
            json!({
                "source_message_id": claimed.message.id,
                "sender": claimed.message.sender,
                "subject": claimed.message.subject,
                "received_at": claimed.message.received_at,
                "canonical_day": claimed.day,
                "attachments": claimed.message.attachments,
            }),
            CandidateRef::default(),
        );

        if let Err(e) = self.process_claimed(ctx, &claimed, stats).await {
            let reason = e.to_string();
            self.message_error(ctx, &claimed.scope, &claimed.message.id, "processing failed", &reason, stats);
            if let Err(e) = self
                .store
                .update_message_status(claimed.record_id, MessageStatus::Failed, Some(&reason))
                .await
            {
                error!(record_id = %claimed.record_id, error = %e, "Could not mark message failed");
            }
        }
    }

    async fn process_claimed(
        &self,
        ctx: &RunContext,
        claimed: &ClaimedMessage<'_>,
        stats: &mut RunStats,
    ) -> Result<(), PipelineError> {
        let attachments = &claimed.message.attachments;
        stats.attachments_found += attachments.len() as u32;

        let work: Vec<_> = attachments
            .iter()
            .map(|attachment| self.work_attachment(ctx, claimed, attachment).boxed())
            .collect();
        let outcomes: Vec<AttachmentOutcome> = futures::stream::iter(work)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut admitted = 0u32;
        let mut cut_short = false;
        for (attachment, outcome) in attachments.iter().zip(outcomes) {
            match outcome {
                AttachmentOutcome::Denied(_) => {}
                AttachmentOutcome::OutOfTime { .. } => cut_short = true,
                _ => admitted += 1,
            }
            self.fold_attachment(ctx, claimed, attachment, outcome, stats).await;
        }

        let (status, error) = if cut_short {
            (MessageStatus::Failed, Some("run deadline exceeded before all attachments were processed"))
        } else if admitted == 0 {
            (MessageStatus::Skipped, None)
        } else {
            (MessageStatus::Completed, None)
        };
        self.store
            .update_message_status(claimed.record_id, status, error)
            .await?;
        stats.emails_processed += 1;

        ctx.audit.record(
            &claimed.scope,
            Stage::MessageComplete,
            match status {
                MessageStatus::Skipped => AuditAction::Skip,
                MessageStatus::Failed => AuditAction::Error,
                _ => AuditAction::Pass,
            },
            format!("message {}", status.as_str()),
            json!({ "attachments": attachments.len(), "admitted": admitted }),
            CandidateRef::default(),
        );
        debug!(
            record_id = %claimed.record_id,
            status = status.as_str(),
            admitted,
            "Message finished"
        );
        Ok(())
    }

    /// Admission, download and extraction for one attachment. Reads only.
    async fn work_attachment(
        &self,
        ctx: &RunContext,
        claimed: &ClaimedMessage<'_>,
        attachment: &AttachmentRef,
    ) -> AttachmentOutcome {
        let admission =
            self.admission
                .check(&attachment.filename, &attachment.media_type, attachment.size);
        if let Admission::Deny(reason) = admission {
            return AttachmentOutcome::Denied(reason);
        }
        if ctx.deadline_passed() {
            return AttachmentOutcome::OutOfTime {
                extraction_started: false,
            };
        }

        let bytes = match self
            .mail
            .get_attachment(claimed.route, &claimed.message.id, &attachment.id)
            .await
        {
            Ok(b) => b,
            Err(e) => return AttachmentOutcome::FetchFailed(e),
        };

        let document = DocumentInput {
            filename: attachment.filename.clone(),
            media_type: attachment.media_type.clone(),
            bytes,
        };
        match tokio::time::timeout_at(ctx.tokio_deadline(), self.extractor.extract(&document)).await {
            Ok(Ok(extraction)) => AttachmentOutcome::Extracted(extraction),
            Ok(Err(e)) => AttachmentOutcome::ExtractionFailed(e),
            Err(_) => AttachmentOutcome::OutOfTime {
                extraction_started: true,
            },
        }
    }

    async fn fold_attachment(
        &self,
        ctx: &RunContext,
        claimed: &ClaimedMessage<'_>,
        attachment: &AttachmentRef,
        outcome: AttachmentOutcome,
        stats: &mut RunStats,
    ) {
        let scope = &claimed.scope;
        let admitted = self
            .admission
            .check(&attachment.filename, &attachment.media_type, attachment.size)
            .reason();
        let file = json!({
            "filename": attachment.filename,
            "media_type": attachment.media_type,
            "size": attachment.size,
        });

        let extraction = match outcome {
            AttachmentOutcome::Denied(reason) => {
                stats.attachments_rejected += 1;
                debug!(filename = %attachment.filename, reason, "Attachment denied");
                ctx.audit.record(scope, Stage::Admission, AuditAction::Reject, reason, file, CandidateRef::default());
                return;
            }
            AttachmentOutcome::FetchFailed(e) => {
                stats.attachments_admitted += 1;
                stats.errors += 1;
                warn!(filename = %attachment.filename, error = %e, "Attachment download failed");
                ctx.audit.record(scope, Stage::Admission, AuditAction::Pass, admitted, file.clone(), CandidateRef::default());
                ctx.audit.record(
                    scope,
                    Stage::AttachmentFetch,
                    AuditAction::Error,
                    e.to_string(),
                    file,
                    CandidateRef::default(),
                );
                return;
            }
            AttachmentOutcome::OutOfTime { extraction_started } => {
                stats.deadline_exceeded = true;
                if extraction_started {
                    stats.attachments_admitted += 1;
                    stats.ai_calls += 1;
                }
                warn!(filename = %attachment.filename, extraction_started, "Run deadline reached, attachment not processed");
                ctx.audit.record(
                    scope,
                    Stage::Extraction,
                    AuditAction::Skip,
                    "run deadline exceeded",
                    json!({ "file": file, "extraction_started": extraction_started }),
                    CandidateRef::default(),
                );
                return;
            }
            AttachmentOutcome::ExtractionFailed(e) => {
                stats.attachments_admitted += 1;
                if e.reached_backend() {
                    stats.ai_calls += 1;
                }
                stats.errors += 1;
                warn!(filename = %attachment.filename, error = %e, "Extraction failed");
                ctx.audit.record(scope, Stage::Admission, AuditAction::Pass, admitted, file.clone(), CandidateRef::default());
                ctx.audit.record(
                    scope,
                    Stage::ExtractionError,
                    AuditAction::Error,
                    e.to_string(),
                    file,
                    CandidateRef::default(),
                );
                return;
            }
            AttachmentOutcome::Extracted(extraction) => {
                stats.attachments_admitted += 1;
                stats.ai_calls += 1;
                ctx.audit.record(scope, Stage::Admission, AuditAction::Pass, admitted, file.clone(), CandidateRef::default());
                extraction
            }
        };

        let Some(draft) = extraction.draft else {
            ctx.audit.record(
                scope,
                Stage::Extraction,
                AuditAction::Skip,
                "not a recognizable document",
                json!({ "file": file, "candidates_returned": extraction.candidates_returned }),
                CandidateRef::default(),
            );
            return;
        };

        stats.candidates_extracted += 1;
        ctx.audit.record(
            scope,
            Stage::Extraction,
            AuditAction::Pass,
            "draft extracted",
            json!({
                "file": file,
                "names": [draft.name],
                "candidates_returned": extraction.candidates_returned,
            }),
            CandidateRef::named(&draft.name),
        );

        self.process_draft(ctx, claimed, &attachment.filename, draft, stats)
            .await;
    }

    /// Fabrication → eligibility → dedup → persist for one draft.
    async fn process_draft(
        &self,
        ctx: &RunContext,
        claimed: &ClaimedMessage<'_>,
        filename: &str,
        draft: CandidateDraft,
        stats: &mut RunStats,
    ) {
        let scope = &claimed.scope;
        let org_id = &claimed.route.org_id;

        if let Screening::Reject(reason) = self.fabrication.screen(&draft.name) {
            stats.candidates_rejected += 1;
            info!(org_id = %org_id, filename, reason = %reason, "Fabricated candidate rejected");
            ctx.audit.record(
                scope,
                Stage::FabricationCheck,
                AuditAction::Reject,
                reason,
                json!({ "name": draft.name }),
                CandidateRef::named(&draft.name),
            );
            return;
        }
        ctx.audit.record(
            scope,
            Stage::FabricationCheck,
            AuditAction::Pass,
            "name passed screening",
            json!({ "name": draft.name }),
            CandidateRef::named(&draft.name),
        );

        let registry = self.registry_match(&draft).await;
        let verdict = self.eligibility.evaluate(&draft, &registry);
        let action = match verdict.decision {
            Decision::Pass => AuditAction::Pass,
            Decision::Flag => AuditAction::Flag,
            Decision::Reject => AuditAction::Reject,
        };
        ctx.audit.record(
            scope,
            Stage::EligibilityCheck,
            action,
            verdict.reason.clone(),
            verdict.context(&draft, &registry),
            CandidateRef::named(&draft.name),
        );
        if verdict.decision == Decision::Reject {
            stats.candidates_rejected += 1;
            debug!(org_id = %org_id, filename, reason = %verdict.reason, "Candidate ineligible");
            return;
        }

        let now = Utc::now();
        let key = MatchKey::for_draft(&draft);
        match self.dedup.check(org_id, &draft, now).await {
            Ok(DedupOutcome::Duplicate(existing)) => {
                stats.candidates_duplicate += 1;
                ctx.audit.record(
                    scope,
                    Stage::DedupCheck,
                    AuditAction::Skip,
                    format!("duplicate by {}", key.as_str()),
                    json!({ "matched_on": key.as_str(), "existing_candidate_id": existing }),
                    CandidateRef::named(&draft.name),
                );
                return;
            }
            Ok(DedupOutcome::Unique) => {
                ctx.audit.record(
                    scope,
                    Stage::DedupCheck,
                    AuditAction::Pass,
                    "no recent match",
                    json!({ "matched_on": key.as_str() }),
                    CandidateRef::named(&draft.name),
                );
            }
            Err(e) => {
                stats.errors += 1;
                warn!(org_id = %org_id, error = %e, "Duplicate lookup failed");
                ctx.audit.record(
                    scope,
                    Stage::DedupCheck,
                    AuditAction::Error,
                    e.to_string(),
                    Value::Null,
                    CandidateRef::named(&draft.name),
                );
                return;
            }
        }

        self.persist(ctx, claimed, filename, draft, registry, verdict.flags, now, stats)
            .await;
    }

    /// Registry failures degrade to "no match".
    async fn registry_match(&self, draft: &CandidateDraft) -> InstitutionMatch {
        let Some(institution) = draft
            .institution
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
        else {
            return InstitutionMatch::None;
        };
        match self.store.lookup_institution(institution).await {
            Ok(m) => m,
            Err(e) => {
                warn!(institution, error = %e, "Registry lookup failed, treating as unmatched");
                InstitutionMatch::None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        ctx: &RunContext,
        claimed: &ClaimedMessage<'_>,
        filename: &str,
        draft: CandidateDraft,
        registry: InstitutionMatch,
        flags: Vec<String>,
        now: DateTime<Utc>,
        stats: &mut RunStats,
    ) {
        let record = CandidateRecord {
            id: Uuid::new_v4(),
            org_id: claimed.route.org_id.clone(),
            user_id: claimed.route.user_id.clone(),
            source_address: claimed.route.source_address.clone(),
            message_record_id: claimed.record_id,
            source_filename: filename.to_string(),
            canonical_day: claimed.day,
            institution_canonical: registry.canonical().map(String::from).or_else(|| {
                draft
                    .institution
                    .as_deref()
                    .map(normalize_institution)
                    .filter(|n| !n.is_empty())
            }),
            flags,
            created_at: now,
            draft,
        };

        match self.store.insert_candidate(&record).await {
            Ok(()) => {
                stats.candidates_inserted += 1;
                if !record.flags.is_empty() {
                    stats.candidates_flagged += 1;
                }
                info!(
                    candidate_id = %record.id,
                    org_id = %record.org_id,
                    canonical_day = %record.canonical_day,
                    flagged = !record.flags.is_empty(),
                    "Candidate persisted"
                );
                ctx.audit.record(
                    &claimed.scope,
                    Stage::Persistence,
                    AuditAction::Pass,
                    "candidate inserted",
                    json!({ "flags": record.flags, "canonical_day": record.canonical_day }),
                    CandidateRef::persisted(record.id, &record.draft.name),
                );
            }
            Err(e) => {
                stats.errors += 1;
                error!(org_id = %record.org_id, error = %e, "Candidate insert failed");
                ctx.audit.record(
                    &claimed.scope,
                    Stage::Persistence,
                    AuditAction::Error,
                    e.to_string(),
                    Value::Null,
                    CandidateRef::named(&record.draft.name),
                );
            }
        }
    }

    fn message_error(
        &self,
        ctx: &RunContext,
        scope: &AuditScope,
        message_id: &str,
        what: &str,
        reason: &str,
        stats: &mut RunStats,
    ) {
        stats.errors += 1;
        warn!(run_id = %ctx.run_id, message_id, error = reason, "Message {what}");
        ctx.audit.record(
            scope,
            Stage::MessageFetch,
            AuditAction::Error,
            format!("{what}: {reason}"),
            json!({ "source_message_id": message_id }),
            CandidateRef::default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::extraction::ExtractionBackend;
    use crate::store::LibSqlBackend;

    const DOC_SIZE: u64 = 20 * 1024;

    struct FakeMail {
        messages: Vec<FetchedMessage>,
        broken_attachments: Vec<String>,
    }

    #[async_trait]
    impl MailSource for FakeMail {
        fn name(&self) -> &str {
            "fake"
        }

        async fn list_messages(
            &self,
            _route: &TenantRoute,
            window: &DayWindow,
        ) -> Result<Vec<MessageSummary>, MailError> {
            Ok(self
                .messages
                .iter()
                .filter(|m| window.contains(m.received_at))
                .map(|m| MessageSummary {
                    id: m.id.clone(),
                    received_at: m.received_at,
                })
                .collect())
        }

        async fn get_message(&self, _route: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError> {
            self.messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| MailError::MessageNotFound(id.to_string()))
        }

        async fn get_attachment(
            &self,
            _route: &TenantRoute,
            message_id: &str,
            attachment_id: &str,
        ) -> Result<Vec<u8>, MailError> {
            if self.broken_attachments.iter().any(|a| a == attachment_id) {
                return Err(MailError::AttachmentNotFound {
                    message_id: message_id.into(),
                    attachment_id: attachment_id.into(),
                });
            }
            Ok(attachment_id.as_bytes().to_vec())
        }
    }

    /// Answers by filename.
    struct ScriptedExtractor {
        answers: HashMap<String, String>,
    }

    #[async_trait]
    impl ExtractionBackend for ScriptedExtractor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn extract(&self, document: &DocumentInput) -> Result<String, ExtractionError> {
            self.answers
                .get(&document.filename)
                .cloned()
                .ok_or_else(|| ExtractionError::RequestFailed {
                    backend: "scripted".into(),
                    reason: format!("no answer for {}", document.filename),
                })
        }
    }

    /// Eligible answer for every document, after `delay`.
    struct SlowExtractor {
        delay: Duration,
    }

    #[async_trait]
    impl ExtractionBackend for SlowExtractor {
        fn name(&self) -> &str {
            "slow"
        }

        async fn extract(&self, document: &DocumentInput) -> Result<String, ExtractionError> {
            tokio::time::sleep(self.delay).await;
            let stem = document.filename.trim_end_matches(".pdf");
            Ok(eligible(&format!("Lerato {stem}"), &format!("lerato.{stem}@mail.example")))
        }
    }

    /// Refuses every document before calling out.
    struct RefusingExtractor;

    #[async_trait]
    impl ExtractionBackend for RefusingExtractor {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn extract(&self, document: &DocumentInput) -> Result<String, ExtractionError> {
            Err(ExtractionError::UnreadableDocument {
                filename: document.filename.clone(),
                reason: "no text layer".into(),
            })
        }
    }

    fn attachment(id: &str, filename: &str) -> AttachmentRef {
        AttachmentRef {
            id: id.into(),
            filename: filename.into(),
            media_type: "application/pdf".into(),
            size: DOC_SIZE,
        }
    }

    fn received() -> DateTime<Utc> {
        "2024-03-15T08:00:00Z".parse().unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn eligible(name: &str, email: &str) -> String {
        json!({
            "name": name,
            "email": email,
            "has_degree": true,
            "qualification_type": "bachelors",
            "institution": "University of Pretoria",
            "years_experience": 5,
            "countries": ["South Africa"],
        })
        .to_string()
    }

    async fn setup(
        messages: Vec<FetchedMessage>,
        answers: &[(&str, String)],
        broken: &[&str],
    ) -> (RunCoordinator, Arc<dyn IntakeStore>) {
        let backend = Arc::new(ScriptedExtractor {
            answers: answers
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
        setup_with(messages, backend, broken).await
    }

    async fn setup_with(
        messages: Vec<FetchedMessage>,
        backend: Arc<dyn ExtractionBackend>,
        broken: &[&str],
    ) -> (RunCoordinator, Arc<dyn IntakeStore>) {
        let store: Arc<dyn IntakeStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_route(&TenantRoute {
                id: Uuid::new_v4(),
                source_address: "cvs@school.example".into(),
                user_id: "user-1".into(),
                org_id: "school".into(),
                timezone: "+02:00".into(),
                active: true,
            })
            .await
            .unwrap();

        let mail = Arc::new(FakeMail {
            messages,
            broken_attachments: broken.iter().map(|s| s.to_string()).collect(),
        });
        let extractor = ExtractionAdapter::new(backend);
        let coordinator =
            RunCoordinator::new(Arc::clone(&store), mail, extractor, &PipelineConfig::default());
        (coordinator, store)
    }

    fn message(id: &str, attachments: Vec<AttachmentRef>) -> FetchedMessage {
        FetchedMessage {
            id: id.into(),
            thread_id: None,
            sender: "applicant@mail.example".into(),
            subject: Some("Application".into()),
            received_at: received(),
            attachments,
        }
    }

    #[tokio::test]
    async fn eligible_candidate_is_persisted() {
        let (coordinator, store) = setup(
            vec![message("m1", vec![attachment("a1", "cv.pdf")])],
            &[("cv.pdf", eligible("Naledi Mokoena", "naledi@mail.example"))],
            &[],
        )
        .await;

        let report = coordinator.run(day()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stats.candidates_inserted, 1);
        assert_eq!(report.stats.ai_calls, 1);

        let candidates = store.list_candidates("school").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].institution_canonical.as_deref(),
            Some("University of Pretoria")
        );
        let run = store.get_run(report.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stats, report.stats);
    }

    #[tokio::test]
    async fn fetch_failure_is_one_error_and_others_continue() {
        let (coordinator, store) = setup(
            vec![message(
                "m1",
                vec![attachment("a1", "one.pdf"), attachment("a2", "two.pdf")],
            )],
            &[("two.pdf", eligible("Naledi Mokoena", "naledi@mail.example"))],
            &["a1"],
        )
        .await;

        let report = coordinator.run(day()).await.unwrap();
        assert_eq!(report.status, RunStatus::CompletedWithErrors);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.candidates_inserted, 1);

        let audit = store.list_audit(report.run_id).await.unwrap();
        assert_eq!(
            audit
                .iter()
                .filter(|e| e.stage == Stage::AttachmentFetch && e.action == AuditAction::Error)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn message_with_only_denied_attachments_is_skipped() {
        let mut tiny = attachment("a1", "cv.pdf");
        tiny.size = 100;
        let (coordinator, store) = setup(vec![message("m1", vec![tiny])], &[], &[]).await;

        let report = coordinator.run(day()).await.unwrap();
        assert_eq!(report.stats.attachments_rejected, 1);
        assert_eq!(report.stats.ai_calls, 0);

        let record = store.get_message_record("m1", "school").await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Skipped);
    }

    #[tokio::test]
    async fn spent_deadline_starts_no_message() {
        let (mut coordinator, store) = setup(
            vec![message("m1", vec![attachment("a1", "cv.pdf")])],
            &[("cv.pdf", eligible("Naledi Mokoena", "naledi@mail.example"))],
            &[],
        )
        .await;
        coordinator.run_budget = Duration::ZERO;

        let report = coordinator.run(day()).await.unwrap();
        assert!(report.stats.deadline_exceeded);
        assert_eq!(report.status, RunStatus::CompletedWithErrors);
        assert!(!store.message_exists("m1", "school").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_fan_out_keeps_attachment_order() {
        let (mut coordinator, store) = setup(
            vec![message(
                "m1",
                vec![attachment("a1", "first.pdf"), attachment("a2", "second.pdf")],
            )],
            &[
                ("first.pdf", eligible("Naledi Mokoena", "naledi@mail.example")),
                ("second.pdf", eligible("Sipho Ndlovu", "sipho@mail.example")),
            ],
            &[],
        )
        .await;
        coordinator.concurrency = 4;

        let report = coordinator.run(day()).await.unwrap();
        assert_eq!(report.stats.candidates_inserted, 2);

        let audit = store.list_audit(report.run_id).await.unwrap();
        let persisted: Vec<&str> = audit
            .iter()
            .filter(|e| e.stage == Stage::Persistence)
            .filter_map(|e| e.candidate_name.as_deref())
            .collect();
        assert_eq!(persisted, vec!["Naledi Mokoena", "Sipho Ndlovu"]);
    }

    #[tokio::test]
    async fn run_can_be_spawned() {
        let (coordinator, store) = setup(
            vec![message("m1", vec![attachment("a1", "cv.pdf")])],
            &[("cv.pdf", eligible("Naledi Mokoena", "naledi@mail.example"))],
            &[],
        )
        .await;
        let coordinator = Arc::new(coordinator);

        let handle = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.run(day()).await }
        });
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.stats.candidates_inserted, 1);
        assert_eq!(store.list_candidates("school").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deadline_cuts_a_long_message_short() {
        let (mut coordinator, store) = setup_with(
            vec![message(
                "m1",
                vec![
                    attachment("a1", "one.pdf"),
                    attachment("a2", "two.pdf"),
                    attachment("a3", "three.pdf"),
                ],
            )],
            Arc::new(SlowExtractor {
                delay: Duration::from_millis(200),
            }),
            &[],
        )
        .await;
        coordinator.run_budget = Duration::from_millis(300);

        let started = Instant::now();
        let report = coordinator.run(day()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(report.stats.deadline_exceeded);
        assert_eq!(report.status, RunStatus::CompletedWithErrors);
        assert_eq!(report.stats.candidates_inserted, 1);
        assert_eq!(report.stats.ai_calls, 2);

        let record = store.get_message_record("m1", "school").await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Failed);

        let audit = store.list_audit(report.run_id).await.unwrap();
        assert_eq!(
            audit
                .iter()
                .filter(|e| e.stage == Stage::Extraction && e.reason == "run deadline exceeded")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn refused_documents_are_not_ai_calls() {
        let (coordinator, store) = setup_with(
            vec![message("m1", vec![attachment("a1", "scan.pdf")])],
            Arc::new(RefusingExtractor),
            &[],
        )
        .await;

        let report = coordinator.run(day()).await.unwrap();
        assert_eq!(report.stats.ai_calls, 0);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.attachments_admitted, 1);

        let audit = store.list_audit(report.run_id).await.unwrap();
        assert!(audit
            .iter()
            .any(|e| e.stage == Stage::ExtractionError && e.action == AuditAction::Error));
    }
}
