//! Run trigger: the single entry point shared by HTTP, cron and one-shot mode.
//!
//! Holds an in-process run lock so overlapping triggers are turned away
//! instead of racing each other on the same mailboxes. The run itself is a
//! spawned task that owns the lock, so it finishes even when the caller
//! stops waiting.

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PipelineError, TriggerError};
use crate::pipeline::RunCoordinator;
use crate::pipeline::calendar::{default_target_day, parse_day};
use crate::pipeline::types::RunReport;
use crate::store::IntakeStore;

/// Recorded on runs and messages left unfinished by a dead process.
const INTERRUPTED: &str = "interrupted before completion";

pub struct RunTrigger {
    coordinator: Arc<RunCoordinator>,
    reference_offset: FixedOffset,
    run_lock: Arc<Mutex<()>>,
}

impl RunTrigger {
    pub fn new(coordinator: Arc<RunCoordinator>, reference_offset: FixedOffset) -> Self {
        Self {
            coordinator,
            reference_offset,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn IntakeStore> {
        self.coordinator.store()
    }

    /// Explicit day, or yesterday in the reference timezone.
    pub fn resolve_day(&self, raw: Option<&str>) -> Result<NaiveDate, TriggerError> {
        match raw.map(str::trim).filter(|r| !r.is_empty()) {
            Some(raw) => parse_day(raw).map_err(|e| TriggerError::InvalidDay(e.to_string())),
            None => Ok(default_target_day(Utc::now(), self.reference_offset)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Run once for `target_day`. Fails fast with `Busy` while another run holds the lock.
    ///
    /// Dropping the returned future does not cancel the run.
    pub async fn trigger(&self, target_day: Option<NaiveDate>) -> Result<RunReport, TriggerError> {
        let Ok(guard) = Arc::clone(&self.run_lock).try_lock_owned() else {
            warn!("Run requested while another run is active");
            return Err(TriggerError::Busy);
        };

        let day = target_day
            .unwrap_or_else(|| default_target_day(Utc::now(), self.reference_offset));
        info!(target_day = %day, "Run triggered");

        let coordinator = Arc::clone(&self.coordinator);
        let run = tokio::spawn(async move {
            let _guard = guard;
            // Holding the lock means nothing else in this process is running.
            if let Err(e) = coordinator.store().fail_interrupted(INTERRUPTED).await {
                warn!(error = %e, "Could not sweep interrupted work");
            }
            coordinator.run(day).await
        });

        let result = run
            .await
            .map_err(|e| TriggerError::Infrastructure(format!("run task failed: {e}")))?;
        result.map_err(|e| match e {
            PipelineError::InvalidDay(d) => TriggerError::InvalidDay(d),
            other => TriggerError::Infrastructure(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::PipelineConfig;
    use crate::error::{ExtractionError, MailError};
    use crate::extraction::{DocumentInput, ExtractionAdapter, ExtractionBackend};
    use crate::mail::{FetchedMessage, MailSource, MessageSummary};
    use crate::pipeline::calendar::{DayWindow, south_africa_offset};
    use crate::pipeline::types::{RunStats, RunStatus};
    use crate::store::{LibSqlBackend, ProcessingRun, TenantRoute};
    use uuid::Uuid;

    struct EmptyMail;

    #[async_trait]
    impl MailSource for EmptyMail {
        fn name(&self) -> &str {
            "empty"
        }
        async fn list_messages(&self, _: &TenantRoute, _: &DayWindow) -> Result<Vec<MessageSummary>, MailError> {
            Ok(vec![])
        }
        async fn get_message(&self, _: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError> {
            Err(MailError::MessageNotFound(id.into()))
        }
        async fn get_attachment(&self, _: &TenantRoute, m: &str, a: &str) -> Result<Vec<u8>, MailError> {
            Err(MailError::AttachmentNotFound {
                message_id: m.into(),
                attachment_id: a.into(),
            })
        }
    }

    struct NoExtractor;

    #[async_trait]
    impl ExtractionBackend for NoExtractor {
        fn name(&self) -> &str {
            "none"
        }
        async fn extract(&self, _: &DocumentInput) -> Result<String, ExtractionError> {
            Ok("{}".into())
        }
    }

    async fn trigger() -> RunTrigger {
        let store: Arc<dyn IntakeStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let coordinator = RunCoordinator::new(
            store,
            Arc::new(EmptyMail),
            ExtractionAdapter::new(Arc::new(NoExtractor)),
            &PipelineConfig::default(),
        );
        RunTrigger::new(Arc::new(coordinator), south_africa_offset())
    }

    #[tokio::test]
    async fn resolves_explicit_and_default_days() {
        let t = trigger().await;
        assert_eq!(
            t.resolve_day(Some("2024-03-15")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
        assert_eq!(
            t.resolve_day(None).unwrap(),
            default_target_day(Utc::now(), south_africa_offset())
        );
        assert!(matches!(
            t.resolve_day(Some("15/03/2024")),
            Err(TriggerError::InvalidDay(_))
        ));
    }

    #[tokio::test]
    async fn run_with_no_routes_completes() {
        let t = trigger().await;
        let report = t
            .trigger(Some(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stats.routes_processed, 0);
        assert!(!t.is_running());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_busy() {
        let t = trigger().await;
        let _held = Arc::clone(&t.run_lock).try_lock_owned().unwrap();
        assert!(t.is_running());
        assert!(matches!(t.trigger(None).await, Err(TriggerError::Busy)));
    }

    #[tokio::test]
    async fn stale_running_run_is_failed_by_next_trigger() {
        let t = trigger().await;
        let stale = ProcessingRun {
            id: Uuid::new_v4(),
            target_day: NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            status: RunStatus::Running,
            stats: RunStats::default(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
        };
        t.store().create_run(&stale).await.unwrap();

        let report = t
            .trigger(Some(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);

        let swept = t.store().get_run(stale.id).await.unwrap().unwrap();
        assert_eq!(swept.status, RunStatus::Failed);
        assert_eq!(swept.error.as_deref(), Some(INTERRUPTED));
    }
}
