//! Best-effort audit trail for a single run.
//!
//! Every write is spawned as its own task. A failed insert is logged and
//! dropped; callers never see it. `flush()` waits for outstanding writes so
//! a finished run's trail is complete before the run row is finalized.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::warn;
use uuid::Uuid;

use crate::pipeline::types::{AuditAction, Stage};
use crate::store::{AuditEntry, IntakeStore, TenantRoute};

/// Tenant and message an entry is scoped to.
#[derive(Debug, Clone, Default)]
pub struct AuditScope {
    pub message_record_id: Option<Uuid>,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
}

impl AuditScope {
    /// Run-level entries carry no tenant.
    pub fn run() -> Self {
        Self::default()
    }

    pub fn route(route: &TenantRoute) -> Self {
        Self {
            message_record_id: None,
            org_id: Some(route.org_id.clone()),
            user_id: Some(route.user_id.clone()),
        }
    }

    pub fn with_message(&self, message_record_id: Uuid) -> Self {
        Self {
            message_record_id: Some(message_record_id),
            ..self.clone()
        }
    }
}

/// Candidate linkage for entries that concern one candidate.
#[derive(Debug, Clone, Default)]
pub struct CandidateRef {
    pub id: Option<Uuid>,
    pub name: Option<String>,
}

impl CandidateRef {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: Some(name.to_string()),
        }
    }

    pub fn persisted(id: Uuid, name: &str) -> Self {
        Self {
            id: Some(id),
            name: Some(name.to_string()),
        }
    }
}

pub struct AuditRecorder {
    store: Arc<dyn IntakeStore>,
    run_id: Uuid,
    pending: Mutex<JoinSet<()>>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn IntakeStore>, run_id: Uuid) -> Self {
        Self {
            store,
            run_id,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Queue one entry. Never fails.
    pub fn record(
        &self,
        scope: &AuditScope,
        stage: Stage,
        action: AuditAction,
        reason: impl Into<String>,
        context: Value,
        candidate: CandidateRef,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            message_record_id: scope.message_record_id,
            org_id: scope.org_id.clone(),
            user_id: scope.user_id.clone(),
            stage,
            action,
            reason: reason.into(),
            context,
            candidate_id: candidate.id,
            candidate_name: candidate.name,
            created_at: Utc::now(),
        };

        let store = Arc::clone(&self.store);
        let write = async move {
            if let Err(e) = store.insert_audit(&entry).await {
                warn!(
                    run_id = %entry.run_id,
                    stage = entry.stage.as_str(),
                    action = entry.action.as_str(),
                    error = %e,
                    "Audit write failed"
                );
            }
        };

        match self.pending.lock() {
            Ok(mut pending) => {
                pending.spawn(write);
            }
            Err(_) => {
                warn!(run_id = %self.run_id, "Audit task set poisoned, writing detached");
                tokio::spawn(write);
            }
        }
    }

    /// Wait for every queued write to settle.
    pub async fn flush(&self) {
        let mut pending = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(run_id = %self.run_id, error = %e, "Audit task panicked");
            }
        }
    }
}
