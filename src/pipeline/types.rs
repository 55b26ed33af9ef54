//! Shared types for the candidate processing pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Stage / action ──────────────────────────────────────────────────

/// Pipeline stage an audit entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Run,
    Route,
    MessageFetch,
    AttachmentFetch,
    Admission,
    Extraction,
    ExtractionError,
    FabricationCheck,
    EligibilityCheck,
    DedupCheck,
    Persistence,
    MessageComplete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Route => "route",
            Self::MessageFetch => "message_fetch",
            Self::AttachmentFetch => "attachment_fetch",
            Self::Admission => "admission",
            Self::Extraction => "extraction",
            Self::ExtractionError => "extraction_error",
            Self::FabricationCheck => "fabrication_check",
            Self::EligibilityCheck => "eligibility_check",
            Self::DedupCheck => "dedup_check",
            Self::Persistence => "persistence",
            Self::MessageComplete => "message_complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "run" => Self::Run,
            "route" => Self::Route,
            "message_fetch" => Self::MessageFetch,
            "attachment_fetch" => Self::AttachmentFetch,
            "admission" => Self::Admission,
            "extraction" => Self::Extraction,
            "extraction_error" => Self::ExtractionError,
            "fabrication_check" => Self::FabricationCheck,
            "eligibility_check" => Self::EligibilityCheck,
            "dedup_check" => Self::DedupCheck,
            "persistence" => Self::Persistence,
            "message_complete" => Self::MessageComplete,
            _ => return None,
        })
    }
}

/// Outcome recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Pass,
    Reject,
    Skip,
    Flag,
    Error,
    Info,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Reject => "reject",
            Self::Skip => "skip",
            Self::Flag => "flag",
            Self::Error => "error",
            Self::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pass" => Self::Pass,
            "reject" => Self::Reject,
            "skip" => Self::Skip,
            "flag" => Self::Flag,
            "error" => Self::Error,
            "info" => Self::Info,
            _ => return None,
        })
    }
}

// ── Statuses ────────────────────────────────────────────────────────

/// Lifecycle of an inbound message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => return None,
        })
    }

    /// Terminal states carry a processed timestamp.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle of a processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "completed_with_errors" => Self::CompletedWithErrors,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

// ── Candidate draft ─────────────────────────────────────────────────

/// Highest qualification class reported by extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationType {
    Bachelors,
    Honours,
    Masters,
    Doctorate,
    Pgce,
    Diploma,
    Certificate,
    Other,
    #[default]
    Unknown,
}

impl QualificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bachelors => "bachelors",
            Self::Honours => "honours",
            Self::Masters => "masters",
            Self::Doctorate => "doctorate",
            Self::Pgce => "pgce",
            Self::Diploma => "diploma",
            Self::Certificate => "certificate",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient mapping from whatever label the extractor produced.
    pub fn from_label(label: &str) -> Self {
        let l = label.trim().to_lowercase();
        if l.is_empty() {
            return Self::Unknown;
        }
        if l.contains("phd") || l.contains("doctor") {
            Self::Doctorate
        } else if l.contains("master") || l.starts_with("m.") || l == "med" || l == "ma" {
            Self::Masters
        } else if l.contains("honour") || l.contains("honor") {
            Self::Honours
        } else if l.contains("pgce") || l.contains("postgraduate certificate in education") {
            Self::Pgce
        } else if l.contains("bachelor") || l.starts_with("b.") || l == "bed" || l == "ba" {
            Self::Bachelors
        } else if l.contains("diploma") {
            Self::Diploma
        } else if l.contains("certificate") {
            Self::Certificate
        } else if l == "unknown" {
            Self::Unknown
        } else {
            Self::Other
        }
    }

    /// Qualifications that never satisfy the degree requirement on their own.
    pub fn is_sub_degree(&self) -> bool {
        matches!(self, Self::Diploma | Self::Certificate)
    }
}

/// Candidate extracted from one document, not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateDraft {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Raw qualification text as written in the document.
    pub qualification: Option<String>,
    pub institution: Option<String>,
    pub degree_country: Option<String>,
    pub has_degree: bool,
    pub qualification_type: QualificationType,
    pub years_experience: f64,
    pub teaching_phases: Vec<String>,
    pub subjects: Vec<String>,
    /// Registered with a professional teaching council.
    pub has_teaching_registration: bool,
    pub has_tefl: bool,
    pub countries: Vec<String>,
    pub current_location: Option<String>,
    pub holistic_score: Option<f64>,
    pub notes: Option<String>,
}

// ── Run statistics ──────────────────────────────────────────────────

/// Counters for a single run. One mutable aggregate, owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub routes_processed: u32,
    pub emails_found: u32,
    pub emails_processed: u32,
    pub emails_skipped: u32,
    pub attachments_found: u32,
    pub attachments_admitted: u32,
    pub attachments_rejected: u32,
    pub candidates_extracted: u32,
    pub candidates_inserted: u32,
    pub candidates_rejected: u32,
    pub candidates_duplicate: u32,
    pub candidates_flagged: u32,
    pub ai_calls: u32,
    pub errors: u32,
    pub deadline_exceeded: bool,
}

impl RunStats {
    /// Final status for a run that got past route loading.
    pub fn final_status(&self) -> RunStatus {
        if self.errors == 0 && !self.deadline_exceeded {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        }
    }
}

/// What a trigger returns to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub target_day: NaiveDate,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: RunStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
