//! Persistence layer: libSQL-backed intake storage.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AuditEntry, CandidateRecord, ClaimOutcome, InboundMessageRecord, IntakeStore, InterruptedWork,
    ProcessingRun, TenantRoute,
};
