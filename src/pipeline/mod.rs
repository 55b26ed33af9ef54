//! Candidate intake pipeline.
//!
//! Every attachment on a routed message flows through:
//! 1. `AdmissionFilter::check()`: type and size only, never filename keywords
//! 2. `ExtractionAdapter::extract()`: one AI call per document
//! 3. `FabricationScreen::screen()`: placeholder and known-fake names
//! 4. `EligibilityGate::evaluate()`: degree and national-origin gates
//! 5. `DedupCheck::check()`: recent candidate for the same org
//! 6. persistence
//!
//! `RunCoordinator` drives the stages and owns the run statistics. Every
//! decision is written to the audit trail.

pub mod admission;
pub mod audit;
pub mod calendar;
pub mod coordinator;
pub mod dedup;
pub mod eligibility;
pub mod fabrication;
pub mod registry;
pub mod types;

pub use coordinator::RunCoordinator;
