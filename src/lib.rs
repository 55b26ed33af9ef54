//! Candidate intake: CVs from routed mailboxes to validated candidate records.

pub mod config;
pub mod error;
pub mod extraction;
pub mod mail;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod trigger;
