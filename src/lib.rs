//! Main library entry point for pg-osc.
//!
//! Performs an ALTER TABLE on a live table while holding an exclusive lock
//! only for the final rename swap: a shadow table receives the DDL, a
//! row-level trigger captures concurrent writes into an audit table, the
//! existing rows are bulk-copied, the audit backlog is replayed in batches
//! until it converges, and the tables are swapped under a short lock.

pub mod analyzer;
pub mod args;
pub mod backfill;
pub mod capture;
pub mod catalog;
pub mod error;
pub mod functions;
pub mod lock;
pub mod orchestrator;
pub mod replay;
pub mod session;
pub mod sql;
pub mod swap;

// Re-export key types for ergonomic access

pub use analyzer::{DdlAnalyzer, RenamedColumn, StructuralDelta};
pub use error::OscError;
pub use orchestrator::{Orchestrator, PgPool, Phase};
pub use replay::{CapturedRow, Operation, ReplayEngine};
pub use session::{MigrationState, Session};
