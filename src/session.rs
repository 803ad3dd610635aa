//! Per-run configuration and state.
//!
//! `Session` is the immutable configuration built once from the CLI;
//! `MigrationState` holds everything derived during the run (generated object
//! names, the structural delta, captured DDL to replay at swap time). State
//! is threaded explicitly through the phases instead of living in any global
//! lookup.

use crate::analyzer::{DdlAnalyzer, StructuralDelta};
use crate::catalog::ViewDefinition;
use crate::{OscError, sql};
use anyhow::Result;

pub const DEFAULT_PULL_BATCH_COUNT: i64 = 1000;
pub const DEFAULT_DELTA_COUNT: usize = 20;
pub const DEFAULT_WAIT_TIME_FOR_LOCK: u64 = 10;

/// Immutable configuration for one migration run.
#[derive(Debug, Clone)]
pub struct Session {
    pub alter_statement: String,
    pub schema: String,
    /// Raw table name as written in the ALTER statement.
    pub table: String,
    /// Table name in SQL form, quoted when case-sensitive.
    pub table_name: String,
    pub drop: bool,
    pub kill_backends: bool,
    /// Per-attempt lock wait, in seconds.
    pub wait_time_for_lock: u64,
    pub pull_batch_count: i64,
    pub delta_count: usize,
    /// Custom bulk-copy SQL with a `%{shadow_table}` placeholder.
    pub copy_statement: Option<String>,
}

impl Session {
    /// Validates the ALTER statement and fixes the target table. Fails fast
    /// before anything touches the database.
    pub fn new(
        alter_statement: &str,
        schema: &str,
        drop: bool,
        kill_backends: bool,
        wait_time_for_lock: u64,
        pull_batch_count: i64,
        delta_count: usize,
        copy_statement: Option<String>,
    ) -> Result<Self> {
        let analyzer = DdlAnalyzer;
        analyzer.validate(alter_statement)?;
        if !analyzer.same_table(alter_statement) {
            return Err(OscError::MultipleTablesReferenced(alter_statement.to_string()).into());
        }
        let table = analyzer.table(alter_statement)?;
        let table_name = analyzer.table_name(&table);
        Ok(Session {
            alter_statement: alter_statement.to_string(),
            schema: schema.to_string(),
            table,
            table_name,
            drop,
            kill_backends,
            wait_time_for_lock,
            pull_batch_count,
            delta_count,
            copy_statement,
        })
    }
}

/// Mutable run state, filled in as phases complete and read by later phases.
#[derive(Debug, Clone, Default)]
pub struct MigrationState {
    pub shadow_table: String,
    pub audit_table: String,
    pub old_primary_table: String,
    /// Audit-only column names carry the run suffix so they can never
    /// collide with user columns mirrored via LIKE.
    pub operation_column: String,
    pub captured_at_column: String,
    pub audit_table_pk: String,
    pub trigger_name: String,
    /// Business primary key of the primary table.
    pub primary_key: String,
    /// Columns of the primary table before the ALTER, in ordinal order.
    pub columns: Vec<String>,
    pub delta: StructuralDelta,
    /// DDL captured at setup, replayed during swap.
    pub referential_foreign_key_statements: String,
    pub self_foreign_key_statements: String,
    pub trigger_statements: String,
    pub storage_parameters: String,
    pub view_definitions: Vec<ViewDefinition>,
}

impl MigrationState {
    /// Generates the per-run object names. The random suffix disambiguates
    /// concurrent or retried runs against the same table; every name is
    /// checked against the 63-byte identifier limit.
    pub fn new(session: &Session) -> Result<Self> {
        let suffix = run_suffix();
        let shadow_table = generated_name("osc_shadow", &session.table, &suffix)?;
        let audit_table = generated_name("osc_audit", &session.table, &suffix)?;
        let old_primary_table = generated_name("osc_old", &session.table, &suffix)?;
        Ok(MigrationState {
            shadow_table,
            audit_table,
            old_primary_table,
            operation_column: format!("osc_operation_{suffix}"),
            captured_at_column: format!("osc_captured_at_{suffix}"),
            audit_table_pk: format!("osc_audit_id_{suffix}"),
            trigger_name: format!("osc_capture_changes_{suffix}"),
            ..Default::default()
        })
    }
}

fn run_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Builds `{prefix}_{table}_{suffix}`, truncating the table part so the
/// whole name fits the identifier length limit.
fn generated_name(prefix: &str, table: &str, suffix: &str) -> Result<String> {
    let mut table_part = table.to_lowercase();
    let budget = 63 - (prefix.len() + suffix.len() + 2);
    if table_part.len() > budget {
        table_part.truncate(budget);
    }
    let name = format!("{prefix}_{table_part}_{suffix}");
    sql::safe_ident(&name)?;
    Ok(name)
}
