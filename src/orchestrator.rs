//! Top-level sequencing of a migration run.
//!
//! The orchestrator drives the phases in order on a single connection,
//! converts any failure into cleanup-then-propagate, and owns the signal
//! path: a listener thread that cancels the in-flight statement so the main
//! thread falls into the same cleanup. Cancellation is the only operation
//! another thread ever performs against the busy connection.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use postgres::Client;
use r2d2::Pool;
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls as R2d2NoTls};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info, warn};

use crate::analyzer::DdlAnalyzer;
use crate::backfill::Backfill;
use crate::capture::ChangeCapture;
use crate::catalog::{
    Catalog, foreign_keys_to_validate, referential_foreign_key_statements,
    self_foreign_key_statements,
};
use crate::replay::ReplayEngine;
use crate::session::{MigrationState, Session};
use crate::swap::Swap;
use crate::{OscError, functions};

pub type PgPool = Pool<PostgresConnectionManager<R2d2NoTls>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    AuditTableCreated,
    TriggerInstalled,
    ShadowTableCreated,
    VacuumDisabled,
    AlterApplied,
    DataCopied,
    ReplayConverged,
    Swapped,
    Analyzed,
    ConstraintsValidated,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::AuditTableCreated => "AUDIT_TABLE_CREATED",
            Phase::TriggerInstalled => "TRIGGER_INSTALLED",
            Phase::ShadowTableCreated => "SHADOW_TABLE_CREATED",
            Phase::VacuumDisabled => "VACUUM_DISABLED",
            Phase::AlterApplied => "ALTER_APPLIED",
            Phase::DataCopied => "DATA_COPIED",
            Phase::ReplayConverged => "REPLAY_CONVERGED",
            Phase::Swapped => "SWAPPED",
            Phase::Analyzed => "ANALYZED",
            Phase::ConstraintsValidated => "CONSTRAINTS_VALIDATED",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Which termination signal, if any, ended the run. Written once by the
/// listener thread, read by the main thread after the run fails.
#[derive(Clone, Default)]
pub struct SignalState(Arc<AtomicUsize>);

impl SignalState {
    fn record(&self, signal: i32) {
        self.0.store(signal as usize, Ordering::SeqCst);
    }

    pub fn received(&self) -> Option<i32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal as i32),
        }
    }

    /// Conventional exit status for a signal-terminated process, 128 plus
    /// the signal number.
    pub fn exit_code(&self) -> Option<i32> {
        self.received().map(|signal| 128 + signal)
    }
}

pub struct Orchestrator {
    pub session: Session,
    pub state: MigrationState,
    pub pool: PgPool,
    phase: Cell<Phase>,
    signal: SignalState,
}

impl Orchestrator {
    pub fn new(session: Session, pool: PgPool) -> Result<Self> {
        let state = MigrationState::new(&session)?;
        Ok(Orchestrator {
            session,
            state,
            pool,
            phase: Cell::new(Phase::Init),
            signal: SignalState::default(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// True when the run was ended by a termination signal.
    pub fn interrupted(&self) -> bool {
        self.signal.received().is_some()
    }

    /// Exit status for the signal that ended the run, when there was one.
    pub fn signal_exit_code(&self) -> Option<i32> {
        self.signal.exit_code()
    }

    fn enter(&self, phase: Phase) {
        self.phase.set(phase);
        debug!(phase = %phase, "phase reached");
    }

    /// Executes the whole run. Any failure in any phase runs cleanup and
    /// then propagates the original error; cleanup also runs on success to
    /// remove the audit table and, when opted in, the old primary table.
    pub fn run(&mut self) -> Result<()> {
        let mut conn = self.pool.get()?;
        let client: &mut Client = &mut conn;
        self.install_signal_handler(client)?;
        self.prepare(client)?;
        match self.execute(client) {
            Ok(()) => {
                self.cleanup(client);
                self.enter(Phase::Done);
                info!("All tasks successfully completed");
                Ok(())
            }
            Err(err) => {
                self.enter(Phase::Failed);
                if self.interrupted() {
                    info!("terminating after signal, cleaning up");
                } else {
                    error!(error = %err, "something went wrong, cleaning up");
                }
                self.cleanup(client);
                Err(err)
            }
        }
    }

    /// Session settings, helper functions, and everything introspected up
    /// front: primary key, column list, constraint/trigger DDL to replay at
    /// swap time, dependent views, storage parameters, structural delta.
    fn prepare(&mut self, client: &mut Client) -> Result<()> {
        client.batch_execute(&format!(
            "SET statement_timeout = 0; \
             SET client_min_messages = warning; \
             SET search_path TO {};",
            self.session.schema
        ))?;
        client.batch_execute(functions::CREATE_TABLE_ALL)?;
        client.batch_execute(functions::FIX_SERIAL_SEQUENCE)?;

        let catalog = Catalog::new(&self.session.schema);
        let table_name = self.session.table_name.clone();
        self.state.primary_key = catalog
            .primary_key(client, &table_name)?
            .ok_or_else(|| OscError::ParentTableHasNoPrimaryKey(table_name.clone()))?;
        self.state.columns = catalog.columns(client, &table_name)?;
        // Captured before the capture trigger exists, so it is not among
        // the triggers recreated after the swap.
        self.state.trigger_statements = catalog.triggers(client, &table_name)?;
        let constraints = catalog.constraints(client)?;
        self.state.referential_foreign_key_statements =
            referential_foreign_key_statements(&constraints, &self.session.table);
        self.state.self_foreign_key_statements =
            self_foreign_key_statements(&constraints, &self.session.table);
        self.state.view_definitions = catalog.view_definitions(client, &self.session.table)?;
        self.state.storage_parameters = catalog.storage_parameters(client, &self.session.table)?;
        self.state.delta = DdlAnalyzer.structural_delta(&self.session.alter_statement)?;
        Ok(())
    }

    fn execute(&self, client: &mut Client) -> Result<()> {
        let capture = ChangeCapture::new(&self.session, &self.state);

        capture.create_audit_table(client)?;
        self.enter(Phase::AuditTableCreated);

        capture.install_trigger(client)?;
        self.enter(Phase::TriggerInstalled);

        self.copy_under_serializable(client, &capture)?;

        self.run_analyze(client)?;

        let replay = ReplayEngine::new(&self.session, &self.state);
        replay.drain(client)?;
        self.enter(Phase::ReplayConverged);

        Swap::new(&self.session, &self.state).execute(client, &replay)?;
        self.enter(Phase::Swapped);

        self.run_analyze(client)?;
        self.enter(Phase::Analyzed);

        self.redefine_views(client)?;

        self.validate_constraints(client)?;
        self.enter(Phase::ConstraintsValidated);
        Ok(())
    }

    /// Shadow table creation through bulk copy, all in one SERIALIZABLE
    /// transaction. The audit table is cleared in the same transaction, so
    /// no write sits both in the copy snapshot and in the audit table, and
    /// none can fall between them.
    fn copy_under_serializable(&self, client: &mut Client, capture: &ChangeCapture) -> Result<()> {
        let mut txn = client.transaction()?;
        txn.batch_execute("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")?;

        info!(shadow_table = %self.state.shadow_table, "setting up shadow table");
        txn.batch_execute(&format!(
            "SELECT osc_create_table_all('{table}', '{shadow}'); \
             SELECT osc_fix_serial_sequence('{table}', '{shadow}');",
            table = self.session.table_name,
            shadow = self.state.shadow_table,
        ))?;
        self.enter(Phase::ShadowTableCreated);

        capture.disable_vacuum(&mut txn)?;
        self.enter(Phase::VacuumDisabled);

        let statement = DdlAnalyzer.retarget(&self.session.alter_statement, &self.state.shadow_table)?;
        info!(
            shadow_table = %self.state.shadow_table,
            statement = %statement,
            "running alter statement on shadow table"
        );
        txn.batch_execute(&statement)?;
        self.enter(Phase::AlterApplied);

        // Rows captured while the copy snapshot could still see them would
        // otherwise be replayed as duplicates.
        txn.batch_execute(&format!("DELETE FROM {}", self.state.audit_table))?;
        Backfill::new(&self.session, &self.state).copy_data(&mut txn)?;
        txn.commit()?;
        self.enter(Phase::DataCopied);
        Ok(())
    }

    fn run_analyze(&self, client: &mut Client) -> Result<()> {
        info!(table = %self.session.table_name, "running analyze");
        client.batch_execute(&format!("ANALYZE VERBOSE {}", self.session.table_name))?;
        Ok(())
    }

    /// Views bind to the replaced table's OID and would keep reading the
    /// old table after the swap; reapplying their definitions points them
    /// at the new one.
    fn redefine_views(&self, client: &mut Client) -> Result<()> {
        for view in &self.state.view_definitions {
            info!(view = %view.name, "redefining dependent view");
            client.batch_execute(&format!(
                "CREATE OR REPLACE VIEW {} AS {}",
                view.name,
                view.definition.trim_end_matches(';')
            ))?;
        }
        Ok(())
    }

    /// Validates the foreign keys re-added NOT VALID during the swap. Runs
    /// outside the exclusive lock; the scan blocks nobody.
    fn validate_constraints(&self, client: &mut Client) -> Result<()> {
        info!(table = %self.session.table_name, "validating constraints");
        let constraints = Catalog::new(&self.session.schema).constraints(client)?;
        let statements = foreign_keys_to_validate(&constraints, &self.session.table);
        if !statements.is_empty() {
            client.batch_execute(&statements)?;
        }
        Ok(())
    }

    /// Best-effort removal of everything this run created, plus session
    /// setting resets. Statement failures are logged, never raised, so a
    /// cleanup problem cannot mask the error that got us here.
    pub fn cleanup(&self, client: &mut Client) {
        let mut statements = vec![
            "ROLLBACK".to_string(),
            ChangeCapture::drop_trigger_statement(&self.state, &self.session.table_name),
            format!("DROP TABLE IF EXISTS {}", self.state.audit_table),
            format!("DROP TABLE IF EXISTS {}", self.state.shadow_table),
        ];
        if self.session.drop {
            statements.push(format!(
                "DROP TABLE IF EXISTS {}",
                self.state.old_primary_table
            ));
        }
        statements.push(
            "RESET statement_timeout; RESET lock_timeout; RESET client_min_messages;".to_string(),
        );
        for statement in statements {
            if let Err(err) = client.batch_execute(&statement) {
                warn!(statement = %statement, error = %err, "cleanup statement failed");
            }
        }
    }

    /// Catches INT/TERM/QUIT/HUP on a listener thread. The thread owns only
    /// the cancel token and the signal record; cancelling the in-flight
    /// statement makes the main thread fail into the normal cleanup path.
    /// A second signal falls through to the default disposition.
    fn install_signal_handler(&self, client: &Client) -> Result<()> {
        let cancel_token = client.cancel_token();
        let signal_state = self.signal.clone();
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP])?;
        std::thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                signal_state.record(signal);
                info!(signal, "termination signal received, cancelling in-flight statement");
                let _ = cancel_token.cancel_query(postgres::NoTls);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_state_starts_empty() {
        let state = SignalState::default();
        assert_eq!(state.received(), None);
        assert_eq!(state.exit_code(), None);
    }

    #[test]
    fn signal_state_maps_to_conventional_exit_codes() {
        let state = SignalState::default();
        state.record(SIGINT);
        assert_eq!(state.received(), Some(SIGINT));
        assert_eq!(state.exit_code(), Some(130));

        let state = SignalState::default();
        state.record(SIGTERM);
        assert_eq!(state.exit_code(), Some(128 + SIGTERM));
    }
}
