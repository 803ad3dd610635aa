//! The rename exchange of shadow and primary tables.
//!
//! Everything here happens inside the transaction left open by a successful
//! lock acquisition, under a short statement timeout so no single statement
//! can sit on the exclusive lock.

use crate::replay::ReplayEngine;
use crate::session::{MigrationState, Session};
use crate::{OscError, lock};
use anyhow::Result;
use postgres::Client;
use tracing::info;

pub const SWAP_STATEMENT_TIMEOUT: &str = "5s";

pub struct Swap<'a> {
    pub session: &'a Session,
    pub state: &'a MigrationState,
}

impl<'a> Swap<'a> {
    pub fn new(session: &'a Session, state: &'a MigrationState) -> Self {
        Swap { session, state }
    }

    /// Acquires the exclusive lock and performs the swap in that
    /// transaction: final replay pass, serial sequence resync, the renames,
    /// foreign key re-attachment (NOT VALID), original triggers and storage
    /// parameters, and removal of the capture trigger. The transaction is
    /// closed and the unlimited session statement timeout restored whatever
    /// the outcome.
    pub fn execute(&self, client: &mut Client, replay: &ReplayEngine) -> Result<()> {
        info!(table = %self.session.table_name, "performing swap");
        let opened = lock::open_lock_exclusive(client, self.session)?;
        if !opened {
            return Err(
                OscError::AccessExclusiveLockNotAcquired(self.session.table_name.clone()).into(),
            );
        }
        let result = self.swap_under_lock(client, replay);
        if result.is_ok() {
            client.batch_execute("COMMIT")?;
        } else {
            // Best effort; a rollback failure must not mask the swap error.
            let _ = client.batch_execute("ROLLBACK");
        }
        // The session must keep running without a statement timeout: the
        // constraint validation scans still follow. The final reset happens
        // in cleanup.
        let _ = client.batch_execute("SET statement_timeout = 0; RESET lock_timeout;");
        result
    }

    fn swap_under_lock(&self, client: &mut Client, replay: &ReplayEngine) -> Result<()> {
        client.batch_execute(&format!(
            "SET LOCAL statement_timeout TO '{SWAP_STATEMENT_TIMEOUT}';"
        ))?;
        // Writers are blocked by the exclusive lock, so this drains the
        // audit table completely.
        replay.drain_remaining(client)?;
        let pk_refresh = self.primary_key_refresh_statement(client)?;
        let sql = format!(
            "{pk_refresh} \
             ALTER TABLE {table} RENAME TO {old}; \
             ALTER TABLE {shadow} RENAME TO {table}; \
             {referential_fks} {self_fks} {triggers} {storage_reset} \
             DROP TRIGGER IF EXISTS {capture_trigger} ON {table}; \
             DROP TRIGGER IF EXISTS {capture_trigger} ON {old}; \
             DROP FUNCTION IF EXISTS {capture_trigger}();",
            table = self.session.table_name,
            old = self.state.old_primary_table,
            shadow = self.state.shadow_table,
            referential_fks = self.state.referential_foreign_key_statements,
            self_fks = self.state.self_foreign_key_statements,
            triggers = self.state.trigger_statements,
            storage_reset = self.storage_parameters_statement(),
            capture_trigger = self.state.trigger_name,
        );
        client.batch_execute(&sql)?;
        Ok(())
    }

    /// Points the shadow table's serial sequence at max(pk) of the table it
    /// is about to replace. Empty when the primary key has no sequence.
    fn primary_key_refresh_statement(&self, client: &mut Client) -> Result<String> {
        let row = client.query_one(
            "SELECT pg_get_serial_sequence($1, $2)",
            &[&self.state.shadow_table, &self.state.primary_key],
        )?;
        let sequence: Option<String> = row.get(0);
        Ok(match sequence {
            Some(_) => format!(
                "SELECT setval((SELECT pg_get_serial_sequence('{shadow}', '{pk}')), \
                 (SELECT max({pk}) FROM {table}));",
                shadow = self.state.shadow_table,
                pk = self.state.primary_key,
                table = self.session.table_name,
            ),
            None => String::new(),
        })
    }

    /// Restores the primary table's original storage parameters on the
    /// swapped-in table, or resets the run-time autovacuum override when it
    /// had none.
    fn storage_parameters_statement(&self) -> String {
        if self.state.storage_parameters.is_empty() {
            format!(
                "ALTER TABLE {} RESET (autovacuum_enabled, toast.autovacuum_enabled);",
                self.session.table_name
            )
        } else {
            format!(
                "ALTER TABLE {} SET ({});",
                self.session.table_name, self.state.storage_parameters
            )
        }
    }
}
