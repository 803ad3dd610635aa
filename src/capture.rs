//! Change capture: the audit table and the row-level trigger feeding it.

use crate::session::{MigrationState, Session};
use crate::{OscError, lock};
use anyhow::Result;
use postgres::{Client, GenericClient};
use tracing::info;

pub struct ChangeCapture<'a> {
    pub session: &'a Session,
    pub state: &'a MigrationState,
}

impl<'a> ChangeCapture<'a> {
    pub fn new(session: &'a Session, state: &'a MigrationState) -> Self {
        ChangeCapture { session, state }
    }

    /// Creates the audit table: a dedicated BIGSERIAL ordering key, the
    /// operation kind, a capture timestamp, and a mirror of the primary
    /// table's columns via LIKE.
    pub fn create_audit_table(&self, client: &mut Client) -> Result<()> {
        info!(audit_table = %self.state.audit_table, "setting up audit table");
        let sql = format!(
            "CREATE TABLE {audit} ({pk} BIGSERIAL PRIMARY KEY, {op} text, {at} timestamp, LIKE {table})",
            audit = self.state.audit_table,
            pk = self.state.audit_table_pk,
            op = self.state.operation_column,
            at = self.state.captured_at_column,
            table = self.session.table_name,
        );
        client.batch_execute(&sql)?;
        Ok(())
    }

    /// Resolves the server-generated name of the audit pk sequence. The
    /// server applies its own truncation to long names, so the name cannot
    /// be derived client-side.
    pub fn audit_pk_sequence(&self, client: &mut Client) -> Result<String> {
        let row = client.query_one(
            "SELECT pg_get_serial_sequence($1, $2)",
            &[&self.state.audit_table, &self.state.audit_table_pk],
        )?;
        let sequence: Option<String> = row.get(0);
        sequence.ok_or_else(|| anyhow::anyhow!("audit table has no pk sequence"))
    }

    /// Installs the capture trigger under a short-timeout ACCESS EXCLUSIVE
    /// lock, using the same acquisition primitive as the final swap. From
    /// the commit of this transaction on, every write to the primary table
    /// lands in the audit table before the writing transaction commits.
    pub fn install_trigger(&self, client: &mut Client) -> Result<()> {
        let opened = lock::open_lock_exclusive(client, self.session)?;
        if !opened {
            return Err(
                OscError::AccessExclusiveLockNotAcquired(self.session.table_name.clone()).into(),
            );
        }
        info!(trigger = %self.state.trigger_name, "setting up capture trigger");
        let statement = self.trigger_statement(client)?;
        let result = client.batch_execute(&statement);
        // The lock transaction is committed (or closed) whatever happened.
        client.batch_execute("COMMIT")?;
        result?;
        Ok(())
    }

    fn trigger_statement(&self, client: &mut Client) -> Result<String> {
        let sequence = self.audit_pk_sequence(client)?;
        Ok(format!(
            r#"
            DROP TRIGGER IF EXISTS {trigger} ON {table};

            CREATE OR REPLACE FUNCTION {trigger}()
            RETURNS TRIGGER AS
            $$
            BEGIN
              IF (TG_OP = 'INSERT') THEN
                INSERT INTO {audit} SELECT nextval('{sequence}'), 'INSERT', clock_timestamp(), NEW.*;
                RETURN NEW;
              ELSIF (TG_OP = 'UPDATE') THEN
                INSERT INTO {audit} SELECT nextval('{sequence}'), 'UPDATE', clock_timestamp(), NEW.*;
                RETURN NEW;
              ELSIF (TG_OP = 'DELETE') THEN
                INSERT INTO {audit} SELECT nextval('{sequence}'), 'DELETE', clock_timestamp(), OLD.*;
                RETURN OLD;
              END IF;
            END;
            $$ LANGUAGE PLPGSQL SECURITY DEFINER;

            CREATE TRIGGER {trigger}
            AFTER INSERT OR UPDATE OR DELETE ON {table}
            FOR EACH ROW EXECUTE PROCEDURE {trigger}();
            "#,
            trigger = self.state.trigger_name,
            table = self.session.table_name,
            audit = self.state.audit_table,
            sequence = sequence,
        ))
    }

    /// SQL removing the trigger and its function; used by cleanup and after
    /// the swap, when the trigger is orphaned.
    pub fn drop_trigger_statement(state: &MigrationState, table_name: &str) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {trigger} ON {table}; DROP FUNCTION IF EXISTS {trigger}();",
            trigger = state.trigger_name,
            table = table_name,
        )
    }

    /// Disables autovacuum on the shadow and audit tables for the duration
    /// of the run.
    pub fn disable_vacuum<C: GenericClient>(&self, client: &mut C) -> Result<()> {
        info!(
            shadow_table = %self.state.shadow_table,
            audit_table = %self.state.audit_table,
            "disabling autovacuum on shadow and audit tables"
        );
        let sql = format!(
            "ALTER TABLE {shadow} SET (autovacuum_enabled = false, toast.autovacuum_enabled = false); \
             ALTER TABLE {audit} SET (autovacuum_enabled = false, toast.autovacuum_enabled = false);",
            shadow = self.state.shadow_table,
            audit = self.state.audit_table,
        );
        client.batch_execute(&sql)?;
        Ok(())
    }
}
