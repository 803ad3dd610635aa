//! Replay of captured writes onto the shadow table.
//!
//! The engine's only state is its position in the audit table, carried by
//! the audit sequence column itself: rows are pulled in sequence order and
//! deleted once applied. Row translation is pure so it can be tested without
//! a database; everything row-shaped coming out of the audit table is text
//! (values are cast to text when fetched) and re-enters the shadow table as
//! quoted literals, since the target table differs per run and prepared
//! statements are impractical for this.

use crate::analyzer::StructuralDelta;
use crate::session::{MigrationState, Session};
use crate::sql::{quote_ident, quote_literal};
use anyhow::{Result, bail};
use itertools::Itertools;
use postgres::GenericClient;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    fn parse(kind: &str) -> Option<Operation> {
        match kind {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// One audit row: the audit sequence value, the operation kind, and the
/// mirrored business columns as text.
#[derive(Debug, Clone)]
pub struct CapturedRow {
    pub audit_id: i64,
    pub operation: Operation,
    pub values: Vec<(String, Option<String>)>,
}

impl CapturedRow {
    fn raw_value(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }
}

pub struct ReplayEngine {
    pub audit_table: String,
    pub shadow_table: String,
    pub audit_table_pk: String,
    pub operation_column: String,
    pub primary_key: String,
    /// Business columns of the primary table, mirrored in the audit table.
    pub columns: Vec<String>,
    pub delta: StructuralDelta,
    pub pull_batch_count: i64,
    pub delta_count: usize,
}

impl ReplayEngine {
    pub fn new(session: &Session, state: &MigrationState) -> Self {
        ReplayEngine {
            audit_table: state.audit_table.clone(),
            shadow_table: state.shadow_table.clone(),
            audit_table_pk: state.audit_table_pk.clone(),
            operation_column: state.operation_column.clone(),
            primary_key: state.primary_key.clone(),
            columns: state.columns.clone(),
            delta: state.delta.clone(),
            pull_batch_count: session.pull_batch_count,
            delta_count: session.delta_count,
        }
    }

    /// Pulls up to `pull_batch_count` rows in audit sequence order. The
    /// audit-only capture timestamp is not selected; business columns come
    /// back as text.
    pub fn fetch_batch<C: GenericClient>(&self, client: &mut C) -> Result<Vec<CapturedRow>> {
        let column_list = self
            .columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(c)))
            .join(", ");
        let query = format!(
            "SELECT {pk}, {op}, {columns} FROM {audit} ORDER BY {pk} ASC LIMIT {limit}",
            pk = self.audit_table_pk,
            op = self.operation_column,
            columns = column_list,
            audit = self.audit_table,
            limit = self.pull_batch_count,
        );
        let rows = client.query(&query, &[])?;
        let mut captured = Vec::with_capacity(rows.len());
        for row in &rows {
            let audit_id: i64 = row.get(0);
            let kind: String = row.get(1);
            // Skipping such a row would leave it in the audit table and
            // make every later drain refetch it.
            let Some(operation) = Operation::parse(&kind) else {
                bail!("unrecognized operation kind {kind:?} in audit row {audit_id}");
            };
            let values = self
                .columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), row.get::<_, Option<String>>(i + 2)))
                .collect();
            captured.push(CapturedRow {
                audit_id,
                operation,
                values,
            });
        }
        Ok(captured)
    }

    /// Translates a batch into replay statements, in capture order. UPDATE
    /// and DELETE are keyed by the business primary key, which makes
    /// reapplying a row across a batch-boundary overlap idempotent.
    pub fn batch_statements(&self, rows: &[CapturedRow]) -> Vec<String> {
        rows.iter().filter_map(|row| self.row_statement(row)).collect()
    }

    fn row_statement(&self, row: &CapturedRow) -> Option<String> {
        let pk_literal = quote_literal(row.raw_value(&self.primary_key)?);
        match row.operation {
            Operation::Insert => {
                let translated = self.translate_row(row);
                let columns = translated.iter().map(|(c, _)| c.as_str()).join(", ");
                let values = translated.iter().map(|(_, v)| v.as_str()).join(", ");
                Some(format!(
                    "INSERT INTO {shadow} ({columns}) VALUES ({values});",
                    shadow = self.shadow_table,
                ))
            }
            Operation::Update => {
                let set_clause = self
                    .translate_row(row)
                    .iter()
                    .map(|(column, value)| format!("{column} = {value}"))
                    .join(", ");
                Some(format!(
                    "UPDATE {shadow} SET {set_clause} WHERE {pk} = {pk_literal};",
                    shadow = self.shadow_table,
                    pk = quote_ident(&self.primary_key),
                ))
            }
            Operation::Delete => Some(format!(
                "DELETE FROM {shadow} WHERE {pk} = {pk_literal};",
                shadow = self.shadow_table,
                pk = quote_ident(&self.primary_key),
            )),
        }
    }

    /// Applies the structural delta to one captured row: dropped columns
    /// disappear, renamed columns move their value to the new name, and
    /// NULL/absent fields are left out entirely so column defaults apply.
    /// Returns (quoted identifier, quoted literal) pairs.
    fn translate_row(&self, row: &CapturedRow) -> Vec<(String, String)> {
        let mut values: Vec<(String, Option<String>)> = row
            .values
            .iter()
            .filter(|(name, _)| !self.delta.dropped_columns.contains(name))
            .cloned()
            .collect();
        for rename in &self.delta.renamed_columns {
            for (name, _) in &mut values {
                if *name == rename.old_name {
                    *name = rename.new_name.clone();
                }
            }
        }
        values
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (quote_ident(&name), quote_literal(&v))))
            .collect()
    }

    /// Applies one batch: all row statements as one unit, then the consumed
    /// audit rows are deleted by their audit sequence values.
    pub fn play<C: GenericClient>(&self, client: &mut C, rows: &[CapturedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        info!(count = rows.len(), "replaying captured rows");
        let statements = self.batch_statements(rows).join(" ");
        client.batch_execute(&statements)?;
        let consumed = rows.iter().map(|row| row.audit_id.to_string()).join(", ");
        let delete = format!(
            "DELETE FROM {audit} WHERE {pk} IN ({consumed})",
            audit = self.audit_table,
            pk = self.audit_table_pk,
        );
        client.batch_execute(&delete)?;
        Ok(())
    }

    /// The convergence loop: applies batches until one comes back at or
    /// below `delta_count`, at which point the backlog is small enough to
    /// finish inside the exclusive-lock window and the caller proceeds to
    /// swap. Runs as long as it takes; the threshold is operator-tuned.
    pub fn drain<C: GenericClient>(&self, client: &mut C) -> Result<()> {
        loop {
            let rows = self.fetch_batch(client)?;
            if rows.len() <= self.delta_count {
                info!(
                    remaining = rows.len(),
                    delta_count = self.delta_count,
                    "remaining rows below delta count, proceeding towards swap"
                );
                return Ok(());
            }
            self.play(client, &rows)?;
        }
    }

    /// Fully drains the audit table. Only called under the exclusive lock,
    /// when no further writes can arrive.
    pub fn drain_remaining<C: GenericClient>(&self, client: &mut C) -> Result<()> {
        loop {
            let rows = self.fetch_batch(client)?;
            if rows.is_empty() {
                debug!("audit table drained");
                return Ok(());
            }
            self.play(client, &rows)?;
        }
    }
}
