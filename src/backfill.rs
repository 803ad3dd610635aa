//! Bulk copy of existing rows into the shadow table.

use crate::analyzer::StructuralDelta;
use crate::session::{MigrationState, Session};
use crate::sql::quote_ident;
use anyhow::Result;
use itertools::Itertools;
use postgres::GenericClient;
use tracing::info;

pub struct Backfill<'a> {
    pub session: &'a Session,
    pub state: &'a MigrationState,
}

impl<'a> Backfill<'a> {
    pub fn new(session: &'a Session, state: &'a MigrationState) -> Self {
        Backfill { session, state }
    }

    /// Copies all existing rows from the primary table into the shadow
    /// table. Runs inside the serializable transaction opened after the
    /// trigger became active; the audit table was cleared in that same
    /// transaction, so nothing is both copied and replayed.
    pub fn copy_data<C: GenericClient>(&self, client: &mut C) -> Result<()> {
        info!(
            shadow_table = %self.state.shadow_table,
            parent_table = %self.session.table_name,
            "copying contents"
        );
        let sql = match &self.session.copy_statement {
            Some(template) => template.replace("%{shadow_table}", &self.state.shadow_table),
            None => copy_data_statement(
                &self.state.columns,
                &self.state.delta,
                &self.session.table_name,
                &self.state.shadow_table,
            ),
        };
        client.batch_execute(&sql)?;
        Ok(())
    }
}

/// Builds the copy statement from the live column list: dropped columns are
/// excluded from both sides, renamed columns are remapped in the INSERT
/// list, and the read goes against ONLY the primary table so partition
/// children are not copied twice.
pub fn copy_data_statement(
    columns: &[String],
    delta: &StructuralDelta,
    table_name: &str,
    shadow_table: &str,
) -> String {
    let select_columns: Vec<&String> = columns
        .iter()
        .filter(|column| !delta.dropped_columns.contains(column))
        .collect();
    let insert_columns: Vec<String> = select_columns
        .iter()
        .map(|column| {
            delta
                .renamed_columns
                .iter()
                .find(|rename| rename.old_name == **column)
                .map(|rename| rename.new_name.clone())
                .unwrap_or_else(|| (*column).clone())
        })
        .collect();
    format!(
        "INSERT INTO {shadow}({insert}) SELECT {select} FROM ONLY {table}",
        shadow = shadow_table,
        insert = insert_columns.iter().map(|c| quote_ident(c)).join(", "),
        select = select_columns.iter().map(|c| quote_ident(c)).join(", "),
        table = table_name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RenamedColumn;

    fn columns() -> Vec<String> {
        vec!["id".to_string(), "email".to_string(), "name".to_string()]
    }

    #[test]
    fn copies_all_columns_when_delta_is_empty() {
        let sql = copy_data_statement(&columns(), &StructuralDelta::default(), "books", "shadow");
        assert_eq!(
            sql,
            "INSERT INTO shadow(\"id\", \"email\", \"name\") \
             SELECT \"id\", \"email\", \"name\" FROM ONLY books"
        );
    }

    #[test]
    fn dropped_columns_are_excluded_from_both_sides() {
        let delta = StructuralDelta {
            dropped_columns: vec!["email".to_string()],
            renamed_columns: vec![],
        };
        let sql = copy_data_statement(&columns(), &delta, "books", "shadow");
        assert_eq!(
            sql,
            "INSERT INTO shadow(\"id\", \"name\") SELECT \"id\", \"name\" FROM ONLY books"
        );
    }

    #[test]
    fn renamed_columns_are_remapped_in_the_insert_list() {
        let delta = StructuralDelta {
            dropped_columns: vec![],
            renamed_columns: vec![RenamedColumn {
                old_name: "email".to_string(),
                new_name: "new_email".to_string(),
            }],
        };
        let sql = copy_data_statement(&columns(), &delta, "books", "shadow");
        assert_eq!(
            sql,
            "INSERT INTO shadow(\"id\", \"new_email\", \"name\") \
             SELECT \"id\", \"email\", \"name\" FROM ONLY books"
        );
    }
}
