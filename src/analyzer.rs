//! DDL statement analysis on top of pg_query.
//!
//! The user's ALTER statement is treated as structured data throughout: it is
//! parsed once, validated, retargeted at the shadow table by mutating the
//! parse tree and deparsing, and mined for the structural delta (dropped and
//! renamed columns) that the copy and replay paths need. String rewriting is
//! never used for any of this.

use crate::OscError;
use anyhow::Result;
use pg_query::{NodeEnum, deparse, parse};
use pg_query::protobuf::AlterTableType;

/// A column rename extracted from `ALTER TABLE .. RENAME COLUMN old TO new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedColumn {
    pub old_name: String,
    pub new_name: String,
}

/// Dropped and renamed columns, in statement order. Later statements may
/// depend on earlier ones, so order is preserved as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralDelta {
    pub dropped_columns: Vec<String>,
    pub renamed_columns: Vec<RenamedColumn>,
}

impl StructuralDelta {
    pub fn is_empty(&self) -> bool {
        self.dropped_columns.is_empty() && self.renamed_columns.is_empty()
    }
}

pub struct DdlAnalyzer;

impl DdlAnalyzer {
    /// Every statement must be an ALTER TABLE or RENAME form.
    pub fn validate(&self, sql: &str) -> Result<(), OscError> {
        let result =
            parse(sql).map_err(|_| OscError::NotAnAlterStatement(sql.to_string()))?;
        if result.protobuf.stmts.is_empty() {
            return Err(OscError::NotAnAlterStatement(sql.to_string()));
        }
        for stmt in &result.protobuf.stmts {
            match stmt.stmt.as_ref().and_then(|s| s.node.as_ref()) {
                Some(NodeEnum::AlterTableStmt(_)) | Some(NodeEnum::RenameStmt(_)) => {}
                _ => return Err(OscError::NotAnAlterStatement(sql.to_string())),
            }
        }
        Ok(())
    }

    /// All statements must reference exactly one distinct table.
    pub fn same_table(&self, sql: &str) -> bool {
        let tables = self.extract_tables(sql);
        let mut distinct = tables.clone();
        distinct.dedup();
        distinct.len() == 1 && !tables.is_empty()
    }

    /// The single table the statements target. `validate` and `same_table`
    /// are expected to have passed already.
    pub fn table(&self, sql: &str) -> Result<String, OscError> {
        self.extract_tables(sql)
            .into_iter()
            .next()
            .ok_or_else(|| OscError::NotAnAlterStatement(sql.to_string()))
    }

    /// The table name as it should appear in generated SQL: quoted when it
    /// contains uppercase characters, since such a table can only exist as a
    /// case-sensitive identifier.
    pub fn table_name(&self, table: &str) -> String {
        if table.chars().any(|c| c.is_ascii_uppercase()) {
            crate::sql::quote_ident(table)
        } else {
            table.to_string()
        }
    }

    fn extract_tables(&self, sql: &str) -> Vec<String> {
        let Ok(result) = parse(sql) else {
            return vec![];
        };
        let mut tables = Vec::new();
        for stmt in &result.protobuf.stmts {
            match stmt.stmt.as_ref().and_then(|s| s.node.as_ref()) {
                Some(NodeEnum::AlterTableStmt(alter_table)) => {
                    if let Some(relation) = &alter_table.relation {
                        tables.push(relation.relname.clone());
                    }
                }
                Some(NodeEnum::RenameStmt(rename_stmt)) => {
                    if let Some(relation) = &rename_stmt.relation {
                        tables.push(relation.relname.clone());
                    }
                }
                _ => {}
            }
        }
        tables
    }

    /// Rewrites every table reference to `shadow_table` and deparses, giving
    /// the statement list to run against the shadow table.
    pub fn retarget(&self, sql: &str, shadow_table: &str) -> Result<String> {
        let mut result = parse(sql)?;
        for stmt in &mut result.protobuf.stmts {
            match stmt.stmt.as_mut().and_then(|s| s.node.as_mut()) {
                Some(NodeEnum::AlterTableStmt(alter_table)) => {
                    if let Some(relation) = &mut alter_table.relation {
                        relation.relname = shadow_table.to_string();
                    }
                }
                Some(NodeEnum::RenameStmt(rename_stmt)) => {
                    if let Some(relation) = &mut rename_stmt.relation {
                        relation.relname = shadow_table.to_string();
                    }
                }
                _ => {}
            }
        }
        Ok(deparse(&result.protobuf)?)
    }

    /// Columns removed by DROP COLUMN subcommands, in statement order.
    pub fn dropped_columns(&self, sql: &str) -> Result<Vec<String>> {
        let result = parse(sql)?;
        let mut dropped = Vec::new();
        for stmt in &result.protobuf.stmts {
            let Some(NodeEnum::AlterTableStmt(alter_table)) =
                stmt.stmt.as_ref().and_then(|s| s.node.as_ref())
            else {
                continue;
            };
            for cmd in &alter_table.cmds {
                if let Some(NodeEnum::AlterTableCmd(cmd)) = cmd.node.as_ref() {
                    if cmd.subtype() == AlterTableType::AtDropColumn {
                        dropped.push(cmd.name.clone());
                    }
                }
            }
        }
        Ok(dropped)
    }

    /// {old, new} pairs from RENAME COLUMN statements, in statement order.
    pub fn renamed_columns(&self, sql: &str) -> Result<Vec<RenamedColumn>> {
        let result = parse(sql)?;
        let mut renamed = Vec::new();
        for stmt in &result.protobuf.stmts {
            let Some(NodeEnum::RenameStmt(rename_stmt)) =
                stmt.stmt.as_ref().and_then(|s| s.node.as_ref())
            else {
                continue;
            };
            if rename_stmt.subname.is_empty() || rename_stmt.newname.is_empty() {
                continue;
            }
            renamed.push(RenamedColumn {
                old_name: rename_stmt.subname.clone(),
                new_name: rename_stmt.newname.clone(),
            });
        }
        Ok(renamed)
    }

    /// The full structural delta for the statement list.
    pub fn structural_delta(&self, sql: &str) -> Result<StructuralDelta> {
        Ok(StructuralDelta {
            dropped_columns: self.dropped_columns(sql)?,
            renamed_columns: self.renamed_columns(sql)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_alter_and_rename() {
        let analyzer = DdlAnalyzer;
        assert!(analyzer.validate("ALTER TABLE books ADD COLUMN purchased boolean").is_ok());
        assert!(
            analyzer
                .validate("ALTER TABLE books RENAME COLUMN email TO new_email")
                .is_ok()
        );
        assert!(
            analyzer
                .validate("ALTER TABLE books DROP COLUMN a; ALTER TABLE books DROP COLUMN b")
                .is_ok()
        );
    }

    #[test]
    fn validate_rejects_non_alter() {
        let analyzer = DdlAnalyzer;
        assert!(matches!(
            analyzer.validate("SELECT * FROM books"),
            Err(OscError::NotAnAlterStatement(_))
        ));
        assert!(analyzer.validate("DROP TABLE books").is_err());
        assert!(analyzer.validate("not even sql").is_err());
    }

    #[test]
    fn same_table_spots_mixed_targets() {
        let analyzer = DdlAnalyzer;
        assert!(analyzer.same_table("ALTER TABLE books ADD COLUMN a int; ALTER TABLE books DROP COLUMN b"));
        assert!(!analyzer.same_table("ALTER TABLE books ADD COLUMN a int; ALTER TABLE cars DROP COLUMN b"));
    }

    #[test]
    fn extracts_table_from_rename() {
        let analyzer = DdlAnalyzer;
        let table = analyzer
            .table("ALTER TABLE books RENAME COLUMN email TO new_email")
            .unwrap();
        assert_eq!(table, "books");
    }

    #[test]
    fn table_name_quotes_case_sensitive_identifiers() {
        let analyzer = DdlAnalyzer;
        assert_eq!(analyzer.table_name("books"), "books");
        assert_eq!(analyzer.table_name("Books"), "\"Books\"");
    }

    #[test]
    fn retarget_rewrites_table_reference() {
        let analyzer = DdlAnalyzer;
        let rewritten = analyzer
            .retarget(
                "ALTER TABLE books ADD COLUMN purchased bigint;",
                "osc_shadow_books_3fa9c2",
            )
            .unwrap();
        assert_eq!(
            rewritten,
            "ALTER TABLE osc_shadow_books_3fa9c2 ADD COLUMN purchased bigint"
        );
    }

    #[test]
    fn retarget_rewrites_rename_statements() {
        let analyzer = DdlAnalyzer;
        let rewritten = analyzer
            .retarget(
                "ALTER TABLE books RENAME COLUMN email TO new_email",
                "osc_shadow_books_3fa9c2",
            )
            .unwrap();
        assert_eq!(
            rewritten,
            "ALTER TABLE osc_shadow_books_3fa9c2 RENAME COLUMN email TO new_email"
        );
    }

    #[test]
    fn dropped_columns_in_statement_order() {
        let analyzer = DdlAnalyzer;
        let dropped = analyzer
            .dropped_columns(
                "ALTER TABLE books DROP COLUMN email; ALTER TABLE books DROP COLUMN phone",
            )
            .unwrap();
        assert_eq!(dropped, vec!["email", "phone"]);
    }

    #[test]
    fn renamed_columns_capture_both_names() {
        let analyzer = DdlAnalyzer;
        let renamed = analyzer
            .renamed_columns("ALTER TABLE books RENAME COLUMN email TO new_email")
            .unwrap();
        assert_eq!(
            renamed,
            vec![RenamedColumn {
                old_name: "email".to_string(),
                new_name: "new_email".to_string(),
            }]
        );
    }

    #[test]
    fn add_column_yields_empty_delta() {
        let analyzer = DdlAnalyzer;
        let delta = analyzer
            .structural_delta("ALTER TABLE books ADD COLUMN purchased boolean DEFAULT false")
            .unwrap();
        assert!(delta.is_empty());
    }
}
