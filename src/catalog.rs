//! Read-only catalog introspection, scoped to the session schema.
//!
//! Everything the later phases need from the catalogs is read here: column
//! lists, the primary key, constraints with their DDL, non-internal trigger
//! definitions, storage parameters and dependent view definitions. The
//! foreign-key statement builders also live here since they are pure
//! functions over the constraint rows.

use anyhow::Result;
use itertools::Itertools;
use postgres::GenericClient;

#[derive(Debug, Clone)]
pub struct Constraint {
    pub table_on: String,
    pub table_from: String,
    pub constraint_type: String,
    pub name: String,
    pub validated: bool,
    pub definition: String,
}

#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub schema: String,
}

impl Catalog {
    pub fn new(schema: &str) -> Self {
        Catalog {
            schema: schema.to_string(),
        }
    }

    fn qualified(&self, table_name: &str) -> String {
        format!("{}.{}", self.schema, table_name)
    }

    /// Live columns of a table in ordinal order, dropped columns excluded.
    pub fn columns<C: GenericClient>(&self, client: &mut C, table_name: &str) -> Result<Vec<String>> {
        let rows = client.query(
            "SELECT attname::text FROM pg_attribute
             WHERE attrelid = ($1)::text::regclass AND attnum > 0 AND NOT attisdropped
             ORDER BY attnum",
            &[&self.qualified(table_name)],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// First primary key column, or None when the table has no primary key.
    pub fn primary_key<C: GenericClient>(
        &self,
        client: &mut C,
        table_name: &str,
    ) -> Result<Option<String>> {
        let rows = client.query(
            "SELECT a.attname::text
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = ($1)::text::regclass AND i.indisprimary
             ORDER BY a.attnum
             LIMIT 1",
            &[&self.qualified(table_name)],
        )?;
        Ok(rows.first().map(|row| row.get(0)))
    }

    /// Index definitions for the table. The shadow table inherits indexes
    /// through LIKE .. INCLUDING ALL; this exists for inspection and tests.
    pub fn indexes<C: GenericClient>(&self, client: &mut C, table: &str) -> Result<Vec<String>> {
        let rows = client.query(
            "SELECT indexdef FROM pg_indexes WHERE schemaname = $1 AND tablename = $2",
            &[&self.schema, &table],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// All primary and foreign key constraints in the database, with their
    /// reconstruction DDL.
    pub fn constraints<C: GenericClient>(&self, client: &mut C) -> Result<Vec<Constraint>> {
        let rows = client.query(
            "SELECT conrelid::regclass::text AS table_on,
                    confrelid::regclass::text AS table_from,
                    contype::text AS constraint_type,
                    conname::text AS constraint_name,
                    convalidated AS constraint_validated,
                    pg_get_constraintdef(oid) AS definition
             FROM pg_constraint
             WHERE contype IN ('f', 'p')",
            &[],
        )?;
        Ok(rows
            .iter()
            .map(|row| Constraint {
                table_on: row.get("table_on"),
                table_from: row.get("table_from"),
                constraint_type: row.get("constraint_type"),
                name: row.get("constraint_name"),
                validated: row.get("constraint_validated"),
                definition: row.get("definition"),
            })
            .collect())
    }

    /// Non-internal trigger DDL for the table, ready to re-run after swap.
    pub fn triggers<C: GenericClient>(&self, client: &mut C, table_name: &str) -> Result<String> {
        let rows = client.query(
            "SELECT pg_get_triggerdef(oid) AS tdef FROM pg_trigger
             WHERE tgrelid = ($1)::text::regclass AND tgisinternal = FALSE",
            &[&self.qualified(table_name)],
        )?;
        Ok(rows
            .iter()
            .map(|row| format!("{};", row.get::<_, String>("tdef")))
            .join(" "))
    }

    /// The table's reloptions (autovacuum settings and friends) as a
    /// comma-separated list, empty when none are set.
    pub fn storage_parameters<C: GenericClient>(
        &self,
        client: &mut C,
        table: &str,
    ) -> Result<String> {
        let rows = client.query(
            "SELECT array_to_string(reloptions, ',') AS params FROM pg_class WHERE relname = $1",
            &[&table],
        )?;
        Ok(rows
            .first()
            .and_then(|row| row.get::<_, Option<String>>("params"))
            .unwrap_or_default())
    }

    /// Views whose definition mentions the table by name. Views bind to the
    /// table OID, so after the rename swap they must be redefined against
    /// the new table.
    pub fn view_definitions<C: GenericClient>(
        &self,
        client: &mut C,
        table: &str,
    ) -> Result<Vec<ViewDefinition>> {
        let rows = client.query(
            "SELECT table_name::text, view_definition::text
             FROM information_schema.views
             WHERE table_schema = $1 AND view_definition LIKE $2",
            &[&self.schema, &format!("%{table}%")],
        )?;
        Ok(rows
            .iter()
            .map(|row| ViewDefinition {
                name: row.get(0),
                definition: row.get::<_, String>(1).trim().to_string(),
            })
            .collect())
    }
}

/// For each foreign key on other tables referencing `table`: drop it and
/// re-add it as NOT VALID, so the constraint takes effect on the swapped-in
/// table without a blocking validation scan.
pub fn referential_foreign_key_statements(constraints: &[Constraint], table: &str) -> String {
    constraints
        .iter()
        .filter(|c| c.table_from == table && c.constraint_type == "f")
        .map(|c| {
            format!(
                "ALTER TABLE {table_on} DROP CONSTRAINT {name}; {add}",
                table_on = c.table_on,
                name = c.name,
                add = add_constraint_not_valid(c),
            )
        })
        .join(" ")
}

/// Foreign keys declared on the table itself. The shadow table does not
/// inherit them through LIKE, so they are re-added (NOT VALID) at swap time.
pub fn self_foreign_key_statements(constraints: &[Constraint], table: &str) -> String {
    constraints
        .iter()
        .filter(|c| c.table_on == table && c.constraint_type == "f")
        .map(add_constraint_not_valid)
        .join(" ")
}

/// VALIDATE CONSTRAINT statements for every foreign key touching the table,
/// run after the swap, outside the exclusive lock.
pub fn foreign_keys_to_validate(constraints: &[Constraint], table: &str) -> String {
    constraints
        .iter()
        .filter(|c| {
            c.constraint_type == "f" && (c.table_from == table || c.table_on == table)
        })
        .map(|c| format!("ALTER TABLE {} VALIDATE CONSTRAINT {};", c.table_on, c.name))
        .join(" ")
}

fn add_constraint_not_valid(constraint: &Constraint) -> String {
    if constraint.definition.ends_with("NOT VALID") {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {};",
            constraint.table_on, constraint.name, constraint.definition
        )
    } else {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {} NOT VALID;",
            constraint.table_on, constraint.name, constraint.definition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk(table_on: &str, table_from: &str, name: &str, definition: &str) -> Constraint {
        Constraint {
            table_on: table_on.to_string(),
            table_from: table_from.to_string(),
            constraint_type: "f".to_string(),
            name: name.to_string(),
            validated: true,
            definition: definition.to_string(),
        }
    }

    #[test]
    fn referential_keys_are_dropped_and_readded_not_valid() {
        let constraints = vec![fk(
            "orders",
            "books",
            "orders_book_id_fkey",
            "FOREIGN KEY (book_id) REFERENCES books(id)",
        )];
        let sql = referential_foreign_key_statements(&constraints, "books");
        assert_eq!(
            sql,
            "ALTER TABLE orders DROP CONSTRAINT orders_book_id_fkey; \
             ALTER TABLE orders ADD CONSTRAINT orders_book_id_fkey \
             FOREIGN KEY (book_id) REFERENCES books(id) NOT VALID;"
        );
    }

    #[test]
    fn already_not_valid_definitions_are_not_doubled() {
        let constraints = vec![fk(
            "orders",
            "books",
            "orders_book_id_fkey",
            "FOREIGN KEY (book_id) REFERENCES books(id) NOT VALID",
        )];
        let sql = referential_foreign_key_statements(&constraints, "books");
        assert!(sql.ends_with("REFERENCES books(id) NOT VALID;"));
        assert!(!sql.contains("NOT VALID NOT VALID"));
    }

    #[test]
    fn self_keys_are_only_added() {
        let constraints = vec![fk(
            "books",
            "authors",
            "books_author_id_fkey",
            "FOREIGN KEY (author_id) REFERENCES authors(id)",
        )];
        let sql = self_foreign_key_statements(&constraints, "books");
        assert_eq!(
            sql,
            "ALTER TABLE books ADD CONSTRAINT books_author_id_fkey \
             FOREIGN KEY (author_id) REFERENCES authors(id) NOT VALID;"
        );
        assert!(referential_foreign_key_statements(&constraints, "books").is_empty());
    }

    #[test]
    fn validation_covers_both_directions() {
        let constraints = vec![
            fk("orders", "books", "orders_book_id_fkey", "FOREIGN KEY (book_id) REFERENCES books(id)"),
            fk("books", "authors", "books_author_id_fkey", "FOREIGN KEY (author_id) REFERENCES authors(id)"),
        ];
        let sql = foreign_keys_to_validate(&constraints, "books");
        assert_eq!(
            sql,
            "ALTER TABLE orders VALIDATE CONSTRAINT orders_book_id_fkey; \
             ALTER TABLE books VALIDATE CONSTRAINT books_author_id_fkey;"
        );
    }
}
