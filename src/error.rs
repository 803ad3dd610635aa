use thiserror::Error;

/// Failures with a meaning of their own, as opposed to errors bubbling up
/// from the server. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum OscError {
    #[error("not an ALTER TABLE / RENAME COLUMN statement: {0}")]
    NotAnAlterStatement(String),

    #[error("all statements must reference the same table: {0}")]
    MultipleTablesReferenced(String),

    #[error("could not acquire ACCESS EXCLUSIVE lock on {0}")]
    AccessExclusiveLockNotAcquired(String),

    #[error("table {0} has no primary key")]
    ParentTableHasNoPrimaryKey(String),
}
