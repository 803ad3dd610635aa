//! Bounded ACCESS EXCLUSIVE lock acquisition.
//!
//! The transaction is opened with an explicit BEGIN on the connection rather
//! than a `postgres::Transaction` handle, because the lock must outlive this
//! call: on success the connection is left inside the open transaction and
//! the caller runs its statements there and commits. On failure the
//! transaction is rolled back between attempts. This tool never waits on a
//! lock without a timeout; exhausting the attempts is a hard failure for
//! the caller.

use crate::session::Session;
use anyhow::Result;
use postgres::Client;
use tracing::{info, warn};

pub const LOCK_ATTEMPTS: u32 = 4;

/// Tries to take an ACCESS EXCLUSIVE lock on the primary table, waiting at
/// most `wait_time_for_lock` seconds per attempt. Returns true with the
/// transaction left open on success; false after all attempts failed.
/// Between attempts, competing backends are terminated when the session
/// opted into `kill_backends`.
pub fn open_lock_exclusive(client: &mut Client, session: &Session) -> Result<bool> {
    for attempt in 1..=LOCK_ATTEMPTS {
        let lock = format!(
            "BEGIN; SET LOCAL lock_timeout = '{wait}s'; \
             LOCK TABLE {table} IN ACCESS EXCLUSIVE MODE;",
            wait = session.wait_time_for_lock,
            table = session.table_name,
        );
        match client.batch_execute(&lock) {
            Ok(()) => {
                info!(table = %session.table_name, attempt, "acquired access exclusive lock");
                return Ok(true);
            }
            Err(error) => {
                warn!(table = %session.table_name, attempt, %error, "could not acquire lock");
                // The failed transaction must be closed before anything else
                // runs on this connection.
                client.batch_execute("ROLLBACK")?;
                if attempt < LOCK_ATTEMPTS {
                    kill_backends(client, session)?;
                }
            }
        }
    }
    info!(table = %session.table_name, "lock acquisition attempts exhausted");
    Ok(false)
}

/// Terminates every other backend holding a lock on the table, so the next
/// attempt can win the lock. No-op unless the session opted in.
pub fn kill_backends(client: &mut Client, session: &Session) -> Result<()> {
    if !session.kill_backends {
        return Ok(());
    }
    info!(table = %session.table_name, "terminating competing backends");
    client.execute(
        "SELECT pg_terminate_backend(pid) FROM pg_locks
         WHERE locktype = 'relation'
           AND relation = ($1)::text::regclass::oid
           AND pid <> pg_backend_pid()",
        &[&format!("{}.{}", session.schema, session.table_name)],
    )?;
    Ok(())
}
