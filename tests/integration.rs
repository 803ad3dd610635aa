// End-to-end tests against a live PostgreSQL server. Run with
// `cargo test -- --ignored` and PG_OSC_TEST_DB_URL pointing at a server
// allowed to create and drop databases.

mod common;

use pg_osc::capture::ChangeCapture;
use pg_osc::swap::Swap;
use pg_osc::{MigrationState, Orchestrator, OscError, ReplayEngine, Session};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn session(alter: &str, wait_time_for_lock: u64) -> Session {
    Session::new(alter, "public", true, false, wait_time_for_lock, 1000, 20, None).unwrap()
}

fn run_migration(test_db: &common::TestDb, alter: &str) {
    let mut orchestrator =
        Orchestrator::new(session(alter, 5), test_db.pool.clone()).unwrap();
    orchestrator.run().unwrap();
}

/// State as `prepare` would fill it for the seeded books table, for tests
/// that drive capture, replay or swap directly.
fn manual_state(session: &Session) -> MigrationState {
    let mut state = MigrationState::new(session).unwrap();
    state.primary_key = "id".to_string();
    state.columns = vec!["id".to_string(), "email".to_string(), "name".to_string()];
    state
}

fn column_names(client: &mut postgres::Client, table: &str) -> Vec<String> {
    client
        .query(
            "SELECT column_name::text FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
            &[&table],
        )
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect()
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn add_column_migration_preserves_rows() {
    let test_db = common::setup_test_db();
    run_migration(&test_db, "ALTER TABLE books ADD COLUMN purchased boolean DEFAULT false");
    let mut client = test_db.pool.get().unwrap();
    assert!(column_names(&mut client, "books").contains(&"purchased".to_string()));
    let row = client.query_one("SELECT count(*) FROM books", &[]).unwrap();
    assert_eq!(row.get::<_, i64>(0), 500);
    let row = client
        .query_one("SELECT count(*) FROM books WHERE purchased", &[])
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 0);
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn dropped_column_is_absent_after_migration() {
    let test_db = common::setup_test_db();
    run_migration(&test_db, "ALTER TABLE books DROP COLUMN email");
    let mut client = test_db.pool.get().unwrap();
    let columns = column_names(&mut client, "books");
    assert!(!columns.contains(&"email".to_string()));
    let row = client.query_one("SELECT count(*) FROM books", &[]).unwrap();
    assert_eq!(row.get::<_, i64>(0), 500);
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn renamed_column_carries_values() {
    let test_db = common::setup_test_db();
    run_migration(&test_db, "ALTER TABLE books RENAME COLUMN email TO new_email");
    let mut client = test_db.pool.get().unwrap();
    let columns = column_names(&mut client, "books");
    assert!(columns.contains(&"new_email".to_string()));
    assert!(!columns.contains(&"email".to_string()));
    let row = client
        .query_one("SELECT new_email FROM books WHERE id = 1", &[])
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "user1@example.com");
}

/// Writes applied to a control table and the migrated table in lockstep
/// during the run must agree afterwards: no captured write may be lost or
/// doubled by the copy/replay/swap pipeline.
#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn concurrent_writes_survive_the_migration() {
    let test_db = common::setup_test_db();
    {
        let mut client = test_db.pool.get().unwrap();
        client
            .batch_execute("CREATE TABLE books_control AS SELECT id, email, name FROM books")
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writer_stop = stop.clone();
    let writer_pool = test_db.pool.clone();
    let writer = std::thread::spawn(move || {
        let mut client = writer_pool.get().unwrap();
        let mut n = 0;
        while !writer_stop.load(Ordering::Relaxed) {
            n += 1;
            let email = format!("writer{n}@example.com");
            let row = client
                .query_one(
                    "INSERT INTO books (email, name) VALUES ($1, 'during') RETURNING id",
                    &[&email],
                )
                .unwrap();
            let id: i64 = row.get(0);
            client
                .execute(
                    "INSERT INTO books_control (id, email, name) VALUES ($1, $2, 'during')",
                    &[&id, &email],
                )
                .unwrap();
            if n % 3 == 0 {
                client
                    .execute("UPDATE books SET name = 'touched' WHERE id = $1", &[&id])
                    .unwrap();
                client
                    .execute("UPDATE books_control SET name = 'touched' WHERE id = $1", &[&id])
                    .unwrap();
            }
            if n % 7 == 0 {
                client.execute("DELETE FROM books WHERE id = $1", &[&id]).unwrap();
                client
                    .execute("DELETE FROM books_control WHERE id = $1", &[&id])
                    .unwrap();
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    });

    run_migration(&test_db, "ALTER TABLE books ADD COLUMN purchased boolean DEFAULT false");
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();

    let mut client = test_db.pool.get().unwrap();
    let row = client
        .query_one(
            "SELECT count(*) FROM (
                 (SELECT id, email, name FROM books
                  EXCEPT SELECT id, email, name FROM books_control)
                 UNION ALL
                 (SELECT id, email, name FROM books_control
                  EXCEPT SELECT id, email, name FROM books)
             ) AS diff",
            &[],
        )
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 0, "migrated table diverged from control table");
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn capture_trigger_feeds_replay_onto_the_shadow_table() {
    let test_db = common::setup_test_db();
    let session = session("ALTER TABLE books ADD COLUMN purchased boolean", 5);
    let state = manual_state(&session);

    let mut client = test_db.pool.get().unwrap();
    let capture = ChangeCapture::new(&session, &state);
    capture.create_audit_table(&mut client).unwrap();
    capture.install_trigger(&mut client).unwrap();
    client
        .batch_execute(&format!(
            "CREATE TABLE {} (LIKE books INCLUDING ALL)",
            state.shadow_table
        ))
        .unwrap();

    client
        .batch_execute(
            "INSERT INTO books (email, name) VALUES ('x@y.z', 'first');
             UPDATE books SET name = 'second' WHERE email = 'x@y.z';",
        )
        .unwrap();

    let replay = ReplayEngine::new(&session, &state);
    replay.drain_remaining(&mut *client).unwrap();

    let row = client
        .query_one(
            &format!("SELECT name FROM {} WHERE email = 'x@y.z'", state.shadow_table),
            &[],
        )
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "second");
    let row = client
        .query_one(&format!("SELECT count(*) FROM {}", state.audit_table), &[])
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 0, "consumed audit rows were not deleted");
}

/// Drain stops once a batch comes back at or below the configured delta
/// count, leaving the small remainder for the final pass under the lock.
#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn drain_stops_at_the_delta_count_threshold() {
    let test_db = common::setup_test_db();
    let session = Session::new(
        "ALTER TABLE books ADD COLUMN purchased boolean",
        "public",
        true,
        false,
        5,
        10,
        8,
        None,
    )
    .unwrap();
    let state = manual_state(&session);

    let mut client = test_db.pool.get().unwrap();
    let capture = ChangeCapture::new(&session, &state);
    capture.create_audit_table(&mut client).unwrap();
    capture.install_trigger(&mut client).unwrap();
    client
        .batch_execute(&format!(
            "CREATE TABLE {} (LIKE books INCLUDING ALL)",
            state.shadow_table
        ))
        .unwrap();

    client
        .batch_execute(
            "INSERT INTO books (email, name)
             SELECT 'c' || n || '@example.com', 'converging' FROM generate_series(1, 27) AS n",
        )
        .unwrap();

    let replay = ReplayEngine::new(&session, &state);
    replay.drain(&mut *client).unwrap();

    // 27 captured rows in batches of 10: two full batches are replayed,
    // then a batch of 7 is at or below the threshold of 8 and drain stops.
    let row = client
        .query_one(&format!("SELECT count(*) FROM {}", state.audit_table), &[])
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 7);
    let row = client
        .query_one(&format!("SELECT count(*) FROM {}", state.shadow_table), &[])
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 20);
}

/// The unlimited session statement timeout set at the start of a run must
/// survive the swap: the constraint validation scans still run after it.
#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn statement_timeout_stays_unlimited_after_the_swap() {
    let test_db = common::setup_test_db();
    let session = session("ALTER TABLE books ADD COLUMN purchased boolean", 5);
    let state = manual_state(&session);

    let mut client = test_db.pool.get().unwrap();
    client.batch_execute("SET statement_timeout = 0").unwrap();
    let capture = ChangeCapture::new(&session, &state);
    capture.create_audit_table(&mut client).unwrap();
    capture.install_trigger(&mut client).unwrap();
    client
        .batch_execute(&format!(
            "CREATE TABLE {} (LIKE books INCLUDING ALL)",
            state.shadow_table
        ))
        .unwrap();

    let replay = ReplayEngine::new(&session, &state);
    Swap::new(&session, &state).execute(&mut client, &replay).unwrap();

    let row = client.query_one("SHOW statement_timeout", &[]).unwrap();
    assert_eq!(row.get::<_, String>(0), "0");
    // The renames happened: the empty shadow table now answers to books.
    let row = client.query_one("SELECT count(*) FROM books", &[]).unwrap();
    assert_eq!(row.get::<_, i64>(0), 0);
}

/// An audit row whose operation kind cannot be interpreted must fail the
/// replay, not be skipped: a skipped row would never be deleted and every
/// later drain would refetch it.
#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn unrecognized_audit_operation_kind_is_an_error() {
    let test_db = common::setup_test_db();
    let session = session("ALTER TABLE books ADD COLUMN purchased boolean", 5);
    let state = manual_state(&session);

    let mut client = test_db.pool.get().unwrap();
    ChangeCapture::new(&session, &state)
        .create_audit_table(&mut client)
        .unwrap();
    client
        .execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ('TRUNCATE')",
                state.audit_table, state.operation_column
            ),
            &[],
        )
        .unwrap();

    let replay = ReplayEngine::new(&session, &state);
    let err = replay.fetch_batch(&mut *client).unwrap_err();
    assert!(err.to_string().contains("TRUNCATE"));
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn lock_acquisition_is_bounded_by_attempts() {
    let test_db = common::setup_test_db();
    let session = session("ALTER TABLE books ADD COLUMN purchased boolean", 1);

    let mut blocker = test_db.pool.get().unwrap();
    blocker
        .batch_execute("BEGIN; LOCK TABLE books IN ACCESS EXCLUSIVE MODE;")
        .unwrap();

    let mut client = test_db.pool.get().unwrap();
    let acquired = pg_osc::lock::open_lock_exclusive(&mut client, &session).unwrap();
    assert!(!acquired, "lock should not be acquirable while a blocker holds it");

    blocker.batch_execute("ROLLBACK").unwrap();
    let acquired = pg_osc::lock::open_lock_exclusive(&mut client, &session).unwrap();
    assert!(acquired);
    client.batch_execute("COMMIT").unwrap();
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn table_without_primary_key_is_rejected() {
    let test_db = common::setup_test_db();
    {
        let mut client = test_db.pool.get().unwrap();
        client.batch_execute("CREATE TABLE nopk (v TEXT)").unwrap();
    }
    let session = session("ALTER TABLE nopk ADD COLUMN w TEXT", 5);
    let mut orchestrator = Orchestrator::new(session, test_db.pool.clone()).unwrap();
    let err = orchestrator.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OscError>(),
        Some(OscError::ParentTableHasNoPrimaryKey(_))
    ));
}

#[test]
#[serial]
#[ignore = "requires a running PostgreSQL server"]
fn foreign_keys_are_reattached_and_validated() {
    let test_db = common::setup_test_db();
    {
        let mut client = test_db.pool.get().unwrap();
        client
            .batch_execute(
                "CREATE TABLE orders (
                     id BIGSERIAL PRIMARY KEY,
                     book_id BIGINT REFERENCES books (id)
                 );
                 INSERT INTO orders (book_id) SELECT id FROM books LIMIT 10;",
            )
            .unwrap();
    }
    run_migration(&test_db, "ALTER TABLE books ADD COLUMN purchased boolean DEFAULT false");

    let mut client = test_db.pool.get().unwrap();
    let row = client
        .query_one(
            "SELECT convalidated, pg_get_constraintdef(oid) AS def
             FROM pg_constraint
             WHERE conrelid = 'orders'::regclass AND contype = 'f'",
            &[],
        )
        .unwrap();
    assert!(row.get::<_, bool>("convalidated"));
    assert!(!row.get::<_, String>("def").ends_with("NOT VALID"));
}
