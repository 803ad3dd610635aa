//! Main binary entry point for pg-osc.

use anyhow::{Context, Result};
use pg_osc::args::{Command, get_args};
use pg_osc::{Orchestrator, Session};
use r2d2::Pool;
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls as R2d2NoTls};
use std::path::PathBuf;

fn main() -> Result<()> {
    let args = get_args().unwrap_or_else(|err| err.exit());
    match args.command {
        Command::Perform {
            alter_statement,
            schema,
            dbname,
            host,
            username,
            port,
            verbose,
            drop,
            kill_backends,
            wait_time_for_lock,
            copy_statement,
            pull_batch_count,
            delta_count,
        } => {
            init_logging(verbose);
            let copy_statement = read_copy_statement(copy_statement)?;
            let session = Session::new(
                &alter_statement,
                &schema,
                drop,
                kill_backends,
                wait_time_for_lock,
                pull_batch_count,
                delta_count,
                copy_statement,
            )?;
            let mut config = postgres::Config::new();
            config.host(&host).port(port).user(&username).dbname(&dbname);
            if let Ok(password) = std::env::var("PGPASSWORD") {
                config.password(&password);
            }
            let manager = PostgresConnectionManager::new(config, R2d2NoTls);
            let pool = Pool::new(manager)?;
            let mut orchestrator = Orchestrator::new(session, pool)?;
            if let Err(err) = orchestrator.run() {
                if let Some(code) = orchestrator.signal_exit_code() {
                    std::process::exit(code);
                }
                return Err(err);
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "pg_osc=debug" } else { "pg_osc=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn read_copy_statement(path: Option<PathBuf>) -> Result<Option<String>> {
    match path {
        Some(path) => {
            let sql = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read copy statement file {}", path.display()))?;
            Ok(Some(sql))
        }
        None => Ok(None),
    }
}
