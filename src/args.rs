use crate::session::{DEFAULT_DELTA_COUNT, DEFAULT_PULL_BATCH_COUNT, DEFAULT_WAIT_TIME_FOR_LOCK};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Online schema change for PostgreSQL", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Safely apply a schema change with minimal locking
    Perform {
        /// The ALTER statement to perform the schema change
        #[arg(short = 'a', long)]
        alter_statement: String,

        /// The schema in which the table is
        #[arg(short = 's', long, default_value = "public")]
        schema: String,

        /// Name of the database
        #[arg(short = 'd', long)]
        dbname: String,

        /// Server host where the database is located
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Username for the database
        #[arg(short = 'u', long)]
        username: String,

        /// Port for the database
        #[arg(short = 'p', long, default_value_t = 5432)]
        port: u16,

        /// Emit logs in debug mode
        #[arg(short = 'v', long, default_value_t = false)]
        verbose: bool,

        /// Drop the old primary table after the swap
        #[arg(long, default_value_t = false)]
        drop: bool,

        /// Terminate competing backends between lock attempts
        #[arg(short = 'k', long, default_value_t = false)]
        kill_backends: bool,

        /// Seconds to wait for the exclusive lock on each attempt
        #[arg(short = 'w', long, default_value_t = DEFAULT_WAIT_TIME_FOR_LOCK)]
        wait_time_for_lock: u64,

        /// Path to a custom bulk-copy SQL file with a %{shadow_table} placeholder
        #[arg(short = 'c', long)]
        copy_statement: Option<PathBuf>,

        /// Rows pulled from the audit table per replay batch
        #[arg(short = 'b', long, default_value_t = DEFAULT_PULL_BATCH_COUNT)]
        pull_batch_count: i64,

        /// Remaining-row threshold at which replay hands over to the swap
        #[arg(short = 'e', long, default_value_t = DEFAULT_DELTA_COUNT)]
        delta_count: usize,
    },
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}
