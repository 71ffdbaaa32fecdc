// src/cli.rs
//! Command-line interface. Credentials and the database URL can also come from the environment.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the pipeline TOML config (defaults to $PIPELINE_CONFIG_PATH, then config/pipeline.toml)
    #[arg(short, long)]
    pub config: Option<String>,

    /// SQLite URL, e.g. sqlite://news.db
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Keep everything in memory (ignores --database-url)
    #[arg(long)]
    pub memory: bool,

    #[arg(long, env = "FINNHUB_API_KEY", hide_env_values = true)]
    pub finnhub_api_key: Option<String>,

    #[arg(long, env = "POLYGON_API_KEY", hide_env_values = true)]
    pub polygon_api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the task list once and print the summary
    Run,

    /// Run the task list every N seconds
    Schedule {
        #[arg(long, default_value_t = 900)]
        interval_secs: u64,

        /// Also serve the ops API (health, stats, news, metrics) on this address
        #[arg(long)]
        serve: Option<String>,
    },

    /// Clear fetch state so the next run re-fetches with the default look-back
    ResetState {
        #[arg(long)]
        scope: Option<String>,

        #[arg(long)]
        provider: Option<String>,
    },

    /// Print raw and canonical store counts
    Stats,
}
