//! `beatstore` - manage periodic task definitions in a beatstore database.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use beatstore_scheduler::{IntervalPeriod, SolarEvent};

mod commands;

#[derive(Parser)]
#[command(name = "beatstore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (default: $BEATSTORE_CONFIG, then ~/.beatstore/beatstore.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database file, overriding the config
    #[arg(long)]
    db_path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Fields shared by every `add-*` command.
#[derive(Args)]
pub struct TaskArgs {
    /// Unique entry name
    #[arg(long)]
    pub name: String,

    /// Task identifier the scheduler invokes
    #[arg(long)]
    pub task: String,

    /// Positional arguments as a JSON array
    #[arg(long, default_value = "[]", value_parser = parse_json)]
    pub args: serde_json::Value,

    /// Keyword arguments as a JSON object
    #[arg(long, default_value = "{}", value_parser = parse_json)]
    pub kwargs: serde_json::Value,

    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long)]
    pub priority: Option<i64>,

    /// Fire once, then disable
    #[arg(long)]
    pub one_off: bool,

    /// Create the entry disabled
    #[arg(long)]
    pub disabled: bool,

    #[arg(long, default_value = "")]
    pub description: String,
}

fn parse_json(raw: &str) -> serde_json::Result<serde_json::Value> {
    serde_json::from_str(raw)
}

#[derive(Subcommand)]
enum Commands {
    /// Add an entry that repeats at a fixed interval
    AddInterval {
        #[command(flatten)]
        task: TaskArgs,

        #[arg(long)]
        every: i64,

        /// days, hours, minutes, seconds or microseconds
        #[arg(long)]
        period: IntervalPeriod,
    },

    /// Add an entry driven by a crontab expression
    AddCrontab {
        #[command(flatten)]
        task: TaskArgs,

        #[arg(long, default_value = "*")]
        minute: String,
        #[arg(long, default_value = "*")]
        hour: String,
        /// 0-6, Sunday = 0
        #[arg(long, default_value = "*")]
        day_of_week: String,
        #[arg(long, default_value = "*")]
        day_of_month: String,
        #[arg(long, default_value = "*")]
        month_of_year: String,

        /// IANA zone name (default: schedule.default_timezone from config)
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Add an entry that fires at a solar event
    AddSolar {
        #[command(flatten)]
        task: TaskArgs,

        /// e.g. sunrise, sunset, solar_noon, dawn_civil
        #[arg(long)]
        event: SolarEvent,

        #[arg(long, allow_hyphen_values = true)]
        latitude: f64,

        #[arg(long, allow_hyphen_values = true)]
        longitude: f64,
    },

    /// List entries with their schedules
    List {
        /// Only show enabled entries
        #[arg(long)]
        enabled: bool,
    },

    /// Print one entry as JSON
    Show { name: String },

    /// Enable an entry
    Enable { name: String },

    /// Disable an entry (run history is kept)
    Disable { name: String },

    /// Delete an entry; its schedule row is kept
    Delete { name: String },

    /// Print when anything last changed
    LastChange,

    /// Print the next firings of an entry
    Next {
        name: String,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Follow the change ledger and report reloads until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "beatstore=debug"
    } else {
        "beatstore=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // load config: --config > BEATSTORE_CONFIG env > ~/.beatstore/beatstore.toml
    let mut config = beatstore_core::BeatstoreConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            beatstore_core::BeatstoreConfig::default()
        });
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }

    commands::execute(&config, cli.command).await
}
