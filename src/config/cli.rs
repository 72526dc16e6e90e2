use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the soffio-memo binary.
#[derive(Debug, Parser)]
#[command(
    name = "soffio-memo",
    version,
    about = "Maintenance tool for the Soffio memoization cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SOFFIO_MEMO_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Evict entries of one namespace older than a given age.
    Cleanup(CleanupArgs),
    /// Run every configured cleanup policy.
    Sweep(SweepArgs),
    /// List the entries stored under a namespace.
    Inspect(InspectArgs),
    /// Print the cache key for a list of arguments.
    Fingerprint(FingerprintArgs),
}

/// Overrides accepted by every subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the store backend (memory|filesystem|postgres).
    #[arg(long = "store-backend", value_name = "BACKEND", global = true)]
    pub store_backend: Option<String>,

    /// Override the filesystem store directory.
    #[arg(
        long = "store-path",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub store_path: Option<PathBuf>,

    /// Override the Postgres connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct CleanupArgs {
    /// Namespace to clean.
    #[arg(long, value_name = "NAME")]
    pub namespace: String,

    /// Entries last accessed more than this many minutes ago are deleted.
    #[arg(long = "max-age-minutes", value_name = "MINUTES")]
    pub max_age_minutes: u64,
}

#[derive(Debug, Args, Clone, Default)]
pub struct SweepArgs {
    /// Keep running and sweep on the configured interval.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub watch: bool,
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    /// Namespace to list.
    #[arg(long, value_name = "NAME")]
    pub namespace: String,

    /// Print each entry as a JSON line.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct FingerprintArgs {
    /// Map members to ignore, comma separated.
    #[arg(long = "exclude", value_name = "KEYS", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Positional arguments; each is parsed as JSON, or taken as a plain string.
    #[arg(value_name = "ARG")]
    pub args: Vec<String>,
}
