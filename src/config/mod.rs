//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;
#[cfg(test)]
mod tests;

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::memo::{CleanupPolicy, StorageMode};

pub use cli::{
    CleanupArgs, CliArgs, Command, FingerprintArgs, GlobalOverrides, InspectArgs, SweepArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "soffio-memo";
const ENV_PREFIX: &str = "SOFFIO_MEMO";
pub(crate) const DEFAULT_STORE_DIR: &str = "/tmp/soffio-memo";
const DEFAULT_STORE_BACKEND: &str = "filesystem";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
// Cleanup streams rows on one connection while deleting on another.
const MIN_DB_MAX_CONNECTIONS: u32 = 2;
const DEFAULT_CLEANUP_INTERVAL_MINUTES: u64 = 60;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub memo: MemoSettings,
    pub cleanup: CleanupSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Filesystem {
        path: PathBuf,
    },
    Postgres {
        url: String,
        max_connections: NonZeroU32,
    },
}

/// Defaults applied to wrappers built from configuration.
#[derive(Debug, Clone, Copy)]
pub struct MemoSettings {
    pub storage_mode: StorageMode,
    pub resolve_in_parallel: bool,
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub policies: Vec<CleanupPolicy>,
    pub interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    memo: RawMemoSettings,
    cleanup: RawCleanupSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(path) = overrides.store_path.as_ref() {
            self.store.path = Some(path.clone());
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            store,
            memo,
            cleanup,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;
        let memo = build_memo_settings(memo)?;
        let cleanup = build_cleanup_settings(cleanup)?;

        Ok(Self {
            logging,
            store,
            memo,
            cleanup,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend_name = store
        .backend
        .unwrap_or_else(|| DEFAULT_STORE_BACKEND.to_string());

    let backend = match backend_name.trim().to_ascii_lowercase().as_str() {
        "memory" => StoreBackend::Memory,
        "filesystem" | "fs" => {
            let path = store
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
            if path.as_os_str().is_empty() {
                return Err(LoadError::invalid("store.path", "path must not be empty"));
            }
            StoreBackend::Filesystem { path }
        }
        "postgres" => {
            let url = store
                .url
                .and_then(|value| {
                    let trimmed = value.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                })
                .ok_or_else(|| {
                    LoadError::invalid("store.url", "required when store.backend is postgres")
                })?;

            let max = store
                .max_connections
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
            if max < MIN_DB_MAX_CONNECTIONS {
                return Err(LoadError::invalid(
                    "store.max_connections",
                    format!("must be at least {MIN_DB_MAX_CONNECTIONS}"),
                ));
            }
            let max_connections = non_zero_u32(max.into(), "store.max_connections")?;

            StoreBackend::Postgres {
                url,
                max_connections,
            }
        }
        other => {
            return Err(LoadError::invalid(
                "store.backend",
                format!("unknown backend `{other}` (expected memory, filesystem or postgres)"),
            ));
        }
    };

    Ok(StoreSettings { backend })
}

fn build_memo_settings(memo: RawMemoSettings) -> Result<MemoSettings, LoadError> {
    let storage_mode = match memo.storage_mode.as_deref().map(str::trim) {
        None => StorageMode::default(),
        Some(mode) => match mode.to_ascii_lowercase().as_str() {
            "memory" => StorageMode::Memory,
            "persistent" => StorageMode::Persistent,
            "both" => StorageMode::Both,
            other => {
                return Err(LoadError::invalid(
                    "memo.storage_mode",
                    format!("unknown mode `{other}` (expected memory, persistent or both)"),
                ));
            }
        },
    };

    Ok(MemoSettings {
        storage_mode,
        resolve_in_parallel: memo.resolve_in_parallel.unwrap_or(true),
    })
}

fn build_cleanup_settings(cleanup: RawCleanupSettings) -> Result<CleanupSettings, LoadError> {
    let interval_minutes = cleanup
        .interval_minutes
        .unwrap_or(DEFAULT_CLEANUP_INTERVAL_MINUTES);
    if interval_minutes == 0 {
        return Err(LoadError::invalid(
            "cleanup.interval_minutes",
            "must be greater than zero",
        ));
    }

    let mut policies: Vec<CleanupPolicy> = Vec::with_capacity(cleanup.policies.len());
    for raw in cleanup.policies {
        let namespace = raw
            .namespace
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                LoadError::invalid("cleanup.policies", "every policy needs a namespace")
            })?;
        let max_age_minutes = raw.max_age_minutes.ok_or_else(|| {
            LoadError::invalid(
                "cleanup.policies",
                format!("policy `{namespace}` is missing max_age_minutes"),
            )
        })?;
        if policies.iter().any(|policy| policy.namespace == namespace) {
            return Err(LoadError::invalid(
                "cleanup.policies",
                format!("namespace `{namespace}` is listed twice"),
            ));
        }
        policies.push(CleanupPolicy {
            namespace,
            max_age_minutes,
        });
    }

    Ok(CleanupSettings {
        policies,
        interval: Duration::from_secs(interval_minutes.saturating_mul(60)),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    path: Option<PathBuf>,
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMemoSettings {
    storage_mode: Option<String>,
    resolve_in_parallel: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCleanupSettings {
    interval_minutes: Option<u64>,
    policies: Vec<RawCleanupPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCleanupPolicy {
    namespace: Option<String>,
    max_age_minutes: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
