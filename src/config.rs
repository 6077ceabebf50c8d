use std::{collections::BTreeSet, net::SocketAddr, time::Duration};

use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "ledgerview", about = "Daily balances, trial balances and period close for a double-entry ledger")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "ledgerview.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate daily balances of one date for every entity (defaults to yesterday)
    Generate {
        #[arg(long)]
        date: Option<String>,
    },
    /// Generate daily balances over a date range for every entity
    GenerateRange {
        #[arg(long)]
        start: String,
        /// Defaults to the end of the start date's month
        #[arg(long)]
        end: Option<String>,
    },
    /// Close a reporting period and freeze its trial balance
    Close {
        /// Period as YYYY-MM
        #[arg(long)]
        period: String,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        closed_by: String,
        /// Close the adjustment period instead of the regular one
        #[arg(long)]
        adjustment: bool,
    },
    /// Open the adjustment period of a closed month
    OpenAdjustment {
        #[arg(long)]
        period: String,
        #[arg(long)]
        entity: String,
    },
    /// Show a trial balance for a date, a date range or a period
    TrialBalance {
        #[arg(long)]
        entity: String,
        #[arg(long, conflicts_with_all = ["from", "period"])]
        date: Option<String>,
        #[arg(long, requires = "to", conflicts_with = "period")]
        from: Option<String>,
        #[arg(long, requires = "from")]
        to: Option<String>,
        #[arg(long)]
        period: Option<String>,
        /// Apply the restricted guest view
        #[arg(long)]
        guest: bool,
        /// Show the balance sheet view instead of the full tree
        #[arg(long)]
        balance_sheet: bool,
    },
    /// List daily balances of one date
    Balances {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        date: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        sub_category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: i64,
        #[arg(long)]
        next: Option<String>,
        #[arg(long)]
        prev: Option<String>,
    },
    /// List reporting periods
    Periods {
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: i64,
        #[arg(long)]
        next: Option<String>,
        #[arg(long)]
        prev: Option<String>,
    },
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub clock: ClockConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub close: CloseConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Sub-categories hidden from the guest view.
    #[serde(default)]
    pub guest_excluded_sub_categories: BTreeSet<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default)]
    pub step_delay_ms: u64,

    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClockConfig {
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint; disabled when absent.
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloseConfig {
    /// How long a close waits for a claim held by another closer.
    #[serde(default = "default_close_wait_ms")]
    pub wait_ms: u64,

    /// A CLOSING claim older than this is taken over.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Memory
}

fn default_sqlite_path() -> String {
    "ledgerview.db".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    3600
}

fn default_close_wait_ms() -> u64 {
    5000
}

fn default_claim_ttl_secs() -> u64 {
    600
}

fn default_utc_offset() -> String {
    "+07:00".to_string()
}

fn default_export_dir() -> String {
    "exports".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_sqlite_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            guest_excluded_sub_categories: BTreeSet::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 0,
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
        }
    }
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_close_wait_ms(),
            claim_ttl_secs: default_claim_ttl_secs(),
        }
    }
}

/// Tunables of the pipeline itself, independent of where they were read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub cache_ttl: Duration,
    pub guest_excluded_sub_categories: BTreeSet<String>,
    pub step_delay: Duration,
    pub lock_ttl: Duration,
    pub close_wait: Duration,
    pub close_claim_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Config::default().pipeline_settings()
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    /// Parses TOML, falling back to defaults when the text is invalid.
    pub fn parse(contents: &str) -> Self {
        toml::from_str(contents).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            guest_excluded_sub_categories: self.cache.guest_excluded_sub_categories.clone(),
            step_delay: Duration::from_millis(self.batch.step_delay_ms),
            lock_ttl: Duration::from_secs(self.batch.lock_ttl_secs),
            close_wait: Duration::from_millis(self.close.wait_ms),
            close_claim_ttl: Duration::from_secs(self.close.claim_ttl_secs),
        }
    }

    pub fn metrics_addr(&self) -> Option<Result<SocketAddr, std::net::AddrParseError>> {
        self.metrics.listen.as_deref().map(str::parse)
    }
}
