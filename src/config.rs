//! Configuration for harvest-ledger
//!
//! Process settings come from CLI arguments with environment fallbacks. Point
//! values and an optional inline badge catalog live in a TOML ledger file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::badges::{self, default_catalog, sort_catalog, validate_catalog};
use crate::error::ConfigError;
use crate::types::{ActionKind, Badge};

/// Store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Durable SQLite file under DATA_DIR
    Sqlite,
    /// Volatile maps, lost on restart
    Memory,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// harvest-ledger - points, badges and live feeds for food sharing
#[derive(Parser, Debug, Clone)]
#[command(name = "harvest-ledger")]
#[command(about = "Gamification ledger and real-time event feed for community food sharing")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory holding the SQLite ledger
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Store backend
    #[arg(long, env = "STORE", value_enum, default_value = "sqlite")]
    pub store: StoreKind,

    /// Ledger config file ([points] and optional [[badges]])
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Badge catalog file; overrides any [[badges]] in CONFIG_FILE
    #[arg(long, env = "CATALOG_FILE")]
    pub catalog_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Undelivered events kept per subscriber before the oldest are dropped
    #[arg(long, env = "BUS_CAPACITY", default_value = "256")]
    pub bus_capacity: usize,

    /// Entries held by the live leaderboard
    #[arg(long, env = "LEADERBOARD_SIZE", default_value = "10")]
    pub leaderboard_size: usize,

    /// How long an HTTP caller waits on a ledger action
    #[arg(long, env = "ACTION_TIMEOUT_MS", default_value = "5000")]
    pub action_timeout_ms: u64,

    /// Webhook receiving notifications; log-only when unset
    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    pub notify_webhook_url: Option<String>,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bus_capacity == 0 {
            return Err("BUS_CAPACITY must be at least 1".to_string());
        }
        if self.leaderboard_size == 0 {
            return Err("LEADERBOARD_SIZE must be at least 1".to_string());
        }
        if self.action_timeout_ms == 0 {
            return Err("ACTION_TIMEOUT_MS must be greater than 0".to_string());
        }
        if let Some(url) = &self.notify_webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("NOTIFY_WEBHOOK_URL must be an http(s) URL: {}", url));
            }
        }
        Ok(())
    }

    /// Catalog to seed the store with.
    ///
    /// CATALOG_FILE wins, then `[[badges]]` from the ledger config, then the
    /// built-in catalog.
    pub fn resolve_catalog(&self, ledger: &LedgerConfig) -> Result<Vec<Badge>, ConfigError> {
        if let Some(path) = &self.catalog_file {
            return badges::load_catalog(path);
        }
        if !ledger.badges.is_empty() {
            let mut catalog = ledger.badges.clone();
            sort_catalog(&mut catalog);
            return Ok(catalog);
        }
        Ok(default_catalog())
    }
}

/// Points granted per qualifying action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsConfig {
    #[serde(default = "default_donation_points")]
    pub donation_created: u64,

    #[serde(default = "default_profile_points")]
    pub profile_completed: u64,

    #[serde(default = "default_request_points")]
    pub request_fulfilled: u64,
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            donation_created: default_donation_points(),
            profile_completed: default_profile_points(),
            request_fulfilled: default_request_points(),
        }
    }
}

fn default_donation_points() -> u64 { 10 }
fn default_profile_points() -> u64 { 20 }
fn default_request_points() -> u64 { 5 }

impl PointsConfig {
    /// `(points, donations)` granted for `kind`; `None` for adjustments.
    pub fn award_for(&self, kind: ActionKind) -> Option<(u64, u64)> {
        match kind {
            ActionKind::DonationCreated => Some((self.donation_created, 1)),
            ActionKind::ProfileCompleted => Some((self.profile_completed, 0)),
            ActionKind::RequestFulfilled => Some((self.request_fulfilled, 0)),
            ActionKind::Adjustment => None,
        }
    }
}

/// Contents of the ledger TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub points: PointsConfig,

    #[serde(default)]
    pub badges: Vec<Badge>,
}

impl LedgerConfig {
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        validate_catalog(&config.badges)?;
        Ok(config)
    }
}

/// Load the ledger file, or defaults when no path is given.
pub fn load_ledger_config(path: Option<&Path>) -> Result<LedgerConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(LedgerConfig::default());
    };
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    LedgerConfig::from_toml(&content, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["harvest-ledger"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_validate() {
        let args = args(&[]);
        assert_eq!(args.store, StoreKind::Sqlite);
        assert_eq!(args.bus_capacity, 256);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_capacity_and_bad_webhook() {
        assert!(args(&["--bus-capacity", "0"]).validate().is_err());
        assert!(args(&["--notify-webhook-url", "ftp://x"]).validate().is_err());
        assert!(args(&["--store", "memory", "--log-format", "json"]).validate().is_ok());
    }

    #[test]
    fn test_partial_points_section_keeps_defaults() {
        let config = LedgerConfig::from_toml("[points]\ndonation_created = 15\n", "inline").unwrap();
        assert_eq!(config.points.donation_created, 15);
        assert_eq!(config.points.profile_completed, 20);
        assert!(config.badges.is_empty());
    }

    #[test]
    fn test_award_table() {
        let points = PointsConfig::default();
        assert_eq!(points.award_for(ActionKind::DonationCreated), Some((10, 1)));
        assert_eq!(points.award_for(ActionKind::ProfileCompleted), Some((20, 0)));
        assert_eq!(points.award_for(ActionKind::Adjustment), None);
    }

    #[test]
    fn test_catalog_precedence() {
        let inline = r#"
[[badges]]
id = "sprout"
name = "Sprout"
points_required = 1
"#;
        let ledger = LedgerConfig::from_toml(inline, "inline").unwrap();
        let catalog = args(&[]).resolve_catalog(&ledger).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].id, "sprout");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[badges]]\nid = \"tree\"\nname = \"Tree\"\npoints_required = 5").unwrap();
        let path = file.path().to_str().unwrap();
        let catalog = args(&["--catalog-file", path]).resolve_catalog(&ledger).unwrap();
        assert_eq!(catalog[0].id, "tree");

        let catalog = args(&[]).resolve_catalog(&LedgerConfig::default()).unwrap();
        assert_eq!(catalog, default_catalog());
    }

    #[test]
    fn test_duplicate_inline_badges_rejected() {
        let inline = "[[badges]]\nid = \"a\"\nname = \"A\"\npoints_required = 1\n[[badges]]\nid = \"a\"\nname = \"B\"\npoints_required = 2\n";
        assert!(matches!(
            LedgerConfig::from_toml(inline, "inline"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_ledger_config(Some(Path::new("/nonexistent/ledger.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(load_ledger_config(None).is_ok());
    }
}
