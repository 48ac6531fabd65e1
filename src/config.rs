//! Configuration sourced from the environment and the optional config file.
//!
//! Credentials are only ever read from the environment so they don't show up
//! in process listings.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::backends::Tag;
use crate::odoo::{LayoutError, Odoo};
use crate::util::RetentionPolicy;

pub const KOPIA_PASSWORD: &str = "KOPIA_PASSWORD";
pub const PGDATABASE: &str = "PGDATABASE";
/// Connection variables read by the PostgreSQL client programs.
pub const PG_CONNECTION: [&str; 4] = ["PGHOST", "PGPORT", "PGUSER", "PGPASSWORD"];

const DEFAULT_COMPRESSION: &str = "s2-default";

/// Invalid or incomplete configuration, detected before any external call.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("Environment variable(s) not set: {}", _0.join(", "))]
    MissingEnv(#[error(ignore)] Vec<&'static str>),
    #[display("Reading the config file {} failed: {_1}", _0.display())]
    ReadConfig(#[error(not(source))] PathBuf, #[error(source)] io::Error),
    #[display("Parsing the config file {} failed: {_1}", _0.display())]
    ParseConfig(#[error(not(source))] PathBuf, #[error(source)] toml::de::Error),
    #[display("Nothing to restore. Request --postgres-restore, --filestore-restore or --download-only")]
    NothingToRestore,
    #[display("--download-only can't be combined with --postgres-restore or --filestore-restore")]
    DownloadWithApply,
    #[display("No target database specified. Use --target-database or set PGDATABASE")]
    MissingTargetDatabase,
    #[display(
        "Cannot restore the filestore without knowing the source database name. Use --source-database or enable --postgres-restore for auto-detection"
    )]
    MissingSourceDatabase,
    #[display("Expected dump file not found: {}", _0.display())]
    DumpNotFound(#[error(ignore)] PathBuf),
    #[display("{_0}")]
    #[from]
    Layout(LayoutError),
}

/// Value of an environment variable, unset and empty are the same.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Fails listing every variable in `names` that `lookup` doesn't know.
pub fn require_env(names: &[&'static str], lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    let missing: Vec<_> = names
        .iter()
        .copied()
        .filter(|name| lookup(name).is_none())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingEnv(missing))
    }
}

/// Checks the connection variables needed for a dump and returns the database.
pub fn backup_database(lookup: impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let mut required = PG_CONNECTION.to_vec();
    required.push(PGDATABASE);
    require_env(&required, &lookup)?;

    lookup(PGDATABASE).ok_or(ConfigError::MissingEnv(vec![PGDATABASE]))
}

/// Target database of a restore: explicit name or the connection's database.
pub fn restore_target(
    explicit: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    explicit
        .filter(|name| !name.is_empty())
        .or_else(|| lookup(PGDATABASE))
        .ok_or(ConfigError::MissingTargetDatabase)
}

/// Backup settings that may be kept in a TOML file.
///
/// ```toml
/// compression = "zstd"
/// ignore = ["/addons/*"]
/// tags = ["env:prod"]
///
/// [retention]
/// latest = 10
/// daily = 7
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Retention of snapshots of the data directory.
    pub retention: RetentionPolicy,
    /// Kopia compression algorithm.
    pub compression: String,
    /// Ignore rules in addition to the Odoo sessions.
    pub ignore: Vec<String>,
    /// Tags attached to every snapshot.
    pub tags: Vec<Tag>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            compression: DEFAULT_COMPRESSION.to_string(),
            ignore: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl BackupConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str =
            fs::read_to_string(path).map_err(|e| ConfigError::ReadConfig(path.to_path_buf(), e))?;
        let config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseConfig(path.to_path_buf(), e))?;

        log::debug!(target: "config", "Loaded backup config from {}: {config:?}", path.display());
        Ok(config)
    }

    /// Ignore rules including the Odoo HTTP sessions.
    pub fn ignore_rules(&self) -> Vec<String> {
        let mut rules = vec![Odoo::sessions_ignore_rule()];
        rules.extend(self.ignore.iter().cloned());
        rules.dedup();
        rules
    }
}
