use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;

mod manifest;

pub use manifest::{BackupManifestArgs, ManifestArgs, RestoreManifestArgs};

use crate::backends::kopia::{KopiaLogLevel, KopiaSettings};
use crate::backends::{SnapshotQuery, Tag};
use crate::config::{self, BackupConfig, ConfigError};
use crate::odoo::{Odoo, DEFAULT_DATA_DIR, DEFAULT_DUMP_DIR, DEFAULT_DUMP_SUBPATH};
use crate::orchestrator::{BackupRun, ListFormat, RestoreRequest};
use crate::util::RetentionOverrides;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Dump the Odoo database and snapshot the Odoo data directory.
    Backup(BackupArgs),
    /// Restore the database and/or filestore from a snapshot.
    Restore(RestoreArgs),
    /// List the snapshots in the repository.
    List(ListArgs),
    /// Print a CronJob manifest running scheduled backups.
    GenerateBackupManifest(BackupManifestArgs),
    /// Print a Job manifest restoring a snapshot once.
    GenerateRestoreManifest(RestoreManifestArgs),
}

#[derive(Args, Debug)]
pub struct KopiaArgs {
    /// Kopia repository connection parameters (e.g. "azure --container=kopia --prefix=ns/").
    #[arg(long, env = "KOPIA_REPO_CONNECT_PARAMS")]
    pub kopia_repo_connect_params: String,

    /// Kopia cache directory.
    #[arg(long, default_value = "/tmp/kopia/cache")]
    pub kopia_cache_dir: PathBuf,

    /// Kopia configuration file (ephemeral).
    #[arg(long, default_value = "/tmp/kopia/repository.config")]
    pub kopia_config_file: PathBuf,

    /// Kopia log level.
    #[arg(long, value_enum, default_value_t)]
    pub kopia_log_level: KopiaLogLevel,

    /// Kopia log directory.
    #[arg(long, default_value = "/tmp/kopia/logs")]
    pub kopia_log_dir: PathBuf,

    /// Kopia hostname override. This must be stable between backups.
    #[arg(long, default_value = "odoo")]
    pub kopia_hostname: String,

    /// Kopia username override. This must be stable between backups.
    #[arg(long, default_value = "odoo")]
    pub kopia_username: String,

    /// Kopia binary path.
    #[arg(long, default_value = "/usr/local/bin/kopia")]
    pub kopia_bin: PathBuf,
}

impl KopiaArgs {
    pub fn settings(&self) -> KopiaSettings {
        KopiaSettings {
            bin: self.kopia_bin.clone(),
            connect_params: self
                .kopia_repo_connect_params
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            cache_dir: self.kopia_cache_dir.clone(),
            config_file: self.kopia_config_file.clone(),
            log_level: self.kopia_log_level,
            log_dir: self.kopia_log_dir.clone(),
            hostname: self.kopia_hostname.clone(),
            username: self.kopia_username.clone(),
        }
    }
}

/// Keep-counts overriding the config file (defaults: 42/0/14/8/6/2).
#[derive(Args, Debug)]
pub struct RetentionArgs {
    /// Number of latest snapshots to keep.
    #[arg(long = "keep-latest")]
    pub latest: Option<u32>,

    /// Number of hourly snapshots to keep.
    #[arg(long = "keep-hourly")]
    pub hourly: Option<u32>,

    /// Number of daily snapshots to keep.
    #[arg(long = "keep-daily")]
    pub daily: Option<u32>,

    /// Number of weekly snapshots to keep.
    #[arg(long = "keep-weekly")]
    pub weekly: Option<u32>,

    /// Number of monthly snapshots to keep.
    #[arg(long = "keep-monthly")]
    pub monthly: Option<u32>,

    /// Number of annual snapshots to keep.
    #[arg(long = "keep-annual")]
    pub annual: Option<u32>,
}

impl From<&RetentionArgs> for RetentionOverrides {
    fn from(args: &RetentionArgs) -> Self {
        Self {
            latest: args.latest,
            hourly: args.hourly,
            daily: args.daily,
            weekly: args.weekly,
            monthly: args.monthly,
            annual: args.annual,
        }
    }
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Disable the PostgreSQL dump.
    #[arg(long = "no-postgres-backup", action = ArgAction::SetFalse)]
    pub postgres_backup: bool,

    /// Ephemeral storage to place the dump in. It *must* be within the Odoo directory.
    #[arg(long, default_value = DEFAULT_DUMP_DIR)]
    pub postgres_backup_dir: PathBuf,

    /// Keep the dump after the snapshot was created.
    #[arg(long = "no-postgres-backup-cleanup", action = ArgAction::SetFalse)]
    pub postgres_backup_cleanup: bool,

    /// Source path to back up, containing filestore, sessions, etc.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub odoo_dir: PathBuf,

    /// Skip the Kopia maintenance run.
    #[arg(long = "no-kopia-maintenance", action = ArgAction::SetFalse)]
    pub kopia_maintenance: bool,

    /// Kopia compression algorithm [default: s2-default].
    #[arg(long)]
    pub kopia_compression: Option<String>,

    /// Tag attached to the snapshot, key:value (repeatable).
    #[arg(long = "tag")]
    pub tags: Vec<Tag>,

    /// TOML file with retention, compression, ignore rules and tags.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub retention: RetentionArgs,

    #[command(flatten)]
    pub kopia: KopiaArgs,
}

impl BackupArgs {
    /// Combines flags, config file and the PostgreSQL environment.
    ///
    /// Flags take precedence over the config file.
    pub fn backup_run(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<BackupRun, ConfigError> {
        let file = match &self.config {
            Some(path) => BackupConfig::load(path)?,
            None => BackupConfig::default(),
        };

        let database = if self.postgres_backup {
            Some(config::backup_database(&lookup)?)
        } else {
            None
        };

        let mut tags = file.tags.clone();
        tags.extend(self.tags.iter().cloned());

        Ok(BackupRun {
            odoo: Odoo::new(&self.odoo_dir),
            database,
            dump_dir: self.postgres_backup_dir.clone(),
            cleanup: self.postgres_backup_cleanup,
            maintenance: self.kopia_maintenance,
            retention: RetentionOverrides::from(&self.retention).apply(file.retention),
            compression: self
                .kopia_compression
                .clone()
                .unwrap_or_else(|| file.compression.clone()),
            ignore: file.ignore_rules(),
            tags,
        })
    }
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Kopia snapshot ID to restore from (use `list` to find available IDs).
    pub snapshot: String,

    /// Enable PostgreSQL restore.
    #[arg(long)]
    pub postgres_restore: bool,

    /// Enable filestore restore.
    #[arg(long)]
    pub filestore_restore: bool,

    /// Local directory to restore the dump into.
    #[arg(long, default_value = DEFAULT_DUMP_DIR)]
    pub postgres_backup_dir: PathBuf,

    /// Keep the dump after the restore.
    #[arg(long = "no-postgres-backup-cleanup", action = ArgAction::SetFalse)]
    pub postgres_backup_cleanup: bool,

    /// Restore the database as this name (defaults to PGDATABASE).
    #[arg(long)]
    pub target_database: Option<String>,

    /// Original database name in the snapshot (detected from the dump if not provided).
    #[arg(long)]
    pub source_database: Option<String>,

    /// Location of the dump directory inside the snapshot.
    #[arg(long, default_value = DEFAULT_DUMP_SUBPATH)]
    pub dump_subpath: PathBuf,

    /// Base path of the Odoo data, the filestore lives under it.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub odoo_dir: PathBuf,

    /// Download the snapshot without restoring anything.
    #[arg(
        long,
        requires = "download_path",
        conflicts_with_all = ["postgres_restore", "filestore_restore"]
    )]
    pub download_only: bool,

    /// Directory to download the snapshot into.
    #[arg(long)]
    pub download_path: Option<PathBuf>,

    #[command(flatten)]
    pub kopia: KopiaArgs,

    /// Extra arguments for pg_restore (e.g. `-- --clean --if-exists`).
    #[arg(last = true)]
    pub pg_restore_args: Vec<String>,
}

impl RestoreArgs {
    pub fn request(&self) -> RestoreRequest {
        RestoreRequest {
            snapshot: self.snapshot.clone(),
            database: self.postgres_restore,
            filestore: self.filestore_restore,
            target_database: self.target_database.clone(),
            source_database: self.source_database.clone(),
            download: self
                .download_only
                .then(|| self.download_path.clone())
                .flatten(),
            odoo: Odoo::new(&self.odoo_dir),
            work_dir: self.postgres_backup_dir.clone(),
            dump_subpath: self.dump_subpath.clone(),
            cleanup: self.postgres_backup_cleanup,
            restore_args: self.pg_restore_args.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by tag, key:value (repeatable).
    #[arg(long = "tags")]
    pub tags: Vec<Tag>,

    /// Show snapshots from all users and hosts.
    #[arg(long)]
    pub all: bool,

    /// Limit the number of results.
    #[arg(long)]
    pub max_results: Option<usize>,

    /// Print JSON to stdout instead of a table.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub kopia: KopiaArgs,
}

impl ListArgs {
    pub fn query(&self) -> SnapshotQuery {
        SnapshotQuery {
            tags: self.tags.clone(),
            all_sources: self.all,
            source: None,
            max_results: self.max_results,
        }
    }

    pub fn format(&self) -> ListFormat {
        if self.json {
            ListFormat::Json
        } else {
            ListFormat::Table
        }
    }
}
