//! Snapshot repository backed by [Kopia](https://kopia.io).
//!
//! Every invocation uses an ephemeral kopia config file, so each run connects
//! on its own and disconnects when its [Session] is dropped.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use clap::ValueEnum;
use derive_more::Display;

mod session;
mod snapshot;

pub use session::{Mode, ReadOnly, ReadWrite, Session};

use crate::backends::{Repository, RepositoryError};
use crate::util::CancelToken;

/// Directory holding the ephemeral config, cache and logs by default.
pub const DEFAULT_ROOT: &str = "/tmp/kopia";

/// Log levels understood by kopia.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Display)]
pub enum KopiaLogLevel {
    #[display("error")]
    Error,
    #[display("warning")]
    Warning,
    #[default]
    #[display("info")]
    Info,
    #[display("debug")]
    Debug,
}

/// How to reach the repository and how to present ourselves to it.
#[derive(Debug, Clone)]
pub struct KopiaSettings {
    /// Path to the kopia binary.
    pub bin: PathBuf,
    /// Storage arguments of `kopia repository connect`, e.g. `azure --container=kopia`.
    pub connect_params: Vec<String>,
    pub cache_dir: PathBuf,
    /// Ephemeral repository config, removed again on disconnect.
    pub config_file: PathBuf,
    pub log_level: KopiaLogLevel,
    pub log_dir: PathBuf,
    /// Hostname the snapshots are recorded under.
    ///
    /// <div class="warning">
    /// Kopia groups snapshot history and retention by host, user and path.
    /// Changing the hostname or username between runs starts a new history.
    /// </div>
    pub hostname: String,
    /// Username the snapshots are recorded under. See [`hostname`](Self::hostname).
    pub username: String,
}

/// Handle to the kopia repository.
///
/// Nothing is executed until a session is connected.
#[derive(Debug, Clone)]
pub struct Kopia {
    settings: KopiaSettings,
    cancel: CancelToken,
}

impl Kopia {
    pub fn new(settings: KopiaSettings, cancel: CancelToken) -> Self {
        Self { settings, cancel }
    }

    pub fn settings(&self) -> &KopiaSettings {
        &self.settings
    }

    /// Kopia command with the flags every invocation shares.
    fn command(&self) -> Command {
        let KopiaSettings {
            bin,
            config_file,
            log_level,
            log_dir,
            ..
        } = &self.settings;

        let mut kopia = Command::new(bin);
        kopia
            .arg(format!("--config-file={}", config_file.display()))
            .arg(format!("--log-level={log_level}"))
            .arg(format!("--log-dir={}", log_dir.display()))
            .arg(format!("--file-log-level={log_level}"))
            .arg("--no-progress");
        kopia
    }

    /// `repository connect` or `repository create` with the storage parameters.
    fn repository_command(&self, verb: &str) -> Command {
        let KopiaSettings {
            connect_params,
            cache_dir,
            hostname,
            username,
            ..
        } = &self.settings;

        let mut kopia = self.command();
        kopia
            .arg("repository")
            .arg(verb)
            .arg(format!("--cache-directory={}", cache_dir.display()))
            .args(connect_params)
            .arg(format!("--override-hostname={hostname}"))
            .arg(format!("--override-username={username}"));
        kopia
    }

    fn prepare_dirs(&self) -> io::Result<()> {
        if let Some(parent) = self.settings.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.settings.cache_dir)?;
        fs::create_dir_all(&self.settings.log_dir)
    }
}

impl Repository for Kopia {
    type Reader = Session<ReadOnly>;
    type Writer = Session<ReadWrite>;

    fn connect_read_only(&self) -> Result<Self::Reader, RepositoryError> {
        Session::open(self)
    }

    fn connect_read_write(&self) -> Result<Self::Writer, RepositoryError> {
        Session::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn settings(bin: PathBuf, root: &std::path::Path) -> KopiaSettings {
        KopiaSettings {
            bin,
            connect_params: vec!["filesystem".into(), "--path=/repo".into()],
            cache_dir: root.join("cache"),
            config_file: root.join("config/repository.config"),
            log_level: KopiaLogLevel::Warning,
            log_dir: root.join("logs"),
            hostname: "odoo".into(),
            username: "odoo".into(),
        }
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn common_flags_precede_subcommand() {
        let kopia = Kopia::new(
            settings("/usr/local/bin/kopia".into(), std::path::Path::new("/tmp/kopia")),
            CancelToken::new(),
        );

        let command = kopia.repository_command("connect");
        assert_eq!(command.get_program(), "/usr/local/bin/kopia");
        assert_eq!(
            args(&command),
            [
                "--config-file=/tmp/kopia/config/repository.config",
                "--log-level=warning",
                "--log-dir=/tmp/kopia/logs",
                "--file-log-level=warning",
                "--no-progress",
                "repository",
                "connect",
                "--cache-directory=/tmp/kopia/cache",
                "filesystem",
                "--path=/repo",
                "--override-hostname=odoo",
                "--override-username=odoo",
            ]
        );
    }

    #[test]
    fn prepare_creates_ephemeral_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let kopia = Kopia::new(settings("kopia".into(), dir.path()), CancelToken::new());

        kopia.prepare_dirs().unwrap();
        assert!(dir.path().join("config").is_dir());
        assert!(dir.path().join("cache").is_dir());
        assert!(dir.path().join("logs").is_dir());
    }
}
