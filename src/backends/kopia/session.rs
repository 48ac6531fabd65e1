use std::fs;
use std::marker::PhantomData;
use std::path::Path;

use chrono::Local;

use super::{snapshot, Kopia};
use crate::backends::{
    RepositoryError, Snapshot, SnapshotPolicy, SnapshotQuery, SnapshotReader, SnapshotWriter, Tag,
};
use crate::util::process::{self, Stdout};
use crate::util::CancelToken;

mod sealed {
    pub trait Sealed {}
}

/// Connection mode of a [Session].
pub trait Mode: sealed::Sealed {
    const READ_ONLY: bool;
}

/// Connected with `--readonly`; only [SnapshotReader] is implemented.
#[derive(Debug)]
pub struct ReadOnly;

/// Connected for writing; also implements [SnapshotWriter].
#[derive(Debug)]
pub struct ReadWrite;

impl sealed::Sealed for ReadOnly {}
impl sealed::Sealed for ReadWrite {}

impl Mode for ReadOnly {
    const READ_ONLY: bool = true;
}

impl Mode for ReadWrite {
    const READ_ONLY: bool = false;
}

/// A connected repository.
///
/// The repository is disconnected when the session is dropped, also when
/// the run fails or is interrupted.
#[derive(Debug)]
pub struct Session<M: Mode> {
    kopia: Kopia,
    _mode: PhantomData<M>,
}

impl<M: Mode> Session<M> {
    pub(super) fn open(kopia: &Kopia) -> Result<Self, RepositoryError> {
        kopia.prepare_dirs()?;
        log::info!(
            target: "backend::kopia",
            "Attempting to connect to Kopia repository (using ephemeral config{})...",
            if M::READ_ONLY { ", read-only" } else { "" }
        );

        let mut connect = kopia.repository_command("connect");
        if M::READ_ONLY {
            connect.arg("--readonly");
        }

        match process::run(&mut connect, Stdout::Relay, &kopia.cancel) {
            Ok(_) => {}
            Err(e) if M::READ_ONLY || e.is_interrupted() => return Err(RepositoryError::Unreachable(e)),
            Err(connect_err) => {
                log::info!(
                    target: "backend::kopia",
                    "Failed to connect to Kopia repository or repository not initialized ({connect_err}). Attempting to create..."
                );
                let mut create = kopia.repository_command("create");
                create.arg("--description=Kopia repository for Kubernetes CronJob (ephemeral config)");
                if let Err(create_err) = process::run(&mut create, Stdout::Relay, &kopia.cancel) {
                    log::error!(target: "backend::kopia", "Creating the Kopia repository failed: {create_err}");
                    return Err(RepositoryError::Unreachable(connect_err));
                }
            }
        }

        Ok(Self {
            kopia: kopia.clone(),
            _mode: PhantomData,
        })
    }

    fn run(&self, command: &mut std::process::Command) -> Result<(), RepositoryError> {
        process::run(command, Stdout::Relay, &self.kopia.cancel)?;
        Ok(())
    }

    fn restore(&self, target: String, destination: &Path) -> Result<(), RepositoryError> {
        fs::create_dir_all(destination)?;

        let mut restore = self.kopia.command();
        restore
            .arg("snapshot")
            .arg("restore")
            .arg(target)
            .arg(destination);
        self.run(&mut restore)
    }
}

impl<M: Mode> Drop for Session<M> {
    fn drop(&mut self) {
        log::info!(target: "backend::kopia", "Disconnecting from Kopia repository...");

        let mut disconnect = self.kopia.command();
        disconnect.arg("repository").arg("disconnect");

        // a fresh token, so disconnecting still happens after an interrupt
        if let Err(e) = process::run(&mut disconnect, Stdout::Relay, &CancelToken::new()) {
            log::warn!(target: "backend::kopia", "Disconnecting from Kopia repository failed: {e}");
        }
    }
}

impl<M: Mode> SnapshotReader for Session<M> {
    fn list_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<Snapshot>, RepositoryError> {
        let mut list = self.kopia.command();
        list.arg("snapshot").arg("list").arg("--json");

        if query.all_sources {
            list.arg("--all");
        }
        for tag in &query.tags {
            list.arg(format!("--tags={tag}"));
        }
        if let Some(max) = query.max_results {
            list.arg(format!("--max-results={max}"));
        }
        if let Some(source) = &query.source {
            list.arg(source);
        }

        let output = process::run(&mut list, Stdout::Capture, &self.kopia.cancel)?;
        let snapshots = snapshot::parse_list(&output.stdout).map_err(RepositoryError::InvalidOutput)?;
        log::debug!(target: "backend::kopia", "Repository returned {} snapshot(s)", snapshots.len());

        Ok(query.select(snapshots))
    }

    fn restore_snapshot(
        &self,
        id: &str,
        subpath: Option<&Path>,
        destination: &Path,
    ) -> Result<(), RepositoryError> {
        let target = match subpath {
            Some(subpath) => format!("{id}/{}", subpath.display()),
            None => id.to_string(),
        };
        log::info!(target: "backend::kopia", "Restoring {target} to {}...", destination.display());
        self.restore(target, destination)
    }

    fn download_snapshot(&self, id: &str, destination: &Path) -> Result<(), RepositoryError> {
        log::info!(target: "backend::kopia", "Downloading snapshot {id} to {}...", destination.display());
        self.restore(id.to_string(), destination)
    }
}

impl SnapshotWriter for Session<ReadWrite> {
    fn configure(&self, policy: &SnapshotPolicy) -> Result<(), RepositoryError> {
        log::info!(target: "backend::kopia", "Setting Kopia snapshot policies");

        let mut global = self.kopia.command();
        global
            .arg("policy")
            .arg("set")
            .arg("--global")
            .arg(format!("--compression={}", policy.compression))
            .args(policy.ignore.iter().map(|rule| format!("--add-ignore={rule}")))
            .arg("--ignore-file-errors=true")
            .args(
                policy
                    .retention
                    .windows()
                    .into_iter()
                    .map(|(window, keep)| format!("--keep-{window}={keep}")),
            );
        self.run(&mut global)?;

        for dir in &policy.uncompressed {
            let mut uncompressed = self.kopia.command();
            uncompressed
                .arg("policy")
                .arg("set")
                .arg("--compression=none")
                .arg(dir);
            self.run(&mut uncompressed)?;
        }

        Ok(())
    }

    fn create_snapshot(&self, source: &Path, tags: &[Tag]) -> Result<Snapshot, RepositoryError> {
        log::info!(target: "backend::kopia", "Creating snapshot for source: {}...", source.display());

        let description = format!("Kubernetes Snapshot {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let mut create = self.kopia.command();
        create
            .arg("snapshot")
            .arg("create")
            .arg(source)
            .arg(format!("--description={description}"))
            .args(tags.iter().map(|tag| format!("--tags={tag}")))
            .arg("--json");

        let output = process::run(&mut create, Stdout::Capture, &self.kopia.cancel)?;
        let snapshot = match snapshot::parse_created(&output.stdout) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::debug!(
                    target: "backend::kopia",
                    "Snapshot create printed no manifest ({e}), looking up the newest snapshot of {}",
                    source.display()
                );
                let query = SnapshotQuery {
                    source: Some(source.to_path_buf()),
                    max_results: Some(1),
                    ..Default::default()
                };
                self.list_snapshots(&query)?
                    .into_iter()
                    .next()
                    .ok_or(RepositoryError::InvalidOutput(e))?
            }
        };

        log::info!(target: "backend::kopia", "Created snapshot {} of {}", snapshot.id, snapshot.source);
        Ok(snapshot)
    }

    fn apply_retention(&self, source: &Path) -> Result<(), RepositoryError> {
        log::info!(target: "backend::kopia", "Expiring snapshots of {}", source.display());
        let mut expire = self.kopia.command();
        expire.arg("snapshot").arg("expire").arg("--delete").arg(source);
        self.run(&mut expire)
    }

    fn maintenance(&self) -> Result<(), RepositoryError> {
        log::info!(target: "backend::kopia", "Running Kopia maintenance");
        let mut maintenance = self.kopia.command();
        maintenance.arg("maintenance").arg("run").arg("--full");
        self.run(&mut maintenance)?;

        log::info!(target: "backend::kopia", "Kopia content stats");
        let mut stats = self.kopia.command();
        stats.arg("content").arg("stats");
        self.run(&mut stats)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use super::*;
    use crate::backends::Repository;
    use crate::util::RetentionPolicy;

    /// Fake kopia appending its arguments to `calls` and answering `snapshot`
    /// subcommands with `list_json`.
    fn fake_kopia(dir: &Path, connect_exit: u8, list_json: &str) -> (Kopia, PathBuf) {
        let calls = dir.join("calls");
        let listing = dir.join("listing.json");
        fs::write(&listing, list_json).unwrap();

        let bin = dir.join("kopia");
        let script = format!(
            r#"#!/bin/sh
echo "$@" >> {calls}
case "$*" in
  *"repository connect"*) exit {connect_exit} ;;
  *"snapshot list"*|*"snapshot create"*) cat {listing} ;;
esac
exit 0
"#,
            calls = calls.display(),
            listing = listing.display(),
        );
        fs::write(&bin, script).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

        let kopia = Kopia::new(super::super::tests::settings(bin, dir), CancelToken::new());
        (kopia, calls)
    }

    fn calls(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| {
                // drop the common flags
                line.split_once("--no-progress ")
                    .map(|(_, rest)| rest.to_string())
                    .unwrap_or_else(|| line.to_string())
            })
            .collect()
    }

    const ONE: &str = r#"[{"id": "k1", "source": {"host": "odoo", "userName": "odoo", "path": "/var/lib/odoo"}, "startTime": "2025-03-01T00:00:00Z", "tags": {"tag:env": "prod"}}]"#;

    #[test]
    fn read_only_session_connects_readonly_and_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (kopia, log) = fake_kopia(dir.path(), 0, ONE);

        {
            let session = kopia.connect_read_only().unwrap();
            let snapshots = session.list_snapshots(&SnapshotQuery::default()).unwrap();
            assert_eq!(snapshots.len(), 1);
        }

        let calls = calls(&log);
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("repository connect"));
        assert!(calls[0].ends_with("--readonly"));
        assert_eq!(calls[1], "snapshot list --json");
        assert_eq!(calls[2], "repository disconnect");
    }

    #[test]
    fn read_only_connect_failure_is_unreachable_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let (kopia, log) = fake_kopia(dir.path(), 1, ONE);

        let err = kopia.connect_read_only().unwrap_err();
        assert!(matches!(err, RepositoryError::Unreachable(_)));

        let calls = calls(&log);
        assert_eq!(calls.len(), 1);
        assert!(!calls.iter().any(|call| call.starts_with("repository create")));
    }

    #[test]
    fn read_write_connect_falls_back_to_create() {
        let dir = tempfile::tempdir().unwrap();
        let (kopia, log) = fake_kopia(dir.path(), 1, ONE);

        drop(kopia.connect_read_write().unwrap());

        let calls = calls(&log);
        assert!(calls[0].starts_with("repository connect"));
        assert!(!calls[0].contains("--readonly"));
        assert!(calls[1].starts_with("repository create"));
        assert_eq!(calls.last().map(String::as_str), Some("repository disconnect"));
    }

    #[test]
    fn writer_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (kopia, log) = fake_kopia(dir.path(), 0, ONE);
        let source = Path::new("/var/lib/odoo");

        {
            let session = kopia.connect_read_write().unwrap();
            session
                .configure(&SnapshotPolicy {
                    compression: "s2-default".into(),
                    ignore: vec!["/sessions/*".into()],
                    uncompressed: vec![PathBuf::from("/var/lib/odoo/database-backup")],
                    retention: RetentionPolicy::default().effective(),
                })
                .unwrap();
            let created = session
                .create_snapshot(source, &["env:prod".parse().unwrap()])
                .unwrap();
            assert_eq!(created.id, "k1");
            session.apply_retention(source).unwrap();
            session.restore_snapshot("k1", Some(Path::new("filestore/prod")), &dir.path().join("fs")).unwrap();
        }

        let calls = calls(&log);
        assert_eq!(
            calls[1],
            "policy set --global --compression=s2-default --add-ignore=/sessions/* --ignore-file-errors=true \
             --keep-latest=42 --keep-hourly=0 --keep-daily=14 --keep-weekly=8 --keep-monthly=6 --keep-annual=2"
        );
        assert_eq!(
            calls[2],
            "policy set --compression=none /var/lib/odoo/database-backup"
        );
        assert!(calls[3].starts_with("snapshot create /var/lib/odoo --description=Kubernetes Snapshot "));
        assert!(calls[3].ends_with("--tags=env:prod --json"));
        assert_eq!(calls[4], "snapshot expire --delete /var/lib/odoo");
        assert_eq!(
            calls[5],
            format!("snapshot restore k1/filestore/prod {}", dir.path().join("fs").display())
        );
        assert!(dir.path().join("fs").is_dir());
        assert_eq!(calls[6], "repository disconnect");
    }
}
