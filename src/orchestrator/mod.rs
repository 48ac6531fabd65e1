//! Sequencing of the backends into the `backup`, `restore` and `list` verbs.
//!
//! The orchestrators only see the [Repository](crate::backends::Repository)
//! and [Database](crate::backends::Database) traits, so every run is a
//! strictly linear sequence of steps that halts on the first failure.

use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error, From};

pub mod backup;
pub mod list;
pub mod restore;

pub use backup::{run_backup, BackupError, BackupReport, BackupRun, BackupStage};
pub use list::{list_snapshots, render, ListFormat};
pub use restore::{
    run_restore, RestoreAction, RestoreError, RestorePlan, RestoreReport, RestoreRequest,
    RestoreStage, RestoreTarget,
};

use crate::backends::{DatabaseError, RepositoryError};
use crate::config::ConfigError;
use crate::odoo::LayoutError;
use crate::util::checksum::ChecksumError;

/// Failure of a single step of a run.
#[derive(Debug, Display, Error, From)]
pub enum StepError {
    #[display("{_0}")]
    #[from]
    Config(ConfigError),
    #[display("{_0}")]
    #[from]
    Layout(LayoutError),
    #[display("{_0}")]
    #[from]
    Repository(RepositoryError),
    #[display("{_0}")]
    #[from]
    Database(DatabaseError),
    #[display("{_0}")]
    #[from]
    Checksum(ChecksumError),
    #[display("I/O on {} failed: {_1}", _0.display())]
    Io(#[error(not(source))] PathBuf, #[error(source)] io::Error),
    /// Local artifacts that should have been removed are still present.
    #[display("Could not remove {_0:?}")]
    Leftovers(#[error(ignore)] Vec<PathBuf>),
    /// Retention removed the snapshot created in the same run.
    #[display("Snapshot {_0} created in this run did not survive retention")]
    SnapshotPruned(#[error(ignore)] String),
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory [Repository] and [Database] recording every call.

    use std::cell::RefCell;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;

    use crate::backends::snapshot::tests::snapshot;
    use crate::backends::{
        Database, DatabaseError, Repository, RepositoryError, Snapshot, SnapshotPolicy,
        SnapshotQuery, SnapshotReader, SnapshotWriter, Tag,
    };
    use crate::util::process::ToolError;
    use crate::util::RetentionPolicy;

    fn tool_failure(program: &str) -> ToolError {
        use std::os::unix::process::ExitStatusExt;

        ToolError::Failed {
            program: program.to_string(),
            status: std::process::ExitStatus::from_raw(1 << 8),
            stderr: "fake failure".to_string(),
        }
    }

    /// Files below `root`, relative to it.
    pub(crate) fn files(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(root) {
                    found.push(relative.to_path_buf());
                }
            }
        }
        found.sort();
        found
    }

    #[derive(Debug, Default)]
    pub(crate) struct RepoState {
        pub calls: Vec<String>,
        pub snapshots: Vec<Snapshot>,
        /// Files present in the source when the last snapshot was created.
        pub captured: Vec<PathBuf>,
        /// Content of snapshots by path inside the snapshot, written on restore.
        pub content: Vec<(PathBuf, Vec<u8>)>,
        pub unreachable: bool,
        pub fail_create: bool,
        /// Retention ignores the keep-windows and removes everything.
        pub prune_everything: bool,
        /// Keep-windows set by the last `configure`.
        pub retention: Option<RetentionPolicy>,
        pub connected: usize,
    }

    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakeRepository(pub Rc<RefCell<RepoState>>);

    impl FakeRepository {
        pub fn with_snapshots(snapshots: Vec<Snapshot>) -> Self {
            let repo = Self::default();
            repo.0.borrow_mut().snapshots = snapshots;
            repo
        }

        /// Content returned when `path` (relative to the snapshot root) is restored.
        pub fn add_content(&self, path: &str, data: &[u8]) {
            self.0
                .borrow_mut()
                .content
                .push((PathBuf::from(path), data.to_vec()));
        }

        pub fn calls(&self) -> Vec<String> {
            self.0.borrow().calls.clone()
        }

        fn connect(&self, mode: &str) -> Result<FakeSession, RepositoryError> {
            let mut state = self.0.borrow_mut();
            state.calls.push(format!("connect {mode}"));
            if state.unreachable {
                return Err(RepositoryError::Unreachable(tool_failure("kopia")));
            }
            state.connected += 1;
            Ok(FakeSession(self.0.clone()))
        }
    }

    impl Repository for FakeRepository {
        type Reader = FakeSession;
        type Writer = FakeSession;

        fn connect_read_only(&self) -> Result<Self::Reader, RepositoryError> {
            self.connect("read-only")
        }

        fn connect_read_write(&self) -> Result<Self::Writer, RepositoryError> {
            self.connect("read-write")
        }
    }

    #[derive(Debug)]
    pub(crate) struct FakeSession(Rc<RefCell<RepoState>>);

    impl Drop for FakeSession {
        fn drop(&mut self) {
            let mut state = self.0.borrow_mut();
            state.calls.push("disconnect".to_string());
            state.connected -= 1;
        }
    }

    impl FakeSession {
        fn materialize(&self, prefix: &Path, destination: &Path) -> Result<(), RepositoryError> {
            fs::create_dir_all(destination)?;
            let state = self.0.borrow();
            for (path, data) in &state.content {
                if let Ok(relative) = path.strip_prefix(prefix) {
                    let target = destination.join(relative);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(target, data)?;
                }
            }
            Ok(())
        }
    }

    impl SnapshotReader for FakeSession {
        fn list_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<Snapshot>, RepositoryError> {
            let mut state = self.0.borrow_mut();
            state.calls.push("list".to_string());
            Ok(query.select(state.snapshots.clone()))
        }

        fn restore_snapshot(
            &self,
            id: &str,
            subpath: Option<&Path>,
            destination: &Path,
        ) -> Result<(), RepositoryError> {
            let subpath = subpath.unwrap_or(Path::new(""));
            self.0
                .borrow_mut()
                .calls
                .push(format!("restore {id}/{}", subpath.display()));
            self.materialize(subpath, destination)
        }

        fn download_snapshot(&self, id: &str, destination: &Path) -> Result<(), RepositoryError> {
            self.0.borrow_mut().calls.push(format!("download {id}"));
            self.materialize(Path::new(""), destination)
        }
    }

    impl SnapshotWriter for FakeSession {
        fn configure(&self, policy: &SnapshotPolicy) -> Result<(), RepositoryError> {
            let mut state = self.0.borrow_mut();
            state.calls.push(format!(
                "configure {} latest={}",
                policy.compression, policy.retention.latest
            ));
            state.retention = Some(policy.retention);
            Ok(())
        }

        fn create_snapshot(&self, source: &Path, tags: &[Tag]) -> Result<Snapshot, RepositoryError> {
            let mut state = self.0.borrow_mut();
            state.calls.push("create".to_string());
            if state.fail_create {
                return Err(RepositoryError::Command(tool_failure("kopia")));
            }
            state.captured = files(source);

            let tags: Vec<_> = tags.iter().map(|tag| (tag.key(), tag.value())).collect();
            let id = format!("k{}", state.snapshots.len() + 1);
            let mut created = snapshot(&id, state.snapshots.len() as u32 + 1, &tags);
            // recorded the way kopia does, resolved to an absolute path
            created.source.path = source.canonicalize().unwrap_or_else(|_| source.to_path_buf());
            state.snapshots.push(created.clone());
            Ok(created)
        }

        fn apply_retention(&self, source: &Path) -> Result<(), RepositoryError> {
            let mut state = self.0.borrow_mut();
            state.calls.push("retention".to_string());

            let latest = state.retention.as_ref().map_or(0, |policy| policy.latest);
            let keep = if state.prune_everything { 0 } else { latest as usize };
            let mut history = SnapshotQuery {
                source: Some(source.to_path_buf()),
                ..Default::default()
            }
            .select(state.snapshots.clone());
            history.truncate(keep);
            state
                .snapshots
                .retain(|snapshot| snapshot.source.path != source || history.contains(snapshot));
            Ok(())
        }

        fn maintenance(&self) -> Result<(), RepositoryError> {
            self.0.borrow_mut().calls.push("maintenance".to_string());
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct DbState {
        pub calls: Vec<String>,
        pub fail_dump: bool,
        pub fail_restore: bool,
    }

    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakeDatabase(pub Rc<RefCell<DbState>>);

    impl FakeDatabase {
        pub fn calls(&self) -> Vec<String> {
            self.0.borrow().calls.clone()
        }
    }

    impl Database for FakeDatabase {
        fn wait_ready(&self) -> Result<(), DatabaseError> {
            self.0.borrow_mut().calls.push("ready".to_string());
            Ok(())
        }

        fn dump(&self, database: &str, destination: &Path) -> Result<(), DatabaseError> {
            let mut state = self.0.borrow_mut();
            state.calls.push(format!("dump {database}"));
            if state.fail_dump {
                return Err(DatabaseError::Tool(tool_failure("pg_dump")));
            }
            fs::write(destination, b"PGDMP fake archive")?;
            Ok(())
        }

        fn restore(&self, dump: &Path, target: &str, extra_args: &[String]) -> Result<(), DatabaseError> {
            let mut state = self.0.borrow_mut();
            let name = dump.file_name().unwrap_or_default().to_string_lossy().into_owned();
            let mut call = format!("restore {name} into {target}");
            for arg in extra_args {
                call.push(' ');
                call.push_str(arg);
            }
            state.calls.push(call);
            if state.fail_restore {
                return Err(DatabaseError::Tool(tool_failure("pg_restore")));
            }
            Ok(())
        }
    }
}
