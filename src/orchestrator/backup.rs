use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use super::StepError;
use crate::backends::{Database, Repository, Snapshot, SnapshotPolicy, SnapshotQuery, SnapshotWriter, Tag};
use crate::error::ErrorKind;
use crate::odoo::{self, Odoo};
use crate::util::checksum;
use crate::util::RetentionPolicy;

/// Everything one backup invocation needs, constructed from the command line.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub odoo: Odoo,
    /// Database to dump, `None` disables the dump.
    pub database: Option<String>,
    /// Staging directory of the dump, inside the data directory.
    pub dump_dir: PathBuf,
    /// Remove dump and sidecar once the snapshot exists.
    pub cleanup: bool,
    pub maintenance: bool,
    pub retention: RetentionPolicy,
    pub compression: String,
    /// Ignore rules applied to the data directory.
    pub ignore: Vec<String>,
    pub tags: Vec<Tag>,
}

/// Steps of a backup in the order they are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum BackupStage {
    #[display("idle")]
    Idle,
    #[display("connecting")]
    Connecting,
    #[display("capturing the dump")]
    Capturing,
    #[display("checksumming")]
    Checksumming,
    #[display("snapshotting")]
    Snapshotting,
    #[display("cleaning up")]
    CleaningUp,
    #[display("pruning")]
    Pruning,
    #[display("maintaining")]
    Maintaining,
    #[display("done")]
    Done,
}

/// Outcome of a successful backup.
#[derive(Debug)]
pub struct BackupReport {
    pub snapshot: Snapshot,
    /// Dump captured into the snapshot.
    pub dump: Option<PathBuf>,
    /// Local artifacts deliberately kept.
    pub kept: Vec<PathBuf>,
}

/// A backup that stopped at `stage`.
#[derive(Debug, Display, Error)]
#[display("Backup failed while {stage}: {cause}")]
pub struct BackupError {
    pub stage: BackupStage,
    /// Whether a dump was written before the failure.
    pub captured: bool,
    /// Snapshot created before the failure.
    pub snapshot: Option<String>,
    /// Local artifacts left behind.
    pub leftovers: Vec<PathBuf>,
    #[error(source)]
    pub cause: StepError,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self.cause.kind() {
            ErrorKind::Interrupted => ErrorKind::Interrupted,
            _ if self.captured || self.snapshot.is_some() => ErrorKind::PartialState,
            kind => kind,
        }
    }
}

/// Tracks how far a run got, so failures report it.
struct Progress {
    stage: BackupStage,
    cleanup: bool,
    /// Dump written in this run and not yet cleaned up.
    pending_dump: Option<PathBuf>,
    captured: bool,
    snapshot: Option<String>,
}

impl Progress {
    fn enter(&mut self, stage: BackupStage) {
        log::debug!(target: "orchestrator::backup", "Entering stage: {stage}");
        self.stage = stage;
    }

    /// Removes the local artifacts of this run (unless cleanup is disabled)
    /// and builds the error.
    fn fail(&mut self, cause: impl Into<StepError>) -> BackupError {
        let leftovers = match self.pending_dump.take() {
            Some(dump) if self.cleanup => checksum::remove_with_sidecar(&dump),
            Some(dump) => [checksum::sidecar_path(&dump), dump]
                .into_iter()
                .filter(|path| path.exists())
                .collect(),
            None => Vec::new(),
        };
        if !leftovers.is_empty() {
            log::warn!(target: "orchestrator::backup", "Local artifacts left behind: {leftovers:?}");
        }

        BackupError {
            stage: self.stage,
            captured: self.captured,
            snapshot: self.snapshot.clone(),
            leftovers,
            cause: cause.into(),
        }
    }
}

/// Runs a backup: dump, checksum, snapshot, cleanup, retention, maintenance.
///
/// The repository is connected before anything is written, so an unreachable
/// repository fails the run before a dump is taken.
pub fn run_backup<R, D>(run: &BackupRun, repository: &R, database: &D) -> Result<BackupReport, BackupError>
where
    R: Repository,
    D: Database,
{
    let mut progress = Progress {
        stage: BackupStage::Idle,
        cleanup: run.cleanup,
        pending_dump: None,
        captured: false,
        snapshot: None,
    };
    let staging = match &run.database {
        Some(_) => Some(run.odoo.staging_dir(&run.dump_dir).map_err(|e| progress.fail(e))?),
        None => {
            log::info!(target: "orchestrator::backup", "PostgreSQL backup disabled");
            None
        }
    };
    let source = run.odoo.source_dir().map_err(|e| progress.fail(e))?;

    progress.enter(BackupStage::Connecting);
    let session = repository
        .connect_read_write()
        .map_err(|e| progress.fail(e))?;
    let policy = SnapshotPolicy {
        compression: run.compression.clone(),
        ignore: run.ignore.clone(),
        uncompressed: staging.iter().cloned().collect(),
        retention: run.retention.effective(),
    };
    session.configure(&policy).map_err(|e| progress.fail(e))?;

    let dump = match (&run.database, staging) {
        (Some(db), Some(staging)) => Some(capture(&mut progress, database, db, &staging)?),
        _ => None,
    };

    progress.enter(BackupStage::Snapshotting);
    let snapshot = session
        .create_snapshot(&source, &run.tags)
        .map_err(|e| progress.fail(e))?;
    progress.snapshot = Some(snapshot.id.clone());

    progress.enter(BackupStage::CleaningUp);
    let mut kept = Vec::new();
    if let Some(dump) = progress.pending_dump.take() {
        if run.cleanup {
            log::info!(target: "orchestrator::backup", "Cleaning up dump file {}", dump.display());
            let leftovers = checksum::remove_with_sidecar(&dump);
            if !leftovers.is_empty() {
                let mut err = progress.fail(StepError::Leftovers(leftovers.clone()));
                err.leftovers = leftovers;
                return Err(err);
            }
        } else {
            log::info!(target: "orchestrator::backup", "Keeping dump file {}", dump.display());
            kept = vec![checksum::sidecar_path(&dump), dump];
        }
    }

    progress.enter(BackupStage::Pruning);
    prune(&session, &source, &snapshot.id).map_err(|e| progress.fail(e))?;

    progress.enter(BackupStage::Maintaining);
    if run.maintenance {
        session.maintenance().map_err(|e| progress.fail(e))?;
    } else {
        log::info!(target: "orchestrator::backup", "Kopia maintenance disabled");
    }

    progress.enter(BackupStage::Done);
    log::info!(target: "orchestrator::backup", "Backup finished successfully: snapshot {}", snapshot.id);
    Ok(BackupReport {
        snapshot,
        dump,
        kept,
    })
}

/// Dumps `db` into the staging directory and binds it with a sidecar.
fn capture<D: Database>(
    progress: &mut Progress,
    database: &D,
    db: &str,
    staging: &Path,
) -> Result<PathBuf, BackupError> {
    progress.enter(BackupStage::Capturing);
    let dump = staging.join(odoo::dump_file_name(db));

    database.wait_ready().map_err(|e| progress.fail(e))?;
    database.dump(db, &dump).map_err(|e| progress.fail(e))?;
    progress.captured = true;
    progress.pending_dump = Some(dump.clone());

    progress.enter(BackupStage::Checksumming);
    checksum::compute(&dump).map_err(|e| progress.fail(e))?;
    Ok(dump)
}

/// Applies retention and makes sure the snapshot of this run survived it.
fn prune<S: SnapshotWriter>(session: &S, source: &Path, created: &str) -> Result<(), StepError> {
    session.apply_retention(source)?;

    let query = SnapshotQuery {
        source: Some(source.to_path_buf()),
        ..Default::default()
    };
    let history = session.list_snapshots(&query)?;
    if !history.iter().any(|snapshot| snapshot.id == created) {
        return Err(StepError::SnapshotPruned(created.to_string()));
    }
    log::info!(
        target: "orchestrator::backup",
        "{} snapshot(s) of {} retained",
        history.len(),
        source.display()
    );
    Ok(())
}
