use std::fs;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use super::StepError;
use crate::backends::{Database, Repository, Snapshot, SnapshotReader};
use crate::config::{self, ConfigError, PG_CONNECTION};
use crate::error::ErrorKind;
use crate::odoo::{self, Odoo};
use crate::util::checksum::{self, Verification};

/// A restore as requested on the command line.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Snapshot identifier or a unique prefix of it.
    pub snapshot: String,
    pub database: bool,
    pub filestore: bool,
    /// Database to restore into, defaults to `PGDATABASE`.
    pub target_database: Option<String>,
    /// Database the snapshot was taken of, detected from the dump if unset.
    pub source_database: Option<String>,
    /// Only materialize the snapshot at this path.
    pub download: Option<PathBuf>,
    pub odoo: Odoo,
    /// Where the dump directory of the snapshot is restored to.
    pub work_dir: PathBuf,
    /// Location of the dump directory inside the snapshot.
    pub dump_subpath: PathBuf,
    pub cleanup: bool,
    /// Passed to the restore tool unchanged.
    pub restore_args: Vec<String>,
}

/// What a validated restore does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreAction {
    /// Materialize the whole snapshot, nothing else.
    Download(PathBuf),
    Apply {
        /// Restore the dump into this database.
        database: Option<String>,
        /// Restore the filestore.
        filestore: bool,
        /// Name of the restored filestore if not the source database.
        target: Option<String>,
        source: Option<String>,
    },
}

/// A restore that passed validation.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub snapshot: String,
    pub action: RestoreAction,
    pub odoo: Odoo,
    pub work_dir: PathBuf,
    pub dump_subpath: PathBuf,
    pub cleanup: bool,
    pub restore_args: Vec<String>,
}

impl RestoreRequest {
    /// Checks the request is complete without touching the repository.
    pub fn validate(self, lookup: impl Fn(&str) -> Option<String>) -> Result<RestorePlan, ConfigError> {
        let action = match self.download {
            Some(_) if self.database || self.filestore => return Err(ConfigError::DownloadWithApply),
            Some(destination) => RestoreAction::Download(destination),
            None if !self.database && !self.filestore => return Err(ConfigError::NothingToRestore),
            None => {
                let target = config::restore_target(self.target_database, &lookup).ok();
                let database = if self.database {
                    config::require_env(&PG_CONNECTION, &lookup)?;
                    Some(target.clone().ok_or(ConfigError::MissingTargetDatabase)?)
                } else if self.source_database.is_none() {
                    return Err(ConfigError::MissingSourceDatabase);
                } else {
                    None
                };
                RestoreAction::Apply {
                    database,
                    filestore: self.filestore,
                    target,
                    source: self.source_database,
                }
            }
        };

        Ok(RestorePlan {
            snapshot: self.snapshot,
            action,
            odoo: self.odoo,
            work_dir: self.work_dir,
            dump_subpath: self.dump_subpath,
            cleanup: self.cleanup,
            restore_args: self.restore_args,
        })
    }
}

/// Steps of a restore in the order they are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum RestoreStage {
    #[display("connecting")]
    Connecting,
    #[display("resolving the snapshot")]
    Resolving,
    #[display("downloading")]
    Downloading,
    #[display("fetching the dump")]
    Fetching,
    #[display("verifying the dump")]
    Verifying,
    #[display("restoring the database")]
    RestoringDatabase,
    #[display("restoring the filestore")]
    RestoringFilestore,
    #[display("cleaning up")]
    CleaningUp,
    #[display("done")]
    Done,
}

/// Parts of the running system a restore changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RestoreTarget {
    #[display("database")]
    Database,
    #[display("filestore")]
    Filestore,
}

#[derive(Debug)]
pub struct RestoreReport {
    pub snapshot: Snapshot,
    pub source_database: Option<String>,
    pub applied: Vec<RestoreTarget>,
}

/// A restore that stopped at `stage`.
#[derive(Debug, Display, Error)]
#[display("Restore failed while {stage}: {cause}")]
pub struct RestoreError {
    pub stage: RestoreStage,
    /// Targets already changed before the failure.
    pub applied: Vec<RestoreTarget>,
    /// Fetched dump artifacts left in the work directory.
    pub leftovers: Vec<PathBuf>,
    #[error(source)]
    pub cause: StepError,
}

impl RestoreError {
    pub fn kind(&self) -> ErrorKind {
        match self.cause.kind() {
            ErrorKind::Interrupted => ErrorKind::Interrupted,
            _ if !self.applied.is_empty() => ErrorKind::PartialState,
            kind => kind,
        }
    }
}

struct Progress {
    stage: RestoreStage,
    applied: Vec<RestoreTarget>,
    cleanup: bool,
    /// Dump artifacts this run put into the work directory.
    fetched: Vec<PathBuf>,
}

impl Progress {
    fn enter(&mut self, stage: RestoreStage) {
        log::debug!(target: "orchestrator::restore", "Entering stage: {stage}");
        self.stage = stage;
    }

    /// Removes the fetched artifacts (unless cleanup is disabled) and builds
    /// the error.
    fn fail(&mut self, cause: impl Into<StepError>) -> RestoreError {
        let fetched = std::mem::take(&mut self.fetched);
        let leftovers = if self.cleanup {
            checksum::remove_files(&fetched)
        } else {
            fetched.into_iter().filter(|path| path.exists()).collect()
        };
        if !leftovers.is_empty() {
            log::warn!(target: "orchestrator::restore", "Local artifacts left behind: {leftovers:?}");
        }

        RestoreError {
            stage: self.stage,
            applied: self.applied.clone(),
            leftovers,
            cause: cause.into(),
        }
    }
}

/// Restores from a snapshot over a read-only connection.
///
/// `database` is only used if the plan restores the database.
pub fn run_restore<R, D>(plan: &RestorePlan, repository: &R, database: &D) -> Result<RestoreReport, RestoreError>
where
    R: Repository,
    D: Database,
{
    let mut progress = Progress {
        stage: RestoreStage::Connecting,
        applied: Vec::new(),
        cleanup: plan.cleanup,
        fetched: Vec::new(),
    };

    let session = repository
        .connect_read_only()
        .map_err(|e| progress.fail(e))?;

    progress.enter(RestoreStage::Resolving);
    let snapshot = session
        .resolve_snapshot(&plan.snapshot)
        .map_err(|e| progress.fail(e))?;
    log::info!(
        target: "orchestrator::restore",
        "Using snapshot {} of {} from {}",
        snapshot.id,
        snapshot.source,
        snapshot.start_time
    );

    let (db_target, filestore, target, explicit_source) = match &plan.action {
        RestoreAction::Download(destination) => {
            progress.enter(RestoreStage::Downloading);
            session
                .download_snapshot(&snapshot.id, destination)
                .map_err(|e| progress.fail(e))?;
            log::info!(
                target: "orchestrator::restore",
                "Download-only mode: snapshot available at {}",
                destination.display()
            );
            progress.enter(RestoreStage::Done);
            return Ok(RestoreReport {
                snapshot,
                source_database: None,
                applied: Vec::new(),
            });
        }
        RestoreAction::Apply {
            database,
            filestore,
            target,
            source,
        } => (database, *filestore, target, source),
    };

    let mut source = explicit_source.clone();
    if let Some(db_target) = db_target {
        progress.enter(RestoreStage::Fetching);
        let (dump, detected) = fetch_dump(
            &session,
            plan,
            &snapshot.id,
            explicit_source.as_deref(),
            &mut progress.fetched,
        )
        .map_err(|e| progress.fail(e))?;
        source = Some(detected);

        progress.enter(RestoreStage::Verifying);
        let verified = checksum::verify_sidecar(&dump).map_err(|e| progress.fail(e))?;
        if let Verification::Verified(digest) = verified {
            log::debug!(target: "orchestrator::restore", "Dump digest: {digest}");
        }

        progress.enter(RestoreStage::RestoringDatabase);
        log::info!(target: "orchestrator::restore", "Restoring database dump to {db_target}...");
        database.wait_ready().map_err(|e| progress.fail(e))?;
        database
            .restore(&dump, db_target, &plan.restore_args)
            .map_err(|e| progress.fail(e))?;
        progress.applied.push(RestoreTarget::Database);
    }

    if filestore {
        progress.enter(RestoreStage::RestoringFilestore);
        let source = source
            .as_deref()
            .ok_or_else(|| progress.fail(ConfigError::MissingSourceDatabase))?;
        let filestore_target = target.as_deref().unwrap_or(source);
        let destination = plan.odoo.filestore(filestore_target);

        log::info!(
            target: "orchestrator::restore",
            "Restoring filestore from snapshot {} (source: {source}, target: {filestore_target})...",
            snapshot.id
        );
        let subpath = Path::new("filestore").join(source);
        session
            .restore_snapshot(&snapshot.id, Some(&subpath), &destination)
            .map_err(|e| progress.fail(e))?;
        progress.applied.push(RestoreTarget::Filestore);
        log::info!(target: "orchestrator::restore", "Filestore restore complete");
    }

    progress.enter(RestoreStage::CleaningUp);
    let fetched = std::mem::take(&mut progress.fetched);
    if plan.cleanup && !fetched.is_empty() {
        log::info!(target: "orchestrator::restore", "Cleaning up dump files {fetched:?}");
        let leftovers = checksum::remove_files(&fetched);
        if !leftovers.is_empty() {
            let mut err = progress.fail(StepError::Leftovers(leftovers.clone()));
            err.leftovers = leftovers;
            return Err(err);
        }
    } else if !fetched.is_empty() {
        log::info!(target: "orchestrator::restore", "Keeping dump files {fetched:?}");
    }

    progress.enter(RestoreStage::Done);
    log::info!(target: "orchestrator::restore", "Restore finished successfully.");
    Ok(RestoreReport {
        snapshot,
        source_database: source,
        applied: progress.applied,
    })
}

/// Restores the dump directory of the snapshot into the work directory.
///
/// Every dump artifact the restore adds to the work directory is recorded in
/// `fetched`, also when the restore fails. Returns the dump and the name of
/// the database it was taken of.
fn fetch_dump<S: SnapshotReader>(
    session: &S,
    plan: &RestorePlan,
    id: &str,
    source: Option<&str>,
    fetched: &mut Vec<PathBuf>,
) -> Result<(PathBuf, String), StepError> {
    log::info!(target: "orchestrator::restore", "Restoring database dump from snapshot {id}...");
    let present = dump_artifacts(&plan.work_dir);
    let restored = session.restore_snapshot(id, Some(&plan.dump_subpath), &plan.work_dir);
    fetched.extend(
        dump_artifacts(&plan.work_dir)
            .into_iter()
            .filter(|path| !present.contains(path)),
    );
    restored?;

    let source = match source {
        Some(source) => source.to_string(),
        None => odoo::detect_source_database(&plan.work_dir)?,
    };
    log::info!(target: "orchestrator::restore", "Source database: {source}");

    let dump = plan.work_dir.join(odoo::dump_file_name(&source));
    if !dump.is_file() {
        return Err(ConfigError::DumpNotFound(dump).into());
    }
    // overwritten by the restore, so they belong to this run as well
    for artifact in [dump.clone(), checksum::sidecar_path(&dump)] {
        if artifact.exists() && !fetched.contains(&artifact) {
            fetched.push(artifact);
        }
    }
    Ok((dump, source))
}

/// Dumps and sidecars directly inside `dir`.
fn dump_artifacts(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && odoo::is_dump_artifact(path))
        .collect()
}
