use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::backends::{Database, DatabaseError};
use crate::util::process::{self, Stdout};
use crate::util::CancelToken;

/// First bytes of a `pg_dump --format=custom` archive.
const ARCHIVE_MAGIC: &[u8] = b"PGDMP";

const DEFAULT_READY_ATTEMPTS: u32 = 9;

/// Paths of the PostgreSQL client programs.
#[derive(Debug, Clone)]
pub struct PgTools {
    pub pg_dump: PathBuf,
    pub pg_restore: PathBuf,
    pub pg_isready: PathBuf,
}

impl Default for PgTools {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".into(),
            pg_restore: "pg_restore".into(),
            pg_isready: "pg_isready".into(),
        }
    }
}

/// Dump and restore using the PostgreSQL client programs.
///
/// Connection parameters are taken from the `PG*` environment variables by
/// the programs themselves and never appear on their command line.
#[derive(Debug, Clone)]
pub struct Postgres {
    tools: PgTools,
    ready_attempts: u32,
    cancel: CancelToken,
}

impl Postgres {
    pub fn new(cancel: CancelToken) -> Self {
        Self::with_tools(PgTools::default(), cancel)
    }

    pub fn with_tools(tools: PgTools, cancel: CancelToken) -> Self {
        Self {
            tools,
            ready_attempts: DEFAULT_READY_ATTEMPTS,
            cancel,
        }
    }

    pub fn ready_attempts(mut self, attempts: u32) -> Self {
        self.ready_attempts = attempts;
        self
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut path: OsString = destination.as_os_str().to_owned();
    path.push(".partial");
    PathBuf::from(path)
}

/// Rejects empty files and files that don't start like a custom-format archive.
fn check_archive(path: &Path) -> Result<(), DatabaseError> {
    if fs::metadata(path)?.len() == 0 {
        return Err(DatabaseError::EmptyArtifact(path.to_path_buf()));
    }

    let mut magic = Vec::with_capacity(ARCHIVE_MAGIC.len());
    File::open(path)?
        .take(ARCHIVE_MAGIC.len() as u64)
        .read_to_end(&mut magic)?;
    if magic != ARCHIVE_MAGIC {
        return Err(DatabaseError::TruncatedArtifact(path.to_path_buf()));
    }

    Ok(())
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!(target: "backend::postgres", "Removed partial dump {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(target: "backend::postgres", "Removing partial dump {} failed: {e}", path.display()),
    }
}

impl Database for Postgres {
    fn wait_ready(&self) -> Result<(), DatabaseError> {
        log::info!(target: "backend::postgres", "Checking PostgreSQL is ready...");

        for attempt in 1..=self.ready_attempts {
            match process::run(&mut Command::new(&self.tools.pg_isready), Stdout::Relay, &self.cancel) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_interrupted() => return Err(e.into()),
                Err(e) => {
                    log::info!(
                        target: "backend::postgres",
                        "PostgreSQL is not ready ({e}), attempt {attempt}. Retrying in {attempt} seconds..."
                    );
                    if attempt < self.ready_attempts && !self.cancel.sleep(Duration::from_secs(attempt.into())) {
                        return Err(process::ToolError::Interrupted {
                            program: self.tools.pg_isready.display().to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        Err(DatabaseError::NotReady(self.ready_attempts))
    }

    fn dump(&self, database: &str, destination: &Path) -> Result<(), DatabaseError> {
        log::info!(target: "backend::postgres", "Starting PostgreSQL backup of {database} to {}", destination.display());

        let partial = partial_path(destination);
        let mut pg_dump = Command::new(&self.tools.pg_dump);
        pg_dump
            .arg("--format=custom")
            .arg("--file")
            .arg(&partial)
            .arg("--verbose")
            .arg("--no-owner")
            .arg("--compress")
            .arg("1")
            .arg(database);

        let dumped = process::run(&mut pg_dump, Stdout::Relay, &self.cancel)
            .map_err(DatabaseError::from)
            .and_then(|_| check_archive(&partial));
        if let Err(e) = dumped {
            remove_partial(&partial);
            return Err(e);
        }

        if let Err(e) = fs::rename(&partial, destination) {
            remove_partial(&partial);
            return Err(e.into());
        }

        log::info!(target: "backend::postgres", "Finished PostgreSQL backup of {database}.");
        Ok(())
    }

    fn restore(&self, dump: &Path, target: &str, extra_args: &[String]) -> Result<(), DatabaseError> {
        log::info!(target: "backend::postgres", "Restoring database dump {} to {target}...", dump.display());

        let mut pg_restore = Command::new(&self.tools.pg_restore);
        pg_restore
            .arg(format!("--dbname={target}"))
            .arg("--verbose")
            .arg("--no-owner")
            .args(extra_args)
            .arg(dump);

        process::run(&mut pg_restore, Stdout::Relay, &self.cancel)?;

        log::info!(target: "backend::postgres", "Finished restore of {target}.");
        Ok(())
    }
}
