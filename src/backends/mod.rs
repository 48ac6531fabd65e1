//! Backends wrapping the external tools the orchestrators drive.
//!
//! Currently the following backends are implemented:
//!
//! - [Postgres]: Dump and restore of the Odoo database with `pg_dump`/`pg_restore`.
//! - [Kopia]: Content-addressable snapshot repository holding the Odoo data directory.

use std::io;
use std::path::Path;

use derive_more::{Display, Error, From};

pub mod kopia;
pub mod postgres;
pub mod snapshot;

pub use kopia::Kopia;
pub use postgres::Postgres;
pub use snapshot::{Snapshot, SnapshotQuery, SnapshotSource, Tag};

use crate::util::process::ToolError;
use crate::util::RetentionPolicy;

/// Generic database dump/restore tool.
pub trait Database {
    /// Blocks until the database server accepts connections.
    fn wait_ready(&self) -> Result<(), DatabaseError>;

    /// Dumps `database` into exactly one file at `destination`.
    ///
    /// Temporary files of the dump tool are removed on success and failure.
    fn dump(&self, database: &str, destination: &Path) -> Result<(), DatabaseError>;

    /// Restores the dump at `dump` into the database `target`.
    ///
    /// `extra_args` are handed to the restore tool unchanged.
    fn restore(&self, dump: &Path, target: &str, extra_args: &[String]) -> Result<(), DatabaseError>;
}

/// Errors of a [Database] backend.
#[derive(Debug, Display, Error, From)]
pub enum DatabaseError {
    /// The server didn't accept connections in time.
    #[display("Database server not ready after {_0} attempts")]
    NotReady(#[error(ignore)] u32),
    /// The dump or restore tool failed.
    #[display("{_0}")]
    #[from]
    Tool(ToolError),
    /// The dump tool succeeded but left an empty file.
    #[display("Dump artifact {} is empty", _0.display())]
    EmptyArtifact(#[error(ignore)] std::path::PathBuf),
    /// The dump tool succeeded but the file is not a complete archive.
    #[display("Dump artifact {} is truncated or not a custom-format archive", _0.display())]
    TruncatedArtifact(#[error(ignore)] std::path::PathBuf),
    #[display("Database artifact I/O failed: {_0}")]
    #[from]
    Io(io::Error),
}

/// A snapshot repository that can be connected in two modes.
///
/// The read-only session type exposes no mutating operation, so restores and
/// listings can't change repository state.
pub trait Repository {
    type Reader: SnapshotReader;
    type Writer: SnapshotWriter;

    fn connect_read_only(&self) -> Result<Self::Reader, RepositoryError>;

    fn connect_read_write(&self) -> Result<Self::Writer, RepositoryError>;
}

/// Operations available on every connection.
pub trait SnapshotReader {
    /// Snapshots matching `query`, newest first.
    fn list_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<Snapshot>, RepositoryError>;

    /// Materializes `subpath` of the snapshot (or all of it) at `destination`
    /// to be applied to the running system.
    fn restore_snapshot(
        &self,
        id: &str,
        subpath: Option<&Path>,
        destination: &Path,
    ) -> Result<(), RepositoryError>;

    /// Materializes the whole snapshot at `destination` for inspection only.
    fn download_snapshot(&self, id: &str, destination: &Path) -> Result<(), RepositoryError>;

    /// Looks up a snapshot of any source by its identifier, its root object id
    /// or a unique prefix of either.
    fn resolve_snapshot(&self, id: &str) -> Result<Snapshot, RepositoryError> {
        let query = SnapshotQuery {
            all_sources: true,
            ..Default::default()
        };
        let mut candidates: Vec<_> = self
            .list_snapshots(&query)?
            .into_iter()
            .filter(|snapshot| snapshot.matches_id(id))
            .collect();

        if let Some(exact) = candidates.iter().position(|snapshot| snapshot.is_id(id)) {
            return Ok(candidates.swap_remove(exact));
        }
        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(RepositoryError::SnapshotNotFound(id.to_string())),
            _ => Err(RepositoryError::AmbiguousSnapshot(id.to_string())),
        }
    }
}

/// Options applied to snapshot creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Compression algorithm of the repository.
    pub compression: String,
    /// Glob patterns excluded from every snapshot.
    pub ignore: Vec<String>,
    /// Directories stored without compression (already compressed content).
    pub uncompressed: Vec<std::path::PathBuf>,
    /// Keep-windows, in effect for the snapshot creation already.
    pub retention: RetentionPolicy,
}

/// Operations only available on a read-write connection.
pub trait SnapshotWriter: SnapshotReader {
    /// Sets the policies used for subsequent snapshots, retention included.
    fn configure(&self, policy: &SnapshotPolicy) -> Result<(), RepositoryError>;

    /// Captures `source` in one pass.
    fn create_snapshot(&self, source: &Path, tags: &[Tag]) -> Result<Snapshot, RepositoryError>;

    /// Prunes the history of `source` outside of the keep-windows set by
    /// [configure](SnapshotWriter::configure).
    ///
    /// Must only be called after a snapshot was created in the same run.
    fn apply_retention(&self, source: &Path) -> Result<(), RepositoryError>;

    /// Compaction and garbage collection.
    fn maintenance(&self) -> Result<(), RepositoryError>;
}

/// Errors of a [Repository] backend.
#[derive(Debug, Display, Error)]
pub enum RepositoryError {
    /// Connecting to the repository failed.
    #[display("Repository unreachable: {_0}")]
    Unreachable(ToolError),
    /// A repository command failed.
    #[display("{_0}")]
    Command(ToolError),
    /// The repository answered with output that couldn't be understood.
    #[display("Unexpected repository output: {_0}")]
    InvalidOutput(serde_json::Error),
    #[display("Snapshot {_0} not found")]
    SnapshotNotFound(#[error(ignore)] String),
    #[display("Snapshot id {_0} is ambiguous, use the full id")]
    AmbiguousSnapshot(#[error(ignore)] String),
    #[display("Repository I/O failed: {_0}")]
    Io(io::Error),
}

impl From<ToolError> for RepositoryError {
    fn from(e: ToolError) -> Self {
        Self::Command(e)
    }
}

impl From<io::Error> for RepositoryError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
