//! Classification of every failure into an [ErrorKind] and its exit code.

use std::io;

use derive_more::{Display, Error, From};

use crate::backends::{DatabaseError, RepositoryError};
use crate::config::ConfigError;
use crate::kube::ManifestError;
use crate::odoo::LayoutError;
use crate::orchestrator::{BackupError, RestoreError, StepError};
use crate::util::checksum::ChecksumError;
use crate::util::process::ToolError;

/// Categories of failure an operator has to react to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    /// Local filesystem failure.
    #[display("I/O failure")]
    Io,
    /// Invalid or incomplete configuration, nothing was changed.
    #[display("configuration error")]
    Configuration,
    #[display("external tool failure")]
    ExternalTool,
    #[display("repository unreachable")]
    RepositoryUnreachable,
    /// An artifact doesn't match its checksum.
    #[display("integrity failure")]
    Integrity,
    /// The run failed after it changed local or remote state.
    #[display("partial state")]
    PartialState,
    #[display("interrupted")]
    Interrupted,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Io => 1,
            Self::Configuration => 2,
            Self::ExternalTool => 3,
            Self::RepositoryUnreachable => 4,
            Self::Integrity => 5,
            Self::PartialState => 6,
            Self::Interrupted => 130,
        }
    }
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        if self.is_interrupted() {
            ErrorKind::Interrupted
        } else {
            ErrorKind::ExternalTool
        }
    }
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Layout(e) => e.kind(),
            _ => ErrorKind::Configuration,
        }
    }
}

impl LayoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(..) => ErrorKind::Io,
            _ => ErrorKind::Configuration,
        }
    }
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(e) if e.is_interrupted() => ErrorKind::Interrupted,
            Self::Unreachable(_) => ErrorKind::RepositoryUnreachable,
            Self::Command(e) => e.kind(),
            Self::InvalidOutput(_) => ErrorKind::ExternalTool,
            Self::SnapshotNotFound(_) | Self::AmbiguousSnapshot(_) => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Tool(e) => e.kind(),
            Self::NotReady(_) | Self::EmptyArtifact(_) | Self::TruncatedArtifact(_) => {
                ErrorKind::ExternalTool
            }
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl ChecksumError {
    pub fn kind(&self) -> ErrorKind {
        if self.is_integrity_failure() {
            ErrorKind::Integrity
        } else {
            ErrorKind::Io
        }
    }
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Layout(e) => e.kind(),
            Self::Repository(e) => e.kind(),
            Self::Database(e) => e.kind(),
            Self::Checksum(e) => e.kind(),
            Self::Io(..) | Self::Leftovers(_) => ErrorKind::Io,
            Self::SnapshotPruned(_) => ErrorKind::ExternalTool,
        }
    }
}

/// Any failure of a command.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    #[display("{_0}")]
    #[from]
    Config(ConfigError),
    #[display("{_0}")]
    #[from]
    Backup(BackupError),
    #[display("{_0}")]
    #[from]
    Restore(RestoreError),
    #[display("Listing snapshots failed: {_0}")]
    #[from]
    Repository(RepositoryError),
    #[display("{_0}")]
    #[from]
    Manifest(ManifestError),
    #[display("Writing to stdout failed: {_0}")]
    #[from]
    Output(io::Error),
    #[display("Installing the signal handler failed: {_0}")]
    #[from]
    Signal(ctrlc::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Backup(e) => e.kind(),
            Self::Restore(e) => e.kind(),
            Self::Repository(e) => e.kind(),
            Self::Manifest(_) => ErrorKind::Configuration,
            Self::Output(_) | Self::Signal(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::ExitStatus;

    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Io,
            ErrorKind::Configuration,
            ErrorKind::ExternalTool,
            ErrorKind::RepositoryUnreachable,
            ErrorKind::Integrity,
            ErrorKind::PartialState,
            ErrorKind::Interrupted,
        ];
        let codes: Vec<_> = kinds.iter().map(|kind| kind.exit_code()).collect();
        assert_eq!(codes, [1, 2, 3, 4, 5, 6, 130]);
    }

    #[test]
    fn interruption_wins_over_tool_failure() {
        let interrupted = ToolError::Interrupted {
            program: "pg_dump".into(),
        };
        assert_eq!(
            StepError::Database(DatabaseError::Tool(interrupted)).kind(),
            ErrorKind::Interrupted
        );

        let failed = ToolError::Failed {
            program: "kopia".into(),
            status: ExitStatus::from_raw(1 << 8),
            stderr: String::new(),
        };
        assert_eq!(
            RepositoryError::Unreachable(failed).kind(),
            ErrorKind::RepositoryUnreachable
        );
    }

    #[test]
    fn unknown_snapshot_is_configuration() {
        let err = StepError::Repository(RepositoryError::SnapshotNotFound("k1".into()));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn checksum_mismatch_is_integrity() {
        let err = ChecksumError::Mismatch {
            artifact: PathBuf::from("prod.dump"),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(StepError::from(err).kind(), ErrorKind::Integrity);
    }
}
