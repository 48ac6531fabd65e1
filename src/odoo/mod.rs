//! Layout of an Odoo data directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use derive_more::{Display, Error};
use regex::Regex;

use crate::util::checksum;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/odoo";
pub const DEFAULT_DUMP_DIR: &str = "/var/lib/odoo/database-backup";
/// Location of the dump directory inside a snapshot of the data directory.
pub const DEFAULT_DUMP_SUBPATH: &str = "database-backup";

const FILESTORE_DIR: &str = "filestore";
const SESSIONS_DIR: &str = "sessions";
const DUMP_EXTENSION: &str = "dump";

static DUMP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<db>[^/]+)\.dump$").expect("dump name regex is valid"));

#[derive(Debug, Display, Error)]
pub enum LayoutError {
    /// The dump would not be part of the snapshot.
    #[display(
        "Dump directory {} is not inside the backup source {}. The dump directory must be inside the source and on ephemeral storage",
        dump_dir.display(),
        data_dir.display()
    )]
    DumpDirOutsideSource {
        #[error(ignore)]
        dump_dir: PathBuf,
        #[error(ignore)]
        data_dir: PathBuf,
    },
    /// No dump to detect the source database from.
    #[display("No .dump files found in {}", _0.display())]
    NoDump(#[error(ignore)] PathBuf),
    /// More than one dump, the source database is ambiguous.
    #[display("Multiple .dump files found in {}: {_1:?}. Use --source-database to specify which one", _0.display())]
    AmbiguousDump(#[error(ignore)] PathBuf, #[error(ignore)] Vec<String>),
    #[display("Inspecting {} failed: {_1}", _0.display())]
    Io(#[error(not(source))] PathBuf, #[error(source)] io::Error),
}

/// An Odoo data directory holding filestore, sessions and the dump directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Odoo {
    data_dir: PathBuf,
}

impl Default for Odoo {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

impl Odoo {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.as_path()
    }

    /// The data directory as an absolute path without symlinks, the way the
    /// repository records the snapshot source.
    pub fn source_dir(&self) -> Result<PathBuf, LayoutError> {
        self.data_dir
            .canonicalize()
            .map_err(|e| LayoutError::Io(self.data_dir.clone(), e))
    }

    /// Filestore of `database`.
    pub fn filestore(&self, database: &str) -> PathBuf {
        self.data_dir.join(FILESTORE_DIR).join(database)
    }

    /// Ignore rule excluding the HTTP sessions from snapshots.
    pub fn sessions_ignore_rule() -> String {
        format!("/{SESSIONS_DIR}/*")
    }

    /// Creates `dump_dir` and checks it lies inside the data directory.
    ///
    /// Returns the canonical dump directory.
    pub fn staging_dir(&self, dump_dir: &Path) -> Result<PathBuf, LayoutError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |e: io::Error| LayoutError::Io(path, e)
        };

        fs::create_dir_all(dump_dir).map_err(io_err(dump_dir))?;
        let dump_dir = dump_dir.canonicalize().map_err(io_err(dump_dir))?;
        let data_dir = self.source_dir()?;

        if !dump_dir.starts_with(&data_dir) {
            return Err(LayoutError::DumpDirOutsideSource { dump_dir, data_dir });
        }
        Ok(dump_dir)
    }
}

/// File name of the dump of `database`.
pub fn dump_file_name(database: &str) -> String {
    format!("{database}.{DUMP_EXTENSION}")
}

/// Whether `path` names a dump or the checksum sidecar of one.
pub fn is_dump_artifact(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy()) else {
        return false;
    };
    let name = name
        .strip_suffix(&format!(".{}", checksum::SIDECAR_SUFFIX))
        .unwrap_or(&name);
    DUMP_NAME_RE.is_match(name)
}

/// Detects the source database from the single `<database>.dump` in `dir`.
///
/// Fails if there is no or more than one candidate rather than guessing.
pub fn detect_source_database(dir: &Path) -> Result<String, LayoutError> {
    let entries = fs::read_dir(dir).map_err(|e| LayoutError::Io(dir.to_path_buf(), e))?;

    let mut databases = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LayoutError::Io(dir.to_path_buf(), e))?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(captures) = DUMP_NAME_RE.captures(&name.to_string_lossy()) {
            databases.push(captures["db"].to_string());
        }
    }
    databases.sort();

    match databases.len() {
        0 => Err(LayoutError::NoDump(dir.to_path_buf())),
        1 => Ok(databases.remove(0)),
        _ => Err(LayoutError::AmbiguousDump(dir.to_path_buf(), databases)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filestore_is_per_database() {
        let odoo = Odoo::default();
        assert_eq!(
            odoo.filestore("prod"),
            PathBuf::from("/var/lib/odoo/filestore/prod")
        );
        assert_eq!(dump_file_name("prod"), "prod.dump");
    }

    #[test]
    fn staging_dir_inside_source() {
        let dir = tempfile::tempdir().unwrap();
        let odoo = Odoo::new(dir.path());

        let staging = odoo.staging_dir(&dir.path().join("database-backup")).unwrap();
        assert!(staging.is_dir());
        assert!(staging.ends_with("database-backup"));
    }

    #[test]
    fn staging_dir_outside_source_is_rejected() {
        let source = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let odoo = Odoo::new(source.path());

        let err = odoo.staging_dir(&elsewhere.path().join("dump")).unwrap_err();
        assert!(matches!(err, LayoutError::DumpDirOutsideSource { .. }));
    }

    #[test]
    fn staging_dir_escaping_with_dotdot_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("odoo");
        fs::create_dir(&source).unwrap();
        let odoo = Odoo::new(&source);

        let err = odoo.staging_dir(&source.join("../dump")).unwrap_err();
        assert!(matches!(err, LayoutError::DumpDirOutsideSource { .. }));
    }

    #[test]
    fn detects_single_dump() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prod.dump"), "PGDMP").unwrap();
        fs::write(dir.path().join("prod.dump.sha256"), "abc  prod.dump\n").unwrap();

        assert_eq!(detect_source_database(dir.path()).unwrap(), "prod");
    }

    #[test]
    fn detection_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            detect_source_database(dir.path()),
            Err(LayoutError::NoDump(_))
        ));

        fs::write(dir.path().join("prod.dump"), "PGDMP").unwrap();
        fs::write(dir.path().join("staging.dump"), "PGDMP").unwrap();
        match detect_source_database(dir.path()) {
            Err(LayoutError::AmbiguousDump(_, candidates)) => {
                assert_eq!(candidates, ["prod", "staging"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dump_artifacts_include_sidecars() {
        assert!(is_dump_artifact(Path::new("/work/prod.dump")));
        assert!(is_dump_artifact(Path::new("/work/prod.dump.sha256")));
        assert!(!is_dump_artifact(Path::new("/work/prod.dump.partial")));
        assert!(!is_dump_artifact(Path::new("/work/notes.txt")));
    }

    #[test]
    fn source_dir_resolves_dot_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("odoo")).unwrap();

        let odoo = Odoo::new(dir.path().join("odoo/../odoo"));
        assert_eq!(
            odoo.source_dir().unwrap(),
            dir.path().join("odoo").canonicalize().unwrap()
        );
        assert!(matches!(
            Odoo::new(dir.path().join("absent")).source_dir(),
            Err(LayoutError::Io(..))
        ));
    }
}
