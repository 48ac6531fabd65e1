//! SHA-256 sidecar files binding a dump artifact to its content.
//!
//! Sidecars use the `sha256sum` format (`<hex digest>  <file name>`) so they
//! can also be checked by hand with `sha256sum -c`.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use sha2::{Digest, Sha256};

/// Suffix appended to the artifact path to name its sidecar.
pub const SIDECAR_SUFFIX: &str = "sha256";

#[derive(Debug, Display, Error)]
pub enum ChecksumError {
    /// Reading the artifact or reading/writing the sidecar failed.
    #[display("Checksum I/O on {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The sidecar does not contain a SHA-256 digest.
    #[display("Checksum sidecar {} is malformed", _0.display())]
    MalformedSidecar(#[error(ignore)] PathBuf),
    /// The artifact does not match its recorded digest.
    #[display("Checksum mismatch for {}: expected {expected}, got {actual}", artifact.display())]
    Mismatch {
        #[error(ignore)]
        artifact: PathBuf,
        #[error(ignore)]
        expected: String,
        #[error(ignore)]
        actual: String,
    },
}

impl ChecksumError {
    /// The artifact can't be trusted, as opposed to an operational failure.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::MalformedSidecar(_) | Self::Mismatch { .. })
    }
}

/// Outcome of [verify_sidecar].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified(String),
    /// No sidecar exists next to the artifact.
    Unbound,
}

/// Path of the sidecar belonging to `artifact`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut path = artifact.as_os_str().to_owned();
    path.push(".");
    path.push(SIDECAR_SUFFIX);
    PathBuf::from(path)
}

/// Hex encoded SHA-256 of the file content.
pub fn digest(path: &Path) -> Result<String, ChecksumError> {
    let io_err = |source| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(io_err)?;

    Ok(hex::encode(hasher.finalize()))
}

/// Hashes `artifact` and writes the digest to its sidecar.
pub fn compute(artifact: &Path) -> Result<String, ChecksumError> {
    let digest = digest(artifact)?;

    let file_name = artifact
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = sidecar_path(artifact);
    fs::write(&sidecar, format!("{digest}  {file_name}\n")).map_err(|source| ChecksumError::Io {
        path: sidecar.clone(),
        source,
    })?;

    log::debug!(target: "checksum", "Wrote {} ({digest})", sidecar.display());
    Ok(digest)
}

/// Recomputes the digest of `artifact` and compares it to `expected`.
pub fn verify(artifact: &Path, expected: &str) -> Result<bool, ChecksumError> {
    Ok(digest(artifact)?.eq_ignore_ascii_case(expected.trim()))
}

/// Reads the digest recorded in the sidecar of `artifact`, if any.
pub fn read_sidecar(artifact: &Path) -> Result<Option<String>, ChecksumError> {
    let sidecar = sidecar_path(artifact);
    let content = match fs::read_to_string(&sidecar) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ChecksumError::Io { path: sidecar, source }),
    };

    let digest = content
        .split_whitespace()
        .next()
        .filter(|digest| digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| ChecksumError::MalformedSidecar(sidecar.clone()))?;

    Ok(Some(digest.to_ascii_lowercase()))
}

/// Verifies `artifact` against its sidecar.
///
/// A missing sidecar is not an error, artifacts captured before sidecars
/// were written have none.
pub fn verify_sidecar(artifact: &Path) -> Result<Verification, ChecksumError> {
    let Some(expected) = read_sidecar(artifact)? else {
        log::warn!(
            target: "checksum",
            "No checksum sidecar found for {}, skipping verification",
            artifact.display()
        );
        return Ok(Verification::Unbound);
    };

    log::info!(target: "checksum", "Verifying checksum of {}...", artifact.display());
    let actual = digest(artifact)?;
    if actual != expected {
        return Err(ChecksumError::Mismatch {
            artifact: artifact.to_path_buf(),
            expected,
            actual,
        });
    }

    log::info!(target: "checksum", "Checksum verification passed");
    Ok(Verification::Verified(actual))
}

/// Removes `artifact` and its sidecar, ignoring files that don't exist.
///
/// Returns the paths that could not be removed.
pub fn remove_with_sidecar(artifact: &Path) -> Vec<PathBuf> {
    remove_files(&[artifact.to_path_buf(), sidecar_path(artifact)])
}

/// Removes every file of `paths`, ignoring files that don't exist.
///
/// Returns the paths that could not be removed.
pub fn remove_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut leftovers = Vec::new();
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => log::debug!(target: "checksum", "Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!(target: "checksum", "Removing {} failed: {e}", path.display());
                leftovers.push(path.clone());
            }
        }
    }
    leftovers
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world\n")
    const HELLO: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    #[test]
    fn sidecar_is_named_after_artifact() {
        assert_eq!(
            sidecar_path(Path::new("/data/dump/db.dump")),
            PathBuf::from("/data/dump/db.dump.sha256")
        );
    }

    #[test]
    fn compute_writes_sha256sum_compatible_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("db.dump");
        fs::write(&artifact, "hello world\n").unwrap();

        let digest = compute(&artifact).unwrap();
        assert_eq!(digest, HELLO);

        let sidecar = fs::read_to_string(sidecar_path(&artifact)).unwrap();
        assert_eq!(sidecar, format!("{HELLO}  db.dump\n"));
    }

    #[test]
    fn verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("prod.dump");
        fs::write(&artifact, b"PGDMP\x01\x0e\x00payload").unwrap();

        let digest = compute(&artifact).unwrap();
        assert!(verify(&artifact, &digest).unwrap());
        assert!(verify(&artifact, &digest.to_uppercase()).unwrap());
        assert!(!verify(&artifact, HELLO).unwrap());
    }

    #[test]
    fn tampered_artifact_is_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("db.dump");
        fs::write(&artifact, "original").unwrap();
        compute(&artifact).unwrap();
        fs::write(&artifact, "tampered").unwrap();

        let err = verify_sidecar(&artifact).unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(matches!(err, ChecksumError::Mismatch { .. }));
    }

    #[test]
    fn malformed_sidecar_is_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("db.dump");
        fs::write(&artifact, "content").unwrap();
        fs::write(sidecar_path(&artifact), "not-a-digest  db.dump\n").unwrap();

        let err = verify_sidecar(&artifact).unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn missing_sidecar_is_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("db.dump");
        fs::write(&artifact, "content").unwrap();

        assert_eq!(verify_sidecar(&artifact).unwrap(), Verification::Unbound);
    }

    #[test]
    fn missing_artifact_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = digest(&dir.path().join("absent.dump")).unwrap_err();
        assert!(!err.is_integrity_failure());
    }

    #[test]
    fn remove_with_sidecar_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("db.dump");
        fs::write(&artifact, "content").unwrap();
        compute(&artifact).unwrap();

        assert!(remove_with_sidecar(&artifact).is_empty());
        assert!(!artifact.exists());
        assert!(!sidecar_path(&artifact).exists());
        assert!(remove_with_sidecar(&artifact).is_empty());
    }

    #[test]
    fn remove_files_reports_what_stays() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prod.dump");
        let not_a_file = dir.path().join("staging.dump");
        fs::write(&file, "x").unwrap();
        fs::create_dir(&not_a_file).unwrap();

        let leftovers = remove_files(&[file.clone(), not_a_file.clone(), dir.path().join("gone")]);
        assert_eq!(leftovers, [not_a_file]);
        assert!(!file.exists());
    }
}
