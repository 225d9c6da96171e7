//! Test staging.
//!
//! Tests must exercise the standalone executable the way an end user would:
//! from an arbitrary working directory, with no build-tree-relative paths in
//! reach. This module creates a uniquely named scratch directory under the
//! local temp-storage subtree, copies the executable into it, and hands the
//! test runner its absolute path via the `RIG_CLI_BIN` environment variable.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable the test suite reads to find the staged executable.
pub const CLI_ENV_VAR: &str = "RIG_CLI_BIN";

// ============================================================================
// Errors
// ============================================================================

/// Errors during test staging.
#[derive(Debug, Error)]
pub enum StagingError {
    /// Could not create a scratch directory.
    #[error("failed to create scratch directory under {}: {source}", .root.display())]
    CreateFailed {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not copy the executable into the scratch directory.
    #[error("failed to copy {} to {}: {source}", .from.display(), .to.display())]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// IO error during staging.
    #[error("staging IO error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Unique Run Names
// ============================================================================

/// Generate a unique u64 for scratch directory names.
///
/// Combines the current timestamp, process id, and an atomic counter, hashed
/// with SHA-256 for a well-distributed value. The counter keeps two calls in
/// the same nanosecond distinct.
fn unique_u64() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let pid = std::process::id();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update(pid.to_le_bytes());
    hasher.update(counter.to_le_bytes());

    let hash = hasher.finalize();
    u64::from_le_bytes(hash[..8].try_into().expect("hash is 32 bytes"))
}

/// Scratch directory name for one run, like `run_0123456789abcdef`.
fn run_dir_name() -> String {
    format!("run_{:016x}", unique_u64())
}

// ============================================================================
// Test Stage
// ============================================================================

/// A prepared scratch directory holding a copy of the standalone executable.
#[derive(Debug)]
pub struct TestStage {
    dir: PathBuf,
    cli_path: PathBuf,
}

impl TestStage {
    /// Create a fresh scratch directory and copy `cli_artifact` into it.
    ///
    /// The directory name is unique per run; `fs::create_dir` (not
    /// `create_dir_all`) guarantees no collision with a prior run survives
    /// silently. On Unix, `fs::copy` carries the executable bit over.
    pub fn prepare(scratch_root: &Path, cli_artifact: &Path) -> Result<TestStage, StagingError> {
        std::fs::create_dir_all(scratch_root).map_err(|source| StagingError::CreateFailed {
            root: scratch_root.to_path_buf(),
            source,
        })?;

        let dir = loop {
            let candidate = scratch_root.join(run_dir_name());
            match std::fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(dir = %candidate.display(), "scratch name collision, retrying");
                    continue;
                }
                Err(source) => {
                    return Err(StagingError::CreateFailed {
                        root: scratch_root.to_path_buf(),
                        source,
                    });
                }
            }
        };

        let file_name = cli_artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cli".into());
        let cli_path = dir.join(file_name);

        std::fs::copy(cli_artifact, &cli_path).map_err(|source| StagingError::CopyFailed {
            from: cli_artifact.to_path_buf(),
            to: cli_path.clone(),
            source,
        })?;

        info!(dir = %dir.display(), cli = %cli_path.display(), "staged standalone CLI");

        Ok(TestStage { dir, cli_path })
    }

    /// Absolute path of the scratch directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of the staged executable.
    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    /// Remove the scratch directory, or keep it when requested.
    pub fn cleanup(self, keep: bool) -> io::Result<()> {
        if keep {
            info!(dir = %self.dir.display(), "keeping scratch directory");
            return Ok(());
        }
        std::fs::remove_dir_all(&self.dir)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn write_artifact(dir: &Path) -> PathBuf {
        let path = dir.join("democli");
        std::fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn unique_u64_does_not_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(unique_u64()));
        }
    }

    #[test]
    fn run_dir_name_format() {
        let name = run_dir_name();
        assert!(name.starts_with("run_"), "name: {name}");
        assert_eq!(name.len(), 20); // "run_" + 16 hex digits
    }

    #[test]
    fn prepare_creates_one_unique_dir_per_run() {
        let temp = TempDir::new().unwrap();
        let scratch_root = temp.path().join("tmp");
        let artifact = write_artifact(temp.path());

        let first = TestStage::prepare(&scratch_root, &artifact).unwrap();
        let second = TestStage::prepare(&scratch_root, &artifact).unwrap();

        assert_ne!(first.dir(), second.dir());
        assert_eq!(std::fs::read_dir(&scratch_root).unwrap().count(), 2);
    }

    #[test]
    fn prepare_copies_executable() {
        let temp = TempDir::new().unwrap();
        let scratch_root = temp.path().join("tmp");
        let artifact = write_artifact(temp.path());

        let stage = TestStage::prepare(&scratch_root, &artifact).unwrap();

        assert!(stage.cli_path().is_file());
        assert!(stage.cli_path().starts_with(stage.dir()));
        assert_eq!(stage.cli_path().file_name().unwrap(), "democli");
        #[cfg(unix)]
        assert!(crate::build::is_executable(stage.cli_path()));
    }

    #[test]
    fn prepare_fails_on_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let scratch_root = temp.path().join("tmp");
        let err =
            TestStage::prepare(&scratch_root, &temp.path().join("ghost")).unwrap_err();
        assert!(matches!(err, StagingError::CopyFailed { .. }));
    }

    #[test]
    fn cleanup_removes_unless_kept() {
        let temp = TempDir::new().unwrap();
        let scratch_root = temp.path().join("tmp");
        let artifact = write_artifact(temp.path());

        let stage = TestStage::prepare(&scratch_root, &artifact).unwrap();
        let dir = stage.dir().to_path_buf();
        stage.cleanup(false).unwrap();
        assert!(!dir.exists());

        let stage = TestStage::prepare(&scratch_root, &artifact).unwrap();
        let dir = stage.dir().to_path_buf();
        stage.cleanup(true).unwrap();
        assert!(dir.exists());
    }
}
