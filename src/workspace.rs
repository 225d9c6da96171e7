//! Project root detection.
//!
//! The rig must run from the project root: the directory containing the
//! manifest file (`pyproject.toml`). The preflight check here has no side
//! effects on success; on failure it produces a usage error and nothing else
//! in the pipeline runs.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Manifest file whose presence marks the project root.
pub const MANIFEST_FILE: &str = "pyproject.toml";

/// Errors that can occur during preflight.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The directory does not contain the manifest file.
    #[error("{MANIFEST_FILE} not found in {}\n\n\
             usage: rig [OPTIONS]\n  \
             run `rig` from the project root (the directory containing {MANIFEST_FILE}),\n  \
             or pass --project-root <DIR>", .dir.display())]
    ManifestNotFound { dir: PathBuf },

    /// The candidate directory could not be resolved at all.
    #[error("failed to resolve project root {}: {source}", .dir.display())]
    Resolve {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A validated project root.
///
/// All paths derived from it are absolute, so they stay valid regardless of
/// the working directory any child process runs with.
#[derive(Debug, Clone)]
pub struct ProjectRoot {
    root: PathBuf,
}

impl ProjectRoot {
    /// Validate `dir` as the project root.
    ///
    /// Checks for the manifest file; performs no writes.
    pub fn locate(dir: &Path) -> Result<ProjectRoot, WorkspaceError> {
        let root = dir.canonicalize().map_err(|source| WorkspaceError::Resolve {
            dir: dir.to_path_buf(),
            source,
        })?;

        if !root.join(MANIFEST_FILE).is_file() {
            return Err(WorkspaceError::ManifestNotFound { dir: root });
        }

        Ok(ProjectRoot { root })
    }

    /// Absolute path of the project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Absolute path of the test directory.
    ///
    /// Captured from the root rather than the process cwd so it remains valid
    /// after the test process is pointed at the scratch directory.
    pub fn tests_dir(&self) -> PathBuf {
        self.root.join("tests")
    }

    /// Directory for rig-managed state (`.rig`).
    pub fn rig_dir(&self) -> PathBuf {
        self.root.join(".rig")
    }

    /// Local temp-storage subtree for per-run scratch directories.
    pub fn scratch_root(&self) -> PathBuf {
        self.rig_dir().join("tmp")
    }
}

// ============================================================================
// Tests
// ============================================================================
