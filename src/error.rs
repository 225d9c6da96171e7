//! Unified error type and exit-code mapping.
//!
//! Per-module errors (workspace, venv, step, staging) are bridged into
//! `RigError`, the single type the binary renders and maps to a process exit
//! code:
//!
//! - `2`: precondition failure (wrong directory, bad arguments)
//! - child's own exit code: a failing external stage or test suite
//! - `10`: internal errors (IO, unexpected state)
//! - `1`: everything else

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::staging::StagingError;
use crate::step::StepError;
use crate::venv::VenvError;
use crate::workspace::WorkspaceError;

// ============================================================================
// Stage Names
// ============================================================================

/// External pipeline stages, for error and log attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    Wheel,
    StandaloneCli,
    Install,
    Tests,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageName::Wheel => write!(f, "wheel build"),
            StageName::StandaloneCli => write!(f, "standalone CLI build"),
            StageName::Install => write!(f, "package install"),
            StageName::Tests => write!(f, "test run"),
        }
    }
}

/// What is wrong with a captured build artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactProblem {
    Missing,
    NotAFile,
    NotExecutable,
}

impl fmt::Display for ArtifactProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactProblem::Missing => write!(f, "does not exist"),
            ArtifactProblem::NotAFile => write!(f, "is not a regular file"),
            ArtifactProblem::NotExecutable => write!(f, "is not executable"),
        }
    }
}

// ============================================================================
// Unified Error Type
// ============================================================================

/// Unified error type for the whole pipeline.
#[derive(Debug, Error)]
pub enum RigError {
    /// Preflight failure: not a project root.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Environment provisioning or activation failure.
    #[error(transparent)]
    Venv(#[from] VenvError),

    /// An external stage failed.
    #[error("{stage} failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: StepError,
    },

    /// A captured artifact path did not validate.
    #[error("{stage}: artifact {} {problem}", .path.display())]
    InvalidArtifact {
        stage: StageName,
        path: PathBuf,
        problem: ArtifactProblem,
    },

    /// Test staging failure.
    #[error(transparent)]
    Staging(#[from] StagingError),

    /// The test suite ran and failed.
    #[error("test suite failed with exit code {exit_code}")]
    TestsFailed { exit_code: i32 },

    /// IO error outside any specific stage.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RigError {
    /// Map the error to a process exit code.
    ///
    /// Failing external commands propagate their own exit status where known,
    /// so calling automation sees the same code the stage produced.
    pub fn exit_code(&self) -> i32 {
        match self {
            RigError::Workspace(_) => 2,
            RigError::Stage { source, .. } => source.child_exit_code().unwrap_or(1),
            RigError::TestsFailed { exit_code } => *exit_code,
            RigError::Io(_) => 10,
            _ => 1,
        }
    }
}

/// Result type for pipeline operations.
pub type RigResult<T> = Result<T, RigError>;

// ============================================================================
// Tests
// ============================================================================
