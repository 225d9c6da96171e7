//! Build drivers.
//!
//! The two build procedures are external collaborators: one produces the
//! installable wheel, the other the standalone CLI executable. Each reads the
//! build mode and build environment name from its process environment,
//! performs its build, and prints exactly one artifact path on stdout.
//!
//! The rig captures that path and validates it (existence, regular file, and
//! for the CLI the executable bit) before the next stage consumes it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ArtifactProblem, RigError, RigResult, StageName};
use crate::step::{self, StepSpec, DEFAULT_STEP_TIMEOUT};

/// Environment variable carrying the build mode, read by the build scripts.
pub const BUILD_MODE_VAR: &str = "RIG_BUILD_MODE";

/// Environment variable carrying the build environment name.
pub const BUILD_ENV_VAR: &str = "RIG_BUILD_ENV";

/// Default wheel build script, relative to the project root.
pub const DEFAULT_WHEEL_CMD: &str = "scripts/build_wheel.sh";

/// Default standalone CLI build script, relative to the project root.
pub const DEFAULT_CLI_CMD: &str = "scripts/build_standalone.sh";

// ============================================================================
// Configuration
// ============================================================================

/// Build mode passed to the build scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Debug,
    Release,
}

impl BuildMode {
    /// Wire value exported to the build scripts.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Debug => "debug",
            BuildMode::Release => "release",
        }
    }
}

/// Configuration for the build stage.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build mode; defaults to [`BuildMode::Debug`], `--release` selects
    /// [`BuildMode::Release`].
    pub mode: BuildMode,
    /// Build environment name exported to the scripts.
    pub env_name: String,
    /// Wheel build command.
    pub wheel_cmd: PathBuf,
    /// Standalone CLI build command.
    pub cli_cmd: PathBuf,
    /// Timeout applied to each build command.
    pub timeout: Duration,
}

impl BuildConfig {
    /// Debug-mode config with the default script locations under `root`.
    pub fn new(root: &Path, env_name: impl Into<String>) -> Self {
        BuildConfig {
            mode: BuildMode::Debug,
            env_name: env_name.into(),
            wheel_cmd: root.join(DEFAULT_WHEEL_CMD),
            cli_cmd: root.join(DEFAULT_CLI_CMD),
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Artifact paths produced by the build stage.
#[derive(Debug, Clone)]
pub struct BuildArtifacts {
    /// Installable wheel.
    pub wheel: PathBuf,
    /// Standalone CLI executable.
    pub cli: PathBuf,
}

// ============================================================================
// Drivers
// ============================================================================

/// Run the wheel build and capture the artifact path.
pub fn build_wheel(root: &Path, config: &BuildConfig) -> RigResult<PathBuf> {
    let path = drive(root, config, &config.wheel_cmd, StageName::Wheel)?;
    validate_artifact(StageName::Wheel, &path, false)?;
    Ok(path)
}

/// Run the standalone CLI build and capture the artifact path.
pub fn build_standalone_cli(root: &Path, config: &BuildConfig) -> RigResult<PathBuf> {
    let path = drive(root, config, &config.cli_cmd, StageName::StandaloneCli)?;
    validate_artifact(StageName::StandaloneCli, &path, true)?;
    Ok(path)
}

fn drive(root: &Path, config: &BuildConfig, cmd: &Path, stage: StageName) -> RigResult<PathBuf> {
    let spec = StepSpec::new(cmd)
        .cwd(root)
        .env(BUILD_MODE_VAR, config.mode.as_str())
        .env(BUILD_ENV_VAR, config.env_name.as_str())
        .timeout(config.timeout);

    let path = step::capture_path(&spec).map_err(|source| RigError::Stage { stage, source })?;

    // Scripts may print a path relative to the project root.
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(root.join(path))
    }
}

/// Validate a captured artifact path before the next stage trusts it.
fn validate_artifact(stage: StageName, path: &Path, require_executable: bool) -> RigResult<()> {
    let problem = if !path.exists() {
        Some(ArtifactProblem::Missing)
    } else if !path.is_file() {
        Some(ArtifactProblem::NotAFile)
    } else if require_executable && !is_executable(path) {
        Some(ArtifactProblem::NotExecutable)
    } else {
        None
    };

    match problem {
        Some(problem) => Err(RigError::InvalidArtifact {
            stage,
            path: path.to_path_buf(),
            problem,
        }),
        None => Ok(()),
    }
}

/// Check if a path is executable.
pub(crate) fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        path.exists()
    }
}

// ============================================================================
// Tests
// ============================================================================
