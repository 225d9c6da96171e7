//! Test runner invocation.
//!
//! Runs pytest from the provisioned environment against the absolute test
//! directory, with the scratch directory as the child's working directory so
//! relative-path assumptions in the suite resolve against it rather than the
//! project tree. The orchestrator's own working directory never changes.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::build::is_executable;
use crate::error::{ArtifactProblem, RigError, RigResult, StageName};
use crate::staging::{TestStage, CLI_ENV_VAR};
use crate::step::{self, StepSpec};
use crate::venv::Venv;

/// Default pytest worker count.
pub const DEFAULT_TEST_JOBS: u32 = 4;

/// Configuration for the test run.
#[derive(Debug, Clone)]
pub struct TestRunConfig {
    /// Worker count passed to pytest's `-n`.
    pub jobs: u32,
    /// Pass `-v` for verbose output.
    pub verbose: bool,
    /// Timeout for the whole suite.
    pub timeout: Duration,
}

impl Default for TestRunConfig {
    fn default() -> Self {
        TestRunConfig {
            jobs: DEFAULT_TEST_JOBS,
            verbose: true,
            timeout: Duration::from_secs(3600),
        }
    }
}

#[cfg(windows)]
const PYTEST_NAME: &str = "pytest.exe";

#[cfg(not(windows))]
const PYTEST_NAME: &str = "pytest";

/// Invoke the test suite.
///
/// The staged executable must still exist and be executable at this point;
/// that invariant is re-checked here because the suite reads `RIG_CLI_BIN`
/// blindly and would otherwise fail with a far less useful error.
pub fn run_tests(
    venv: &Venv,
    stage: &TestStage,
    tests_dir: &Path,
    config: &TestRunConfig,
) -> RigResult<()> {
    let cli = stage.cli_path();
    if !cli.is_file() {
        return Err(RigError::InvalidArtifact {
            stage: StageName::Tests,
            path: cli.to_path_buf(),
            problem: ArtifactProblem::Missing,
        });
    }
    if !is_executable(cli) {
        return Err(RigError::InvalidArtifact {
            stage: StageName::Tests,
            path: cli.to_path_buf(),
            problem: ArtifactProblem::NotExecutable,
        });
    }

    let mut spec = StepSpec::new(venv.bin_dir().join(PYTEST_NAME))
        .arg("-n")
        .arg(config.jobs.to_string())
        .cwd(stage.dir())
        .env(CLI_ENV_VAR, cli)
        .timeout(config.timeout);

    if config.verbose {
        spec = spec.arg("-v");
    }
    spec = spec.arg(tests_dir);

    for (key, value) in venv.activation_env() {
        spec = spec.env(key, value);
    }

    info!(tests = %tests_dir.display(), jobs = config.jobs, "running test suite");

    match step::run_streamed(&spec) {
        Ok(duration) => {
            info!(?duration, "test suite passed");
            Ok(())
        }
        Err(source) => match source.child_exit_code() {
            Some(exit_code) => Err(RigError::TestsFailed { exit_code }),
            None => Err(RigError::Stage {
                stage: StageName::Tests,
                source,
            }),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
