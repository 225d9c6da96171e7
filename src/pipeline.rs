//! Pipeline orchestration.
//!
//! One linear run per invocation: preflight, provision, build, install,
//! stage, test. Stages communicate through a typed [`RunContext`] and typed
//! results instead of ambient process state; the first failing stage aborts
//! the run and its error carries the exit status to propagate.
//!
//! A JSON run report is written to `.rig/last_run.json` at the end of every
//! run (best effort, success or failure).

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::build::{self, BuildConfig, BuildMode};
use crate::error::{RigError, RigResult};
use crate::install;
use crate::runner::{self, TestRunConfig, DEFAULT_TEST_JOBS};
use crate::staging::TestStage;
use crate::venv::{self, DependencyProfile};
use crate::workspace::ProjectRoot;

/// File the run report is written to, under `.rig`.
pub const REPORT_FILE: &str = "last_run.json";

// ============================================================================
// Options and Context
// ============================================================================

/// Caller-facing options, straight from the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Project root; defaults to the current directory.
    pub project_root: Option<PathBuf>,
    /// Name of the build environment.
    pub env_name: String,
    /// Dependency profile installed into a fresh environment.
    pub profile: DependencyProfile,
    /// pytest worker count.
    pub jobs: u32,
    /// Override for the wheel build command.
    pub wheel_cmd: Option<PathBuf>,
    /// Override for the standalone CLI build command.
    pub cli_cmd: Option<PathBuf>,
    /// Build in release mode instead of the default debug mode.
    pub release: bool,
    /// Keep the scratch directory after a successful run.
    pub keep_scratch: bool,
    /// Recreate the environment even if a valid one exists.
    pub recreate_env: bool,
    /// Stop after staging, without invoking the test runner.
    pub skip_tests: bool,
    /// Timeout applied to each external stage.
    pub stage_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            project_root: None,
            env_name: "dev".to_string(),
            profile: DependencyProfile::Dev,
            jobs: DEFAULT_TEST_JOBS,
            wheel_cmd: None,
            cli_cmd: None,
            release: false,
            keep_scratch: false,
            recreate_env: false,
            skip_tests: false,
            stage_timeout: Duration::from_secs(1800),
        }
    }
}

/// Validated, fully resolved configuration for one run.
#[derive(Debug)]
pub struct RunContext {
    root: ProjectRoot,
    build: BuildConfig,
    test: TestRunConfig,
    profile: DependencyProfile,
    keep_scratch: bool,
    recreate_env: bool,
    skip_tests: bool,
}

impl RunContext {
    /// Preflight the project root and resolve all configuration.
    ///
    /// This is the only branch in the pipeline: a directory without the
    /// manifest file fails here, before any side effect.
    pub fn new(options: RunOptions) -> RigResult<RunContext> {
        let dir = match options.project_root {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let root = ProjectRoot::locate(&dir)?;

        let mut build = BuildConfig::new(root.root(), options.env_name);
        build.timeout = options.stage_timeout;
        if options.release {
            build.mode = BuildMode::Release;
        }
        if let Some(cmd) = options.wheel_cmd {
            build.wheel_cmd = cmd;
        }
        if let Some(cmd) = options.cli_cmd {
            build.cli_cmd = cmd;
        }

        let test = TestRunConfig {
            jobs: options.jobs,
            verbose: true,
            timeout: options.stage_timeout,
        };

        Ok(RunContext {
            root,
            build,
            test,
            profile: options.profile,
            keep_scratch: options.keep_scratch,
            recreate_env: options.recreate_env,
            skip_tests: options.skip_tests,
        })
    }

    /// The validated project root.
    pub fn root(&self) -> &ProjectRoot {
        &self.root
    }
}

// ============================================================================
// Run Report
// ============================================================================

/// Timing for one completed (or failed) stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub name: String,
    pub secs: f64,
}

/// Summary of one run, persisted as `.rig/last_run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wheel: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    pub stages: Vec<StageTiming>,
}

impl RunReport {
    fn started_now() -> Self {
        RunReport {
            status: "running".to_string(),
            failed_stage: None,
            started_at: format_timestamp(SystemTime::now()),
            finished_at: String::new(),
            wheel: None,
            cli: None,
            scratch_dir: None,
            stages: Vec::new(),
        }
    }

    fn write(&self, rig_dir: &std::path::Path) -> std::io::Result<()> {
        std::fs::create_dir_all(rig_dir)?;
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(rig_dir.join(REPORT_FILE), content)
    }
}

/// Format a timestamp for the report (ISO 8601).
fn format_timestamp(time: SystemTime) -> String {
    use chrono::{DateTime, Utc};

    let datetime: DateTime<Utc> = time.into();
    datetime.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ============================================================================
// Orchestration
// ============================================================================

/// Execute the whole pipeline.
pub fn run(ctx: &RunContext) -> Result<RunReport, RigError> {
    let mut report = RunReport::started_now();
    let outcome = execute(ctx, &mut report);

    report.status = match &outcome {
        Ok(()) => "ok".to_string(),
        Err(_) => "failed".to_string(),
    };
    report.finished_at = format_timestamp(SystemTime::now());

    if let Err(e) = report.write(&ctx.root.rig_dir()) {
        debug!(error = %e, "could not write run report");
    }

    outcome.map(|()| report)
}

fn execute(ctx: &RunContext, report: &mut RunReport) -> RigResult<()> {
    // Captured before any staging so it stays valid regardless of where the
    // test process later runs.
    let tests_dir = ctx.root.tests_dir();
    let root = ctx.root.root();

    let venv = timed(report, "provision", || {
        venv::ensure(root, &ctx.build.env_name, ctx.profile, ctx.recreate_env)
            .map_err(RigError::from)
    })?;

    let wheel = timed(report, "build-wheel", || build::build_wheel(root, &ctx.build))?;
    report.wheel = Some(wheel.clone());

    let cli = timed(report, "build-cli", || {
        build::build_standalone_cli(root, &ctx.build)
    })?;
    report.cli = Some(cli.clone());

    timed(report, "install", || {
        install::install_wheel(&venv, &wheel, ctx.build.timeout)?;
        venv.verify_active().map_err(RigError::from)
    })?;

    let stage = timed(report, "stage", || {
        TestStage::prepare(&ctx.root.scratch_root(), &cli).map_err(RigError::from)
    })?;
    report.scratch_dir = Some(stage.dir().to_path_buf());

    if ctx.skip_tests {
        info!("skipping test run as requested");
        stage.cleanup(ctx.keep_scratch)?;
        return Ok(());
    }

    let result = timed(report, "tests", || {
        runner::run_tests(&venv, &stage, &tests_dir, &ctx.test)
    });

    match result {
        Ok(()) => {
            stage.cleanup(ctx.keep_scratch)?;
            Ok(())
        }
        Err(e) => {
            // Keep the scratch directory around for debugging a red suite.
            warn!(dir = %stage.dir().display(), "keeping scratch directory of failed run");
            Err(e)
        }
    }
}

/// Run one stage with logging and report timing.
fn timed<T>(
    report: &mut RunReport,
    name: &str,
    f: impl FnOnce() -> RigResult<T>,
) -> RigResult<T> {
    info!(stage = name, "starting stage");
    let start = Instant::now();
    let result = f();
    let secs = start.elapsed().as_secs_f64();
    report.stages.push(StageTiming {
        name: name.to_string(),
        secs,
    });

    match &result {
        Ok(_) => info!(stage = name, secs, "stage complete"),
        Err(e) => {
            report.failed_stage = Some(name.to_string());
            error!(stage = name, error = %e, "stage failed");
        }
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
