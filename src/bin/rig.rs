//! rig CLI binary entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use buildrig::pipeline::{self, RunContext, RunOptions};
use buildrig::venv::DependencyProfile;

/// Build-and-test rig: build the wheel and the standalone CLI, install the
/// wheel into a development environment, and run the test suite against a
/// staged copy of the CLI.
#[derive(Parser)]
#[command(name = "rig")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project root directory (default: current directory)
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Name of the build environment
    #[arg(long, default_value = "dev")]
    env_name: String,

    /// Dependency profile installed into a fresh environment: dev, runtime
    #[arg(long, default_value = "dev")]
    profile: String,

    /// pytest worker count
    #[arg(long, default_value_t = 4)]
    jobs: u32,

    /// Override the wheel build command
    #[arg(long)]
    wheel_cmd: Option<PathBuf>,

    /// Override the standalone CLI build command
    #[arg(long)]
    cli_cmd: Option<PathBuf>,

    /// Build in release mode instead of debug
    #[arg(long)]
    release: bool,

    /// Keep the scratch directory after a successful run
    #[arg(long)]
    keep_scratch: bool,

    /// Recreate the build environment even if a valid one exists
    #[arg(long)]
    recreate_env: bool,

    /// Stop after staging, without invoking the test runner
    #[arg(long)]
    skip_tests: bool,

    /// Timeout in seconds applied to each external stage
    #[arg(long, default_value_t = 1800)]
    timeout_secs: u64,

    /// Verbose logging (RIG_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("RIG_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let profile = match cli.profile.as_str() {
        "dev" => DependencyProfile::Dev,
        "runtime" => DependencyProfile::Runtime,
        other => {
            eprintln!("error: invalid dependency profile '{other}' (expected dev or runtime)");
            return ExitCode::from(2);
        }
    };

    let options = RunOptions {
        project_root: cli.project_root,
        env_name: cli.env_name,
        profile,
        jobs: cli.jobs,
        wheel_cmd: cli.wheel_cmd,
        cli_cmd: cli.cli_cmd,
        release: cli.release,
        keep_scratch: cli.keep_scratch,
        recreate_env: cli.recreate_env,
        skip_tests: cli.skip_tests,
        stage_timeout: Duration::from_secs(cli.timeout_secs),
    };

    let result = RunContext::new(options).and_then(|ctx| pipeline::run(&ctx));

    match result {
        Ok(report) => {
            tracing::info!(stages = report.stages.len(), "pipeline complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code().clamp(1, 255) as u8)
        }
    }
}
