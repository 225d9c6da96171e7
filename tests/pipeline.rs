//! End-to-end pipeline tests.
//!
//! These drive the orchestrator against a fixture project with stub build
//! scripts, checking the workflow contract: preflight behavior, stage
//! ordering, halt-on-failure, scratch-directory staging.
//!
//! Tests that need a real interpreter (`python3` with the venv module) skip
//! gracefully when none is available.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use buildrig::error::RigError;
use buildrig::pipeline::{self, RunContext, RunOptions};
use buildrig::venv::DependencyProfile;

// ============================================================================
// Fixture Project
// ============================================================================

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    /// A minimal project: manifest, tests dir, and stub build scripts that
    /// create and report their artifacts.
    fn new() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        std::fs::write(
            root.join("pyproject.toml"),
            "[project]\nname = \"demo\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::create_dir(root.join("tests")).unwrap();
        std::fs::create_dir(root.join("scripts")).unwrap();

        let fixture = Fixture { temp };
        // Builds a minimal but structurally valid wheel, so the install
        // stage works offline.
        fixture.write_script(
            "scripts/build_wheel.sh",
            "mkdir -p dist\n\
             python3 - <<'EOF'\n\
             import zipfile\n\
             z = zipfile.ZipFile('dist/demo-0.1.0-py3-none-any.whl', 'w')\n\
             z.writestr('demo/__init__.py', '')\n\
             z.writestr('demo-0.1.0.dist-info/METADATA', 'Metadata-Version: 2.1\\nName: demo\\nVersion: 0.1.0\\n')\n\
             z.writestr('demo-0.1.0.dist-info/WHEEL', 'Wheel-Version: 1.0\\nGenerator: stub\\nRoot-Is-Purelib: true\\nTag: py3-none-any\\n')\n\
             z.writestr('demo-0.1.0.dist-info/RECORD', '')\n\
             z.close()\n\
             EOF\n\
             echo dist/demo-0.1.0-py3-none-any.whl",
        );
        fixture.write_script(
            "scripts/build_standalone.sh",
            "mkdir -p dist\n\
             printf '#!/bin/sh\\necho demo\\n' > dist/demo\n\
             chmod +x dist/demo\n\
             echo dist/demo",
        );
        fixture
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn write_script(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.root().join(rel);
        std::fs::write(&path, format!("#!/bin/sh\nset -e\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            project_root: Some(self.root().to_path_buf()),
            // Runtime profile: no dependency install, so fixtures work
            // offline. The dev profile's pip behavior is covered by the
            // install-stage tests below.
            profile: DependencyProfile::Runtime,
            stage_timeout: Duration::from_secs(120),
            ..Default::default()
        }
    }
}

fn python3_available() -> bool {
    let Ok(python) = which::which("python3") else {
        return false;
    };
    if which::which("uv").is_ok() {
        return true;
    }
    // Without uv, venv creation needs ensurepip.
    std::process::Command::new(python)
        .args(["-c", "import ensurepip"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Give the fixture venv a pytest stub after provisioning, so the test stage
/// does not depend on pytest being installable offline.
fn plant_pytest_stub(root: &Path, env_name: &str, body: &str) {
    let bin = root.join(".rig").join(env_name).join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let pytest = bin.join("pytest");
    std::fs::write(&pytest, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&pytest, std::fs::Permissions::from_mode(0o755)).unwrap();
}

// ============================================================================
// Preflight
// ============================================================================

#[test]
fn missing_manifest_fails_preflight_with_usage() {
    let temp = TempDir::new().unwrap();
    let options = RunOptions {
        project_root: Some(temp.path().to_path_buf()),
        ..Default::default()
    };

    let err = RunContext::new(options).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("usage: rig"));

    // No environment, build, or install side effects.
    assert!(!temp.path().join(".rig").exists());
}

// ============================================================================
// Full Pipeline
// ============================================================================

#[test]
fn successful_run_exits_clean_and_reports_stages() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let fixture = Fixture::new();

    // Provision first so the pytest stub can be planted inside the venv.
    let probe = fixture.root().join("pytest_probe");
    {
        let ctx = RunContext::new(RunOptions {
            skip_tests: true,
            ..fixture.options()
        })
        .unwrap();
        pipeline::run(&ctx).unwrap();
    }
    plant_pytest_stub(
        fixture.root(),
        "dev",
        &format!(
            "[ -x \"$RIG_CLI_BIN\" ] || exit 90\necho \"$PWD\" > {}",
            probe.display()
        ),
    );

    let ctx = RunContext::new(fixture.options()).unwrap();
    let report = pipeline::run(&ctx).unwrap();

    assert_eq!(report.status, "ok");
    assert!(report.failed_stage.is_none());
    let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        ["provision", "build-wheel", "build-cli", "install", "stage", "tests"]
    );
    assert!(report.wheel.as_ref().unwrap().is_file());

    // The stub pytest ran from inside the scratch directory.
    let pytest_cwd = std::fs::read_to_string(&probe).unwrap();
    let scratch_root = fixture.root().join(".rig").join("tmp");
    assert!(
        PathBuf::from(pytest_cwd.trim()).starts_with(&scratch_root),
        "pytest cwd should be under {}: {}",
        scratch_root.display(),
        pytest_cwd
    );

    // Report persisted.
    let report_path = fixture.root().join(".rig").join("last_run.json");
    let content = std::fs::read_to_string(report_path).unwrap();
    assert!(content.contains("\"ok\""));
}

#[test]
fn each_run_creates_a_distinct_scratch_directory() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let fixture = Fixture::new();
    let options = RunOptions {
        skip_tests: true,
        keep_scratch: true,
        ..fixture.options()
    };

    let first = pipeline::run(&RunContext::new(options.clone()).unwrap()).unwrap();
    let second = pipeline::run(&RunContext::new(options).unwrap()).unwrap();

    let first_dir = first.scratch_dir.unwrap();
    let second_dir = second.scratch_dir.unwrap();
    assert_ne!(first_dir, second_dir);
    assert!(first_dir.exists());
    assert!(second_dir.exists());

    // Both staged copies are executable standalone binaries.
    for dir in [&first_dir, &second_dir] {
        let cli = dir.join("demo");
        let mode = std::fs::metadata(&cli).unwrap().permissions().mode();
        assert!(mode & 0o111 != 0, "{} should be executable", cli.display());
    }
}

// ============================================================================
// Halt on Failure
// ============================================================================

#[test]
fn build_failure_halts_before_install() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let fixture = Fixture::new();
    fixture.write_script("scripts/build_wheel.sh", "echo broken >&2\nexit 5");

    let ctx = RunContext::new(fixture.options()).unwrap();
    let err = pipeline::run(&ctx).unwrap_err();

    assert_eq!(err.exit_code(), 5);
    // No staging happened.
    assert!(!fixture.root().join(".rig").join("tmp").exists());
}

#[test]
fn install_failure_prevents_test_run() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let fixture = Fixture::new();
    let sentinel = fixture.root().join("tests_ran");

    // Provision, then plant a pytest stub that would create the sentinel.
    {
        let ctx = RunContext::new(RunOptions {
            skip_tests: true,
            ..fixture.options()
        })
        .unwrap();
        pipeline::run(&ctx).unwrap();
    }
    // The wheel script now reports a file that is not a valid wheel, so the
    // install stage fails.
    fixture.write_script(
        "scripts/build_wheel.sh",
        "mkdir -p dist\n: > dist/bad.whl\necho dist/bad.whl",
    );
    plant_pytest_stub(
        fixture.root(),
        "dev",
        &format!("touch {}", sentinel.display()),
    );

    let ctx = RunContext::new(fixture.options()).unwrap();
    let err = pipeline::run(&ctx).unwrap_err();

    assert_ne!(err.exit_code(), 0);
    assert!(
        !sentinel.exists(),
        "test runner must not run after a failed install"
    );

    let report = std::fs::read_to_string(fixture.root().join(".rig").join("last_run.json")).unwrap();
    assert!(report.contains("\"failed\""));
    assert!(report.contains("install"), "report: {report}");
}

#[test]
fn empty_wheel_output_fails_the_build_stage() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let fixture = Fixture::new();
    fixture.write_script("scripts/build_wheel.sh", "true");

    let ctx = RunContext::new(fixture.options()).unwrap();
    let err = pipeline::run(&ctx).unwrap_err();
    assert!(matches!(err, RigError::Stage { .. }), "got: {err}");
}
