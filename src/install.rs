//! Wheel installation.
//!
//! Installs the built wheel into the provisioned environment. A failure here
//! (malformed wheel, unmet dependency) aborts the whole run before any test
//! staging happens.

use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{RigError, RigResult, StageName};
use crate::step::{self, StepError, StepSpec};
use crate::venv::Venv;

/// Install the wheel artifact into the environment.
///
/// Prefers `uv pip install` pointed at the venv interpreter, falls back to
/// the venv's own pip. `--force-reinstall` keeps repeated runs honest: the
/// freshly built wheel always wins over a previously installed copy.
pub fn install_wheel(venv: &Venv, wheel: &Path, timeout: Duration) -> RigResult<()> {
    install_with(which::which("uv").ok().as_deref(), venv, wheel, timeout)
}

fn install_with(
    uv_path: Option<&Path>,
    venv: &Venv,
    wheel: &Path,
    timeout: Duration,
) -> RigResult<()> {
    let mut uv_failure = None;
    if let Some(uv_path) = uv_path {
        let spec = StepSpec::new(uv_path)
            .arg("pip")
            .arg("install")
            .arg("--python")
            .arg(venv.python_path())
            .arg("--force-reinstall")
            .arg(wheel)
            .timeout(timeout);
        match step::run(&spec) {
            Ok(_) => {
                info!(wheel = %wheel.display(), "installed wheel with uv pip");
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "uv pip install failed, falling back to pip");
                uv_failure = Some(e);
            }
        }
    }

    // A uv-created venv has no pip. When there is nothing to fall back to,
    // the uv failure is the real diagnostic and must reach the user.
    let pip = venv.pip_path();
    if !pip.exists() {
        let source = uv_failure.unwrap_or_else(|| StepError::Spawn {
            command: pip.display().to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "pip not found in environment"),
        });
        return Err(RigError::Stage {
            stage: StageName::Install,
            source,
        });
    }

    let spec = StepSpec::new(&pip)
        .arg("install")
        .arg("--force-reinstall")
        .arg(wheel)
        .timeout(timeout);

    match step::run(&spec) {
        Ok(_) => {
            info!(wheel = %wheel.display(), "installed wheel with pip");
            Ok(())
        }
        Err(source) => Err(RigError::Stage {
            stage: StageName::Install,
            source,
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
