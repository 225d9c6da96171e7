//! Development environment provisioning.
//!
//! Creates and manages the rig's named virtual environments under
//! `.rig/<name>` in the project root.
//!
//! ## Provisioning Strategy
//!
//! 1. **Find base Python**: try `uv python find` first, then `$PATH`
//! 2. **Create venv**: prefer `uv venv`, fall back to `python -m venv`
//! 3. **Install profile**: `dev` installs the project with its dev extras
//! 4. **Reuse**: an existing venv is validated and reused; invalid ones are
//!    recreated
//!
//! The rig never activates an environment in its own process. Child processes
//! get the equivalent of activation through [`Venv::activation_env`], and
//! [`Venv::verify_active`] confirms the interpreter genuinely resolves inside
//! the venv prefix.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::step::{self, StepSpec};

// ============================================================================
// Constants
// ============================================================================

/// Platform-specific Python binary names.
#[cfg(windows)]
const PYTHON_NAMES: &[&str] = &["python.exe", "python3.exe"];

#[cfg(not(windows))]
const PYTHON_NAMES: &[&str] = &["python3", "python"];

/// Platform-specific bin directory inside a virtual environment.
#[cfg(windows)]
const VENV_BIN_DIR: &str = "Scripts";

#[cfg(not(windows))]
const VENV_BIN_DIR: &str = "bin";

/// Timeout for provisioning commands (venv creation, dependency install).
const PROVISION_TIMEOUT: Duration = Duration::from_secs(1800);

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while provisioning or checking an environment.
#[derive(Debug, Error)]
pub enum VenvError {
    /// No suitable Python 3.9+ found anywhere.
    #[error("no suitable Python 3.9+ found\n\n\
             Remediation:\n  \
             - Install Python 3.9+ via your package manager\n  \
             - Or: curl -LsSf https://astral.sh/uv/install.sh | sh && uv python install 3.11")]
    NoPythonFound,

    /// Failed to create the virtual environment.
    #[error("failed to create virtual environment at {}: {reason}\n\n\
             Remediation:\n  \
             - Check write permissions for the project's .rig directory\n  \
             - Or: rig --recreate-env", .path.display())]
    CreationFailed { path: PathBuf, reason: String },

    /// Failed to install the dependency profile.
    #[error("failed to install {profile} dependencies: {reason}\n\n\
             Remediation:\n  \
             - Check network connectivity\n  \
             - Check the project's optional-dependency tables in pyproject.toml")]
    InstallFailed { profile: String, reason: String },

    /// The environment did not activate: its interpreter resolves elsewhere.
    #[error("failed to activate environment '{name}': interpreter prefix {found} \
             is outside {}", .expected.display())]
    ActivationFailed {
        name: String,
        expected: PathBuf,
        found: String,
    },

    /// Failed to execute an interpreter.
    #[error("failed to execute Python at {}: {reason}", .path.display())]
    ExecutionFailed { path: PathBuf, reason: String },

    /// Unparseable interpreter version string.
    #[error("invalid Python version string: {version}")]
    InvalidVersion { version: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for environment operations.
pub type VenvResult<T> = Result<T, VenvError>;

// ============================================================================
// Python Version
// ============================================================================

/// Parsed interpreter version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl PythonVersion {
    /// Minimum interpreter version the rig supports.
    pub fn minimum() -> Self {
        PythonVersion {
            major: 3,
            minor: 9,
            patch: 0,
        }
    }

    /// Parse a version string like "3.11.4" or "Python 3.11.4".
    pub fn parse(version_str: &str) -> VenvResult<Self> {
        let version_str = version_str
            .strip_prefix("Python ")
            .unwrap_or(version_str)
            .trim();

        let parts: Vec<&str> = version_str.split('.').collect();
        if parts.len() < 2 {
            return Err(VenvError::InvalidVersion {
                version: version_str.to_string(),
            });
        }

        let parse_part = |s: &str| {
            s.parse::<u32>().map_err(|_| VenvError::InvalidVersion {
                version: version_str.to_string(),
            })
        };
        let major = parse_part(parts[0])?;
        let minor = parse_part(parts[1])?;

        // Patch may carry a suffix like "4+" or "4rc1".
        let patch_digits: String = parts
            .get(2)
            .unwrap_or(&"0")
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let patch = patch_digits.parse::<u32>().unwrap_or(0);

        Ok(PythonVersion {
            major,
            minor,
            patch,
        })
    }

    /// Whether this version meets the minimum requirement.
    pub fn meets_minimum(&self) -> bool {
        *self >= Self::minimum()
    }
}

impl std::fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ============================================================================
// Dependency Profile
// ============================================================================

/// Which dependency set gets installed into a fresh environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyProfile {
    /// Only what an editable install of the project itself pulls in.
    Runtime,
    /// The project plus its `dev` extras (test runner, build tooling).
    Dev,
}

impl DependencyProfile {
    /// The pip requirement spec for this profile, relative to the project root.
    pub fn pip_target(&self) -> &'static str {
        match self {
            DependencyProfile::Runtime => ".",
            DependencyProfile::Dev => ".[dev]",
        }
    }
}

impl std::fmt::Display for DependencyProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyProfile::Runtime => write!(f, "runtime"),
            DependencyProfile::Dev => write!(f, "dev"),
        }
    }
}

// ============================================================================
// Venv Handle
// ============================================================================

/// Handle to a named virtual environment.
#[derive(Debug, Clone)]
pub struct Venv {
    name: String,
    dir: PathBuf,
}

impl Venv {
    /// Wrap an already-provisioned environment directory.
    ///
    /// No validation is performed; use [`ensure`] to provision and validate.
    pub fn existing(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Venv {
            name: name.into(),
            dir: dir.into(),
        }
    }

    /// Environment name (e.g. "dev").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute path of the environment directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bin directory (`bin` on Unix, `Scripts` on Windows).
    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join(VENV_BIN_DIR)
    }

    /// Path to the environment's interpreter.
    pub fn python_path(&self) -> PathBuf {
        #[cfg(windows)]
        {
            self.bin_dir().join("python.exe")
        }
        #[cfg(not(windows))]
        {
            self.bin_dir().join("python")
        }
    }

    /// Path to the environment's pip.
    pub fn pip_path(&self) -> PathBuf {
        #[cfg(windows)]
        {
            self.bin_dir().join("pip.exe")
        }
        #[cfg(not(windows))]
        {
            self.bin_dir().join("pip")
        }
    }

    /// Environment variables a child process needs to behave as if this venv
    /// were activated: `VIRTUAL_ENV` plus the venv bin dir prepended to PATH.
    pub fn activation_env(&self) -> Vec<(String, OsString)> {
        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let entries =
                    std::iter::once(self.bin_dir()).chain(std::env::split_paths(&existing));
                std::env::join_paths(entries)
                    .unwrap_or_else(|_| self.bin_dir().into_os_string())
            }
            None => self.bin_dir().into_os_string(),
        };

        vec![
            ("VIRTUAL_ENV".to_string(), self.dir.clone().into_os_string()),
            ("PATH".to_string(), path),
        ]
    }

    /// Confirm the environment is genuinely active: the interpreter must
    /// report a `sys.prefix` inside the venv directory.
    ///
    /// Belt-and-suspenders beyond per-step error propagation; a wheel install
    /// can succeed against the wrong interpreter and this is what catches it.
    pub fn verify_active(&self) -> VenvResult<()> {
        let python = self.python_path();
        let spec = StepSpec::new(&python)
            .arg("-c")
            .arg("import sys; print(sys.prefix)")
            .timeout(Duration::from_secs(60));

        let output = step::run(&spec).map_err(|e| VenvError::ExecutionFailed {
            path: python.clone(),
            reason: e.to_string(),
        })?;

        let found = output.stdout.trim().to_string();
        let prefix = PathBuf::from(&found);
        let canonical_prefix = prefix.canonicalize().unwrap_or(prefix);
        let canonical_dir = self.dir.canonicalize().unwrap_or_else(|_| self.dir.clone());

        if canonical_prefix.starts_with(&canonical_dir) {
            Ok(())
        } else {
            Err(VenvError::ActivationFailed {
                name: self.name.clone(),
                expected: self.dir.clone(),
                found,
            })
        }
    }
}

// ============================================================================
// Provisioning
// ============================================================================

/// Create (or reuse) the named environment under `.rig/<name>` and install
/// the requested dependency profile into a freshly created one.
///
/// An existing environment is validated before reuse: its interpreter must
/// exist and meet the minimum version. Invalid environments are removed and
/// recreated; `recreate` forces that unconditionally.
pub fn ensure(
    project_root: &Path,
    name: &str,
    profile: DependencyProfile,
    recreate: bool,
) -> VenvResult<Venv> {
    let dir = project_root.join(".rig").join(name);
    let venv = Venv::existing(name, &dir);

    if recreate && dir.exists() {
        info!(dir = %dir.display(), "removing existing environment");
        std::fs::remove_dir_all(&dir)?;
    }

    if dir.exists() {
        if validate(&venv) {
            info!(dir = %dir.display(), "reusing existing environment");
            return Ok(venv);
        }
        warn!(dir = %dir.display(), "existing environment is invalid, recreating");
        std::fs::remove_dir_all(&dir)?;
    }

    let base_python = find_base_python()?;
    info!(base = %base_python.display(), "creating environment");

    create_venv(&base_python, &dir)?;
    install_profile(&venv, project_root, profile)?;

    Ok(venv)
}

/// Check that an existing environment is usable.
fn validate(venv: &Venv) -> bool {
    let python = venv.python_path();
    if !python.exists() {
        return false;
    }
    match interpreter_version(&python) {
        Ok(version) => version.meets_minimum(),
        Err(_) => false,
    }
}

/// Find a base interpreter suitable for creating venvs.
///
/// Tries `uv python find` first (it manages Python installations), then the
/// platform interpreter names on `$PATH`. The result must be 3.9+.
pub fn find_base_python() -> VenvResult<PathBuf> {
    if let Some(path) = try_uv_python_find() {
        match interpreter_version(&path) {
            Ok(version) if version.meets_minimum() => return Ok(path),
            Ok(version) => {
                debug!(python = %path.display(), %version, "uv returned Python, too old");
            }
            Err(e) => {
                debug!(python = %path.display(), error = %e, "uv Python failed validation");
            }
        }
    }

    for name in PYTHON_NAMES {
        if let Ok(path) = which::which(name) {
            match interpreter_version(&path) {
                Ok(version) if version.meets_minimum() => return Ok(path),
                Ok(version) => {
                    debug!(python = %path.display(), %version, "interpreter too old, need 3.9+");
                }
                Err(e) => {
                    debug!(python = %path.display(), error = %e, "failed to get version");
                }
            }
        }
    }

    Err(VenvError::NoPythonFound)
}

/// Try to find an interpreter with uv.
fn try_uv_python_find() -> Option<PathBuf> {
    let uv_path = which::which("uv").ok()?;

    for request in ["3.11", ">=3.9"] {
        let spec = StepSpec::new(&uv_path)
            .arg("python")
            .arg("find")
            .arg(request)
            .timeout(Duration::from_secs(60));
        if let Ok(output) = step::run(&spec) {
            let path = PathBuf::from(output.stdout.trim());
            if path.as_os_str().is_empty() {
                continue;
            }
            if path.exists() {
                return Some(path);
            }
        }
    }

    None
}

/// Get an interpreter's version by running `--version`.
pub fn interpreter_version(python_path: &Path) -> VenvResult<PythonVersion> {
    let spec = StepSpec::new(python_path)
        .arg("--version")
        .timeout(Duration::from_secs(60));

    let output = step::run(&spec).map_err(|e| VenvError::ExecutionFailed {
        path: python_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // Old interpreters print the version to stderr.
    let version_output = if output.stdout.trim().is_empty() {
        output.stderr
    } else {
        output.stdout
    };

    PythonVersion::parse(version_output.trim())
}

/// Create the venv directory.
///
/// Prefers `uv venv` for speed, falls back to `python -m venv`.
fn create_venv(base_python: &Path, venv_dir: &Path) -> VenvResult<()> {
    if let Some(parent) = venv_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Ok(uv_path) = which::which("uv") {
        let spec = StepSpec::new(&uv_path)
            .arg("venv")
            .arg("--python")
            .arg(base_python)
            .arg(venv_dir)
            .timeout(PROVISION_TIMEOUT);
        match step::run(&spec) {
            Ok(_) => {
                info!(dir = %venv_dir.display(), "created environment with uv");
                return Ok(());
            }
            Err(e) => debug!(error = %e, "uv venv failed, falling back to python -m venv"),
        }
    }

    let spec = StepSpec::new(base_python)
        .arg("-m")
        .arg("venv")
        .arg(venv_dir)
        .timeout(PROVISION_TIMEOUT);
    match step::run(&spec) {
        Ok(_) => {
            info!(dir = %venv_dir.display(), "created environment with python -m venv");
            Ok(())
        }
        Err(e) => Err(VenvError::CreationFailed {
            path: venv_dir.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Install the dependency profile into the venv.
///
/// Prefers `uv pip install` for speed, falls back to the venv's pip.
fn install_profile(
    venv: &Venv,
    project_root: &Path,
    profile: DependencyProfile,
) -> VenvResult<()> {
    if profile == DependencyProfile::Runtime {
        debug!("runtime profile requested, skipping extra dependency install");
        return Ok(());
    }

    let target = profile.pip_target();

    if let Ok(uv_path) = which::which("uv") {
        let spec = StepSpec::new(&uv_path)
            .arg("pip")
            .arg("install")
            .arg("--python")
            .arg(venv.python_path())
            .arg("-e")
            .arg(target)
            .cwd(project_root)
            .timeout(PROVISION_TIMEOUT);
        match step::run(&spec) {
            Ok(_) => {
                info!(%profile, "installed dependencies with uv pip");
                return Ok(());
            }
            Err(e) => debug!(error = %e, "uv pip install failed, falling back to pip"),
        }
    }

    let pip = venv.pip_path();
    if !pip.exists() {
        return Err(VenvError::CreationFailed {
            path: venv.dir().to_path_buf(),
            reason: "pip not found in environment".to_string(),
        });
    }

    let spec = StepSpec::new(&pip)
        .arg("install")
        .arg("-e")
        .arg(target)
        .cwd(project_root)
        .timeout(PROVISION_TIMEOUT);
    match step::run(&spec) {
        Ok(_) => {
            info!(%profile, "installed dependencies with pip");
            Ok(())
        }
        Err(e) => Err(VenvError::InstallFailed {
            profile: profile.to_string(),
            reason: e.to_string(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
