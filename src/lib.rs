//! Buildrig: a build-and-test rig for Python projects that ship both an
//! installable wheel and a standalone command-line executable.
//!
//! The `rig` binary runs one linear pipeline per invocation: preflight the
//! project root, provision a development virtual environment, drive the two
//! external build scripts, install the wheel, stage the standalone CLI in a
//! scratch directory, and run the test suite against it.

// Pipeline stages
pub mod build;
pub mod install;
pub mod runner;
pub mod staging;
pub mod venv;
pub mod workspace;

// Infrastructure
pub mod error;
pub mod pipeline;
pub mod step;
