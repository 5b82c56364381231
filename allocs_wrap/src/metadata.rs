//! Post-link metadata build.
//!
//! Allocation-site and type tables for a binary live in a tree mirroring the
//! filesystem under `ALLOCSITES_BASE`, and are produced by liballocs'
//! `Makefile.allocsites`.

use crate::config::Config;
use crate::utils::{self, LogFile};
use crate::{Error, Result};

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const TARGET_SUFFIXES: &[&str] = &[
    ".allocs",
    "-types.c",
    "-types.so",
    "-allocsites.c",
    "-allocsites.so",
];

/// `<base><real_output><suffix>`; `real_output` is absolute, so this is plain
/// concatenation rather than a join.
fn under_base(base: &Path, real_output: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(real_output.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// The make targets for a binary whose canonical path is `real_output`.
pub fn target_paths(base: &Path, real_output: &Path) -> Vec<PathBuf> {
    TARGET_SUFFIXES
        .iter()
        .map(|suffix| under_base(base, real_output, suffix))
        .collect()
}

/// Runs the metadata build for a freshly linked `output`.
///
/// make's output goes to `<base><realpath(output)>.makelog`, which is copied
/// to stderr if the build fails or `DEBUG_CC` is set.
pub fn build_metadata(config: &Config, output: &Path) -> Result<()> {
    let real = fs::canonicalize(output)
        .map_err(|_| Error::MissingOutputArtifact(output.to_path_buf()))?;
    let base = &config.allocsites_base;
    let mut log = LogFile::create(under_base(base, &real, ".makelog"))?;

    let mut cmd = Command::new(&config.make);
    cmd.arg("-C")
        .arg(config.tools_dir())
        .arg("-f")
        .arg("Makefile.allocsites")
        .args(target_paths(base, &real))
        .stdout(log.stdio()?);

    info!("building allocation metadata for '{}'", real.display());
    let result = utils::run(&mut cmd, Some(&mut log));
    if result.is_err() || config.debug {
        log.surface();
    }
    result
}
