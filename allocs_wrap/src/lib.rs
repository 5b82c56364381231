//! Build-time machinery that wires C allocator calls into allocation-site
//! tracking.
//!
//! The wrapper sits where `cc` normally would. Every function described in the
//! `LIBALLOCS_*_FNS` variables is routed through a generated trampoline:
//! compiled objects get their internal references to those functions unbound
//! (see [`fixup`]), and links get `--wrap` flags plus a stub object carrying
//! the trampolines (see [`stubgen`] and [`link`]). [`driver`] sequences it all.

#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;
extern crate ar;
extern crate cc;
extern crate hashbrown;
extern crate object;
extern crate tempfile;
extern crate thiserror;
#[cfg(test)]
#[macro_use]
extern crate insta;

pub mod args;
pub mod config;
pub mod driver;
pub mod fixup;
pub mod link;
pub mod metadata;
pub mod registry;
pub mod stubgen;
pub mod symbols;
pub mod tools;
mod utils;

pub use config::Config;
pub use driver::Driver;
pub use registry::WrappedSymbolSet;

use std::io;
use std::path::PathBuf;

/// Everything that can abort a wrapped compile or link.
///
/// None of these are recoverable: a build step either fully succeeds or
/// fails the build.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed allocator descriptor `{descriptor}`: {reason}")]
    ConfigParse { descriptor: String, reason: String },

    #[error("function `{0}` is described more than once")]
    DuplicateSpec(String),

    #[error("`{tool}` failed with exit status {code}")]
    SubprocessFailure { tool: String, code: i32 },

    #[error("couldn't locate a C compiler: {0}")]
    CompilerNotFound(String),

    #[error("cannot determine the allocation size of typed allocator `{0}`")]
    MissingSizeInfo(String),

    #[error("expected output `{}` was not produced", .0.display())]
    MissingOutputArtifact(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("object format error: {0}")]
    Object(#[from] object::read::Error),
}

impl Error {
    /// The exit status the wrapper should terminate with.
    ///
    /// Subprocess failures propagate the tool's own status so that the calling
    /// build system sees the same code it would have seen without us.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SubprocessFailure { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
