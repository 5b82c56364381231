//! Link command construction.

use crate::args::{BuildMode, Invocation};
use crate::config::Config;
use crate::registry::WrappedSymbolSet;
use crate::stubgen::StubPaths;
use crate::symbols;
use crate::{Error, Result};

use std::path::{Path, PathBuf};

/// Keeps the thread-local current allocation site in every executable.
const CURRENT_ALLOCSITE: &str = "__current_allocsite";

/// How the allocator runtime gets into the output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LibraryLinkage {
    /// Nothing is added.
    None,
    /// `liballocs_dummyweaks.o`: weak no-op definitions, overridden at load
    /// time by the preloaded runtime.
    DummyWeaksObject,
    /// `liballocs_dummyweaks.so`, forced in even under `--as-needed`.
    DummyWeaksShared,
    /// The full runtime as an archive, for static executables.
    StaticArchive,
    /// `-lallocs`, when preloading is disabled.
    Direct,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkPolicy {
    pub compile_stub: bool,
    pub wrap_symbols: bool,
    pub library: LibraryLinkage,
}

pub struct LinkOrchestrator<'a> {
    config: &'a Config,
    symbols: &'a WrappedSymbolSet,
}

impl<'a> LinkOrchestrator<'a> {
    pub fn new(config: &'a Config, symbols: &'a WrappedSymbolSet) -> Self {
        Self { config, symbols }
    }

    /// What a link in `mode` needs.
    ///
    /// Partial links get nothing: their output is linked again later, and
    /// anything added now would be defined twice by then. Shared libraries
    /// get no stub; their `__wrap_` references stay dangling until the
    /// executable that loads them supplies the trampolines.
    pub fn policy(&self, mode: BuildMode) -> LinkPolicy {
        let preload = self.config.use_preload;
        match mode {
            BuildMode::Compile | BuildMode::LinkRelocatable => LinkPolicy {
                compile_stub: false,
                wrap_symbols: false,
                library: LibraryLinkage::None,
            },
            BuildMode::LinkSharedLibrary => LinkPolicy {
                compile_stub: false,
                wrap_symbols: true,
                library: if preload {
                    LibraryLinkage::DummyWeaksObject
                } else {
                    LibraryLinkage::Direct
                },
            },
            BuildMode::LinkExecutableDynamic => LinkPolicy {
                compile_stub: true,
                wrap_symbols: true,
                library: if preload {
                    LibraryLinkage::DummyWeaksShared
                } else {
                    LibraryLinkage::Direct
                },
            },
            BuildMode::LinkExecutableStatic => LinkPolicy {
                compile_stub: true,
                wrap_symbols: true,
                library: if preload {
                    LibraryLinkage::StaticArchive
                } else {
                    LibraryLinkage::Direct
                },
            },
        }
    }

    /// Builds the full argument list for the underlying compiler driver.
    ///
    /// The stub object, when the mode calls for one, goes before every other
    /// input: an archive can only satisfy the stub's `__real_` references if
    /// it comes after it.
    pub fn plan(
        &self,
        mode: BuildMode,
        pass_through: &[String],
        stub: Option<&Path>,
    ) -> Result<Vec<String>> {
        let policy = self.policy(mode);
        if !policy.wrap_symbols && !policy.compile_stub {
            debug!("{:?}: passing the link through unchanged", mode);
            return Ok(pass_through.to_vec());
        }

        let mut args = Vec::new();
        if policy.compile_stub {
            let stub = match stub {
                Some(stub) if stub.exists() => stub,
                Some(stub) => return Err(Error::MissingOutputArtifact(stub.to_path_buf())),
                None => {
                    let output = Invocation::parse(pass_through.to_vec()).link_output();
                    return Err(Error::MissingOutputArtifact(
                        StubPaths::for_output(&output).object,
                    ));
                }
            };
            args.push(stub.to_string_lossy().into_owned());
        }

        for (input, defined) in self.providers(pass_through) {
            info!(
                "'{}' defines wrapped {}",
                input.display(),
                defined.join(", ")
            );
        }

        args.extend(pass_through.iter().cloned());
        if policy.wrap_symbols {
            args.extend(self.symbols.names().map(|s| format!("-Wl,--wrap,{}", s)));
        }
        args.push("-Wl,--export-dynamic".into());
        args.extend(self.library_args(mode, policy.library));
        if mode.is_executable() {
            args.push(format!("-Wl,--undefined={}", CURRENT_ALLOCSITE));
        }
        args.push("-ldl".into());

        debug!("link arguments: {}", args.join(" "));
        Ok(args)
    }

    fn library_args(&self, mode: BuildMode, library: LibraryLinkage) -> Vec<String> {
        let lib = self.config.lib_dir();
        let in_lib = |name: &str| lib.join(name).to_string_lossy().into_owned();
        let search = format!("-L{}", lib.display());
        let rpath = format!("-Wl,-rpath,{}", lib.display());

        let mut args = Vec::new();
        match mode {
            BuildMode::LinkExecutableDynamic => {
                args.push(search);
                args.push(rpath);
            }
            BuildMode::LinkExecutableStatic => args.push(search),
            BuildMode::LinkSharedLibrary if library == LibraryLinkage::Direct => {
                args.push(search);
                args.push(rpath);
            }
            _ => {}
        }

        match library {
            LibraryLinkage::None => {}
            LibraryLinkage::DummyWeaksObject => args.push(in_lib("liballocs_dummyweaks.o")),
            LibraryLinkage::DummyWeaksShared => {
                args.push("-Wl,--push-state".into());
                args.push("-Wl,--no-as-needed".into());
                args.push(in_lib("liballocs_dummyweaks.so"));
                args.push("-Wl,--pop-state".into());
            }
            LibraryLinkage::StaticArchive => args.push(in_lib("liballocs.a")),
            LibraryLinkage::Direct => args.push("-lallocs".into()),
        }
        args
    }

    /// Link inputs (objects and archives) that define wrapped functions,
    /// with the functions each defines.
    pub fn providers(&self, pass_through: &[String]) -> Vec<(PathBuf, Vec<String>)> {
        pass_through
            .iter()
            .filter(|a| !a.starts_with('-') && (a.ends_with(".o") || a.ends_with(".a")))
            .map(PathBuf::from)
            .filter_map(|input| {
                let defined = symbols::defines_any(&input, self.symbols.names());
                if defined.is_empty() {
                    None
                } else {
                    Some((input, defined))
                }
            })
            .collect()
    }
}
