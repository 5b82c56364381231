//! The compiler we wrap, and the liballocs helper programs we call out to.

use crate::config::Config;
use crate::utils::{self, LogFile};
use crate::{Error, Result};

use std::path::{Path, PathBuf};
use std::process::Command;

/// The underlying C compiler.
#[derive(Debug, Clone)]
pub struct Compiler {
    pub path: PathBuf,
    pub is_clang: bool,
}

impl Compiler {
    /// Uses `LIBALLOCS_CC` if configured, otherwise asks the `cc` crate which
    /// compiler the host would use.
    ///
    /// `CC` must already be scrubbed from the environment when this runs,
    /// since it usually names the wrapper itself.
    pub fn discover(config: &Config) -> Result<Self> {
        if let Some(path) = &config.cc {
            return Ok(Self {
                path: path.clone(),
                is_clang: config.cc_is_clang,
            });
        }

        let tool = cc::Build::new()
            .target(utils::TARGET)
            .host(utils::HOST)
            .opt_level(0)
            .debug(false)
            .cargo_metadata(false)
            .try_get_compiler()
            .map_err(|e| Error::CompilerNotFound(format!("{:?}", e)))?;

        let compiler = Self {
            path: tool.path().to_path_buf(),
            is_clang: config.cc_is_clang || tool.is_like_clang(),
        };
        info!(
            "using C compiler '{}'{}",
            compiler.path.display(),
            if compiler.is_clang { " (clang)" } else { "" }
        );
        Ok(compiler)
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        // nested builds must not come back to us
        cmd.env_remove("CC");
        cmd
    }

    /// Flags added to every compilation so that the debug information and
    /// relocations the later stages depend on are there.
    ///
    /// `-ffunction-sections` makes every reference to an allocator go through
    /// a relocation record, even for a static, address-taken one.
    pub fn instrumentation_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = vec![
            "-gdwarf-4",
            "-gstrict-dwarf",
            "-fno-omit-frame-pointer",
            "-ffunction-sections",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        if !self.is_clang {
            flags.push("-fvar-tracking-assignments".into());
        }
        flags
    }
}

/// The liballocs helper programs the wrapper delegates to.
pub trait ExternalTools {
    /// Links the type descriptions an object references into it.
    fn link_used_types(&self, object: &Path, log: &mut LogFile) -> Result<()>;

    /// Looks up the static size of the type a typed allocator returns, by
    /// inspecting the debug info of already-compiled `objects`.
    fn allocated_type_size(&self, allocator: &str, objects: &[PathBuf]) -> Result<Option<u64>>;
}

/// The helpers as installed under `<liballocs>/tools`.
pub struct LiballocsTools {
    tools_dir: PathBuf,
}

impl LiballocsTools {
    pub fn new(config: &Config) -> Self {
        Self {
            tools_dir: config.tools_dir(),
        }
    }
}

impl ExternalTools for LiballocsTools {
    fn link_used_types(&self, object: &Path, log: &mut LogFile) -> Result<()> {
        let mut cmd = Command::new(self.tools_dir.join("lang/c/bin/link-used-types"));
        cmd.arg(object);
        utils::run(&mut cmd, Some(log))
    }

    fn allocated_type_size(&self, allocator: &str, objects: &[PathBuf]) -> Result<Option<u64>> {
        let mut cmd = Command::new(self.tools_dir.join("find-allocated-type-size"));
        cmd.arg(allocator).args(objects);
        let (ok, out) = utils::capture(&mut cmd, None)?;
        debug!("size lookup for `{}` said: {:?}", allocator, out);
        if !ok {
            debug!("size lookup for `{}` failed", allocator);
        }
        Ok(parse_size_output(&out))
    }
}

/// The helper prints lines of the form `<size>\t<explanation>`; the first
/// line's number is the answer.
fn parse_size_output(out: &str) -> Option<u64> {
    out.lines()
        .next()?
        .split('\t')
        .next()?
        .trim()
        .parse()
        .ok()
}
