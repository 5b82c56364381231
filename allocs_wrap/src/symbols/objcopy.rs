//! `SymbolTableEditor` backed by GNU binutils.
//!
//! Unbinding relies on the `--unbind-sym` and `--prefer-non-section-relocs`
//! options of liballocs' patched `objcopy`; stock binutils will reject them
//! and the fixup fails with the tool's exit status.

use super::{inspect, DefinedSymbol, SymbolTableEditor};
use crate::utils::{self, LogFile};
use crate::Result;

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct BinutilsEditor {
    objcopy: PathBuf,
    ld: PathBuf,
}

impl BinutilsEditor {
    pub fn new(objcopy: impl Into<PathBuf>, ld: impl Into<PathBuf>) -> Self {
        Self {
            objcopy: objcopy.into(),
            ld: ld.into(),
        }
    }

    fn objcopy(&self, opts: Vec<OsString>, object: &Path, log: &mut LogFile) -> Result<()> {
        let mut cmd = Command::new(&self.objcopy);
        cmd.args(opts).arg(object);
        utils::run(&mut cmd, Some(log))
    }
}

/// Flattens `(option, value)` pairs into an argument list.
fn paired(option: &str, values: impl IntoIterator<Item = String>) -> Vec<OsString> {
    values
        .into_iter()
        .flat_map(|v| vec![OsString::from(option), OsString::from(v)])
        .collect()
}

impl SymbolTableEditor for BinutilsEditor {
    fn list_defined_symbols(&self, object: &Path) -> Result<Vec<DefinedSymbol>> {
        inspect::defined_symbols(object)
    }

    fn split_definition_from_references(
        &self,
        object: &Path,
        symbols: &[String],
        log: &mut LogFile,
    ) -> Result<()> {
        // without --prefer-non-section-relocs, references through a section
        // symbol plus offset would escape the unbinding
        let mut opts = vec![OsString::from("--prefer-non-section-relocs")];
        opts.extend(paired("--unbind-sym", symbols.iter().cloned()));
        self.objcopy(opts, object, log)
    }

    fn rename_symbols(
        &self,
        object: &Path,
        renames: &[(String, String)],
        log: &mut LogFile,
    ) -> Result<()> {
        let mut opts = vec![OsString::from("--prefer-non-section-relocs")];
        opts.extend(paired(
            "--redefine-sym",
            renames.iter().map(|(from, to)| format!("{}={}", from, to)),
        ));
        self.objcopy(opts, object, log)
    }

    fn define_aliases(
        &self,
        object: &Path,
        aliases: &[(String, String)],
        log: &mut LogFile,
    ) -> Result<()> {
        // `ld -r` can't write over its own input, so relink from a copy
        let dir = object
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let stem = object
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let input = tempfile::Builder::new()
            .prefix(&format!("{}.", stem))
            .suffix(".tmp.o")
            .tempfile_in(dir)?;
        fs::copy(object, input.path())?;

        let mut cmd = Command::new(&self.ld);
        cmd.arg("-r")
            .args(paired(
                "--defsym",
                aliases
                    .iter()
                    .map(|(alias, target)| format!("{}={}", alias, target)),
            ))
            .arg(input.path())
            .arg("-o")
            .arg(object);

        match utils::run(&mut cmd, Some(&mut *log)) {
            Ok(()) => Ok(()),
            Err(e) => {
                // keep the pre-relink copy around for whoever debugs this
                match input.keep() {
                    Ok((_, kept)) => {
                        log.note(format_args!("relink input preserved as {}", kept.display()))
                    }
                    Err(keep_err) => warn!("couldn't preserve relink input: {}", keep_err.error),
                }
                Err(e)
            }
        }
    }

    fn promote_to_global(
        &self,
        object: &Path,
        symbols: &[String],
        log: &mut LogFile,
    ) -> Result<()> {
        let opts = paired("--globalize-symbol", symbols.iter().cloned());
        self.objcopy(opts, object, log)
    }
}
