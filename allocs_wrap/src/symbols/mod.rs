//! Symbol table inspection and rewriting.
//!
//! The fixup policy in [`crate::fixup`] only talks to a [`SymbolTableEditor`].
//! How a platform's tools carry the edits out lives behind it; the default
//! backend reads symbol tables natively and rewrites with binutils.

pub(crate) mod inspect;
mod objcopy;

pub use self::inspect::{defined_symbols, defined_symbols_in_archive, defines_any};
pub use self::objcopy::BinutilsEditor;

use crate::utils::LogFile;
use crate::Result;

use std::path::Path;

/// Binding of a defined symbol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Binding {
    /// File-local (`STB_LOCAL`): invisible to the linker's `--wrap`.
    Local,
    Global,
    Weak,
}

/// A symbol an object defines (as opposed to merely references).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedSymbol {
    pub name: String,
    pub binding: Binding,
}

impl DefinedSymbol {
    pub fn is_local(&self) -> bool {
        self.binding == Binding::Local
    }
}

/// The symbol-rewriting operations the fixup needs.
///
/// All mutating operations work in place on `object` and report subprocess
/// diagnostics to `log`.
pub trait SymbolTableEditor {
    /// Lists every symbol `object` defines, local ones included.
    fn list_defined_symbols(&self, object: &Path) -> Result<Vec<DefinedSymbol>>;

    /// Splits each symbol's definition from the references to it, leaving
    /// `__def_<sym>` for the definition and `__ref_<sym>` for every
    /// reference, including address-taking data relocations.
    fn split_definition_from_references(
        &self,
        object: &Path,
        symbols: &[String],
        log: &mut LogFile,
    ) -> Result<()>;

    /// Renames symbols, given as `(from, to)` pairs.
    fn rename_symbols(
        &self,
        object: &Path,
        renames: &[(String, String)],
        log: &mut LogFile,
    ) -> Result<()>;

    /// Adds extra symbols, given as `(alias, target)` pairs, each bound to the
    /// same address as its existing `target`.
    fn define_aliases(
        &self,
        object: &Path,
        aliases: &[(String, String)],
        log: &mut LogFile,
    ) -> Result<()>;

    /// Gives file-local symbols global binding.
    fn promote_to_global(&self, object: &Path, symbols: &[String], log: &mut LogFile)
        -> Result<()>;
}

/// Prefix of a definition split off by unbinding.
pub const DEF_PREFIX: &str = "__def_";
/// Prefix of references split off by unbinding.
pub const REF_PREFIX: &str = "__ref_";
/// Prefix the linker's `--wrap` redirects calls to.
pub const WRAP_PREFIX: &str = "__wrap_";
/// Prefix under which `--wrap` keeps the original definition reachable.
pub const REAL_PREFIX: &str = "__real_";

pub fn prefixed(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}
