//! Post-compile rewriting of objects that define wrapped functions.
//!
//! The linker's `--wrap` only redirects references that cross object
//! boundaries. A call from `main` to an `xmalloc` defined in the same object
//! is bound at assembly time and would bypass the trampoline, so for every
//! wrapped function an object defines we split the definition from the
//! references, point the references at `__wrap_<f>`, and re-export the
//! definition under both `<f>` and `__real_<f>`.

use crate::registry::WrappedSymbolSet;
use crate::symbols::{self, SymbolTableEditor, DEF_PREFIX, REAL_PREFIX, REF_PREFIX, WRAP_PREFIX};
use crate::tools::ExternalTools;
use crate::utils::LogFile;
use crate::{Error, Result};

use hashbrown::HashSet;

use std::fs;
use std::path::{Path, PathBuf};

bitflags! {
    /// What was done to one wrapped symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FixupActions: u8 {
        /// Definition split from references and re-aliased.
        const UNBIND = 0b01;
        /// Promoted from file-local to global binding.
        const GLOBALIZE = 0b10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFixupResult {
    pub object: PathBuf,
    /// Every wrapped symbol the object defines, with what was done to it.
    /// Symbols needing no change carry empty actions.
    pub symbols: Vec<(String, FixupActions)>,
}

impl ObjectFixupResult {
    pub fn changed(&self) -> bool {
        self.symbols.iter().any(|(_, a)| !a.is_empty())
    }
}

pub struct FixupEngine<'a> {
    symbols: &'a WrappedSymbolSet,
    editor: &'a dyn SymbolTableEditor,
    tools: &'a dyn ExternalTools,
}

impl<'a> FixupEngine<'a> {
    pub fn new(
        symbols: &'a WrappedSymbolSet,
        editor: &'a dyn SymbolTableEditor,
        tools: &'a dyn ExternalTools,
    ) -> Self {
        Self {
            symbols,
            editor,
            tools,
        }
    }

    /// Rewrites a freshly compiled object in place.
    ///
    /// The object is backed up to `<stem>.backup.o` before its first edit;
    /// an existing backup is never overwritten. Subprocess output goes to
    /// `<object>.fixuplog`, which is copied to stderr if anything fails.
    pub fn fixup_object(&self, object: &Path) -> Result<ObjectFixupResult> {
        if !object.is_file() {
            return Err(Error::MissingOutputArtifact(object.to_path_buf()));
        }
        let mut log = LogFile::beside(object, ".fixuplog")?;
        debug!("fixing up '{}', log in '{}'", object.display(), log.path().display());

        let result = self.fixup_logged(object, &mut log);
        if let Err(e) = &result {
            error!("fixup of '{}' failed: {}", object.display(), e);
            log.surface();
        }
        result
    }

    fn fixup_logged(&self, object: &Path, log: &mut LogFile) -> Result<ObjectFixupResult> {
        self.tools.link_used_types(object, log)?;

        let defined = self.editor.list_defined_symbols(object)?;
        let names: HashSet<&str> = defined.iter().map(|s| s.name.as_str()).collect();

        let mut result = ObjectFixupResult {
            object: object.to_path_buf(),
            symbols: Vec::new(),
        };
        let mut to_unbind = Vec::new();
        for sym in defined.iter().filter(|s| self.symbols.contains(&s.name)) {
            if result.symbols.iter().any(|(n, _)| *n == sym.name) {
                continue;
            }
            let actions = if names.contains(symbols::prefixed(DEF_PREFIX, &sym.name).as_str()) {
                log.note(format_args!("{} is already unbound", sym.name));
                FixupActions::empty()
            } else {
                to_unbind.push(sym.name.clone());
                FixupActions::UNBIND
            };
            result.symbols.push((sym.name.clone(), actions));
        }

        if !to_unbind.is_empty() {
            let backup = object.with_extension("backup.o");
            if backup.exists() {
                debug!("keeping earlier backup '{}'", backup.display());
            } else {
                fs::copy(object, &backup)?;
            }
            log.note(format_args!(
                "unbinding {} in {} (backup in {})",
                to_unbind.join(" "),
                object.display(),
                backup.display()
            ));

            self.editor
                .split_definition_from_references(object, &to_unbind, log)?;

            let renames: Vec<(String, String)> = to_unbind
                .iter()
                .map(|s| (symbols::prefixed(REF_PREFIX, s), symbols::prefixed(WRAP_PREFIX, s)))
                .collect();
            self.editor.rename_symbols(object, &renames, log)?;

            let aliases: Vec<(String, String)> = to_unbind
                .iter()
                .flat_map(|s| {
                    let def = symbols::prefixed(DEF_PREFIX, s);
                    vec![
                        (s.clone(), def.clone()),
                        (symbols::prefixed(REAL_PREFIX, s), def),
                    ]
                })
                .collect();
            self.editor.define_aliases(object, &aliases, log)?;
        }

        // --wrap can't see file-local definitions
        let local: Vec<String> = self
            .editor
            .list_defined_symbols(object)?
            .into_iter()
            .filter(|s| s.is_local() && self.symbols.contains(&s.name))
            .map(|s| s.name)
            .collect();
        if !local.is_empty() {
            self.editor.promote_to_global(object, &local, log)?;
            for name in &local {
                match result.symbols.iter_mut().find(|(n, _)| n == name) {
                    Some((_, actions)) => actions.insert(FixupActions::GLOBALIZE),
                    None => result.symbols.push((name.clone(), FixupActions::GLOBALIZE)),
                }
            }
        }

        for (name, actions) in &result.symbols {
            debug!("{}: {} {:?}", object.display(), name, actions);
        }
        Ok(result)
    }

    /// Checks a linked executable, logging which wrapped functions it defines
    /// and whether their `__real_` aliases made it through the link.
    ///
    /// Returns the wrapped functions the binary defines.
    pub fn fixup_linked_object(&self, binary: &Path) -> Result<Vec<String>> {
        if !binary.exists() {
            return Err(Error::MissingOutputArtifact(binary.to_path_buf()));
        }
        let mut log = LogFile::beside(binary, ".fixuplog")?;

        let defined = self.editor.list_defined_symbols(binary)?;
        let names: HashSet<&str> = defined.iter().map(|s| s.name.as_str()).collect();

        let mut found = Vec::new();
        for name in self.symbols.names() {
            if !names.contains(name) {
                continue;
            }
            let real = names.contains(symbols::prefixed(REAL_PREFIX, name).as_str());
            log.note(format_args!(
                "{} defines {}{}",
                binary.display(),
                name,
                if real { " (with __real_ alias)" } else { "" }
            ));
            found.push(name.to_string());
        }
        info!(
            "'{}' defines {} wrapped function(s)",
            binary.display(),
            found.len()
        );
        Ok(found)
    }
}
