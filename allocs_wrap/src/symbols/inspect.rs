//! Symbol table reading using the `object` and `ar` crates.

use super::{Binding, DefinedSymbol};
use crate::Result;

use ar::Archive;
use hashbrown::HashSet;
use object::{Object, ObjectSymbol, SymbolKind};

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// Extracts the defined symbols from an object file's contents.
fn defined_in(data: &[u8]) -> Result<Vec<DefinedSymbol>> {
    let file = object::File::parse(data)?;
    let mut defined = Vec::new();

    for sym in file.symbols() {
        if sym.is_undefined() {
            continue;
        }
        match sym.kind() {
            SymbolKind::Section | SymbolKind::File => continue,
            _ => {}
        }
        let name = match sym.name() {
            Ok(name) if !name.is_empty() => name,
            _ => continue,
        };
        let binding = if sym.is_local() {
            Binding::Local
        } else if sym.is_weak() {
            Binding::Weak
        } else {
            Binding::Global
        };
        defined.push(DefinedSymbol {
            name: name.to_string(),
            binding,
        });
    }

    Ok(defined)
}

/// Lists the symbols defined by a relocatable object or linked binary.
pub fn defined_symbols(path: &Path) -> Result<Vec<DefinedSymbol>> {
    let data = fs::read(path)?;
    defined_in(&data)
}

/// Lists the symbols defined by any member of a `.a` archive.
///
/// Members that aren't object files (symbol indices, string tables, stray
/// text files) are skipped.
pub fn defined_symbols_in_archive(path: &Path) -> Result<Vec<DefinedSymbol>> {
    info!("scanning archive '{}'", path.display());
    let mut archive = Archive::new(File::open(path)?);
    let mut defined = Vec::new();

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry?;
        let mut content: Vec<u8> = Vec::new();
        entry.read_to_end(&mut content)?;

        match defined_in(&content) {
            Ok(syms) => defined.extend(syms),
            Err(e) => debug!(
                "skipping archive member '{}': {}",
                String::from_utf8_lossy(entry.header().identifier()),
                e
            ),
        }
    }

    Ok(defined)
}

/// Returns the names from `wanted` that the link input at `path` defines.
///
/// Archives are looked into; anything else is parsed as an object. Inputs that
/// can't be read as either yield nothing.
pub fn defines_any<'a, I>(path: &Path, wanted: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let is_archive = path.extension().map_or(false, |e| e == "a");
    let syms = if is_archive {
        defined_symbols_in_archive(path)
    } else {
        defined_symbols(path)
    };
    let syms = match syms {
        Ok(syms) => syms,
        Err(e) => {
            debug!("not inspecting '{}': {}", path.display(), e);
            return Vec::new();
        }
    };

    let defined: HashSet<&str> = syms
        .iter()
        .filter(|s| !s.is_local())
        .map(|s| s.name.as_str())
        .collect();
    wanted
        .into_iter()
        .filter(|name| defined.contains(name))
        .map(String::from)
        .collect()
}
