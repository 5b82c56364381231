//! Allocator and deallocator signatures.
//!
//! Functions are described by short descriptor strings:
//!
//! * `name(tags)R` for allocators, where `R` is an optional return tag,
//! * `name(tags)` for frees,
//! * `name(tags)->owner` for frees belonging to the sub-allocator `owner`.
//!
//! Each tag is a single letter describing one parameter. An uppercase tag
//! marks the parameter that carries the allocation size (for allocators) or
//! the freed pointer (`P`, for frees); there can be at most one.

use crate::config::DescriptorLists;
use crate::{Error, Result};

use hashbrown::HashSet;

use std::fmt;

/// Which wrapper strategy an allocator gets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocCategory {
    /// A top-level allocator, or a wrapper around one.
    L1Alloc,
    /// An allocator carving memory out of a block owned by another allocator.
    SubAlloc,
    /// A size-tracking allocator family member.
    AllocSzFamily,
}

/// A wrapped allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    pub arg_kinds: Vec<char>,
    pub return_kind: Option<char>,
    /// Index of the size-carrying argument. `None` for typed allocators,
    /// whose size is that of the type they return.
    pub size_arg_index: Option<usize>,
    pub category: AllocCategory,
}

impl FunctionSpec {
    pub fn is_typed(&self) -> bool {
        self.size_arg_index.is_none()
    }
}

/// A wrapped deallocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeFunctionSpec {
    pub name: String,
    pub arg_kinds: Vec<char>,
    /// The sub-allocator whose memory this frees, if any.
    pub owner: Option<String>,
}

impl FreeFunctionSpec {
    /// Position of the freed pointer argument.
    pub fn ptr_arg_index(&self) -> Option<usize> {
        self.arg_kinds.iter().position(|&c| c == 'P')
    }

    pub fn is_sub_free(&self) -> bool {
        self.owner.is_some()
    }
}

/// One parsed descriptor string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Allocator {
        name: String,
        arg_kinds: Vec<char>,
        return_kind: Option<char>,
    },
    Free {
        name: String,
        arg_kinds: Vec<char>,
    },
    SubFree {
        name: String,
        arg_kinds: Vec<char>,
        owner: String,
    },
}

/// The grammar a descriptor is expected to follow.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorKind {
    Allocator,
    Free,
    SubFree,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            DescriptorKind::Allocator => "name(args)[ret]",
            DescriptorKind::Free => "name(args)",
            DescriptorKind::SubFree => "name(args)->owner",
        })
    }
}

/// Recursive-descent parser over a single descriptor.
struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::ConfigParse {
            descriptor: self.text.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, lit: &str) -> Result<()> {
        if self.text[self.pos..].starts_with(lit) {
            self.pos += lit.len();
            Ok(())
        } else {
            Err(self.error(format!("expected `{}` at offset {}", lit, self.pos)))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.bump();
            }
            _ => return Err(self.error(format!("expected {} at offset {}", what, start))),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        Ok(self.text[start..self.pos].to_string())
    }

    fn arg_kinds(&mut self) -> Result<Vec<char>> {
        self.expect("(")?;
        let mut kinds = Vec::new();
        loop {
            match self.bump() {
                Some(')') => break,
                Some(c) if c.is_ascii_alphabetic() => kinds.push(c),
                Some(c) => return Err(self.error(format!("`{}` is not an argument tag", c))),
                None => return Err(self.error("unterminated argument list")),
            }
        }
        if kinds.iter().filter(|c| c.is_ascii_uppercase()).count() > 1 {
            return Err(self.error("more than one uppercase argument tag"));
        }
        Ok(kinds)
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.text.len() {
            Ok(())
        } else {
            Err(self.error(format!(
                "unexpected trailing `{}`",
                &self.text[self.pos..]
            )))
        }
    }
}

impl Descriptor {
    /// Parses `text` according to the grammar for `kind`.
    pub fn parse(text: &str, kind: DescriptorKind) -> Result<Descriptor> {
        let mut p = Parser::new(text);
        let name = p.ident("function name")?;
        let arg_kinds = p.arg_kinds()?;

        let descriptor = match kind {
            DescriptorKind::Allocator => {
                let return_kind = match p.peek() {
                    Some(c) if c.is_ascii_alphabetic() => p.bump(),
                    Some(c) => return Err(p.error(format!("`{}` is not a return tag", c))),
                    None => None,
                };
                Descriptor::Allocator {
                    name,
                    arg_kinds,
                    return_kind,
                }
            }
            DescriptorKind::Free => Descriptor::Free { name, arg_kinds },
            DescriptorKind::SubFree => {
                p.expect("->")?;
                let owner = p.ident("owning allocator name")?;
                Descriptor::SubFree {
                    name,
                    arg_kinds,
                    owner,
                }
            }
        };
        p.finish()?;
        Ok(descriptor)
    }

    pub fn name(&self) -> &str {
        match self {
            Descriptor::Allocator { name, .. }
            | Descriptor::Free { name, .. }
            | Descriptor::SubFree { name, .. } => name,
        }
    }
}

/// Every function the wrapper intercepts, with its signature.
///
/// Built once per invocation and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct WrappedSymbolSet {
    allocators: Vec<FunctionSpec>,
    frees: Vec<FreeFunctionSpec>,
    names: HashSet<String>,
}

impl WrappedSymbolSet {
    /// Parses all five descriptor lists.
    ///
    /// An L1 allocator shadows a sub-allocator or size-family allocator of the
    /// same name; any other repeated name is an error.
    pub fn parse(lists: &DescriptorLists) -> Result<Self> {
        let mut set = WrappedSymbolSet::default();

        let l1 = parse_all(&lists.l1_allocs, DescriptorKind::Allocator)?;
        let sub = parse_all(&lists.sub_allocs, DescriptorKind::Allocator)?;
        let allocsz = parse_all(&lists.allocsz_allocs, DescriptorKind::Allocator)?;
        let sub_frees = parse_all(&lists.sub_frees, DescriptorKind::SubFree)?;
        let l1_frees = parse_all(&lists.l1_frees, DescriptorKind::Free)?;

        let l1_names: HashSet<String> = l1.iter().map(|d| d.name().to_string()).collect();

        for d in l1 {
            set.add_allocator(d, AllocCategory::L1Alloc)?;
        }
        for (descriptors, category) in vec![
            (sub, AllocCategory::SubAlloc),
            (allocsz, AllocCategory::AllocSzFamily),
        ] {
            for d in descriptors {
                if l1_names.contains(d.name()) {
                    debug!(
                        "`{}` is already an L1 allocator; ignoring its {:?} descriptor",
                        d.name(),
                        category
                    );
                    continue;
                }
                set.add_allocator(d, category)?;
            }
        }
        for d in sub_frees.into_iter().chain(l1_frees) {
            set.add_free(d)?;
        }

        debug!("wrapping {} functions", set.names.len());
        Ok(set)
    }

    fn claim(&mut self, name: &str) -> Result<()> {
        if self.names.insert(name.to_string()) {
            Ok(())
        } else {
            Err(Error::DuplicateSpec(name.to_string()))
        }
    }

    fn add_allocator(&mut self, d: Descriptor, category: AllocCategory) -> Result<()> {
        if let Descriptor::Allocator {
            name,
            arg_kinds,
            return_kind,
        } = d
        {
            self.claim(&name)?;
            let size_arg_index = arg_kinds.iter().position(|c| c.is_ascii_uppercase());
            self.allocators.push(FunctionSpec {
                name,
                arg_kinds,
                return_kind,
                size_arg_index,
                category,
            });
        }
        Ok(())
    }

    fn add_free(&mut self, d: Descriptor) -> Result<()> {
        let (name, arg_kinds, owner) = match d {
            Descriptor::Free { name, arg_kinds } => (name, arg_kinds, None),
            Descriptor::SubFree {
                name,
                arg_kinds,
                owner,
            } => (name, arg_kinds, Some(owner)),
            Descriptor::Allocator { .. } => return Ok(()),
        };
        self.claim(&name)?;
        self.frees.push(FreeFunctionSpec {
            name,
            arg_kinds,
            owner,
        });
        Ok(())
    }

    /// Allocators in stub emission order: L1, then sub-allocators, then size
    /// family.
    pub fn allocators(&self) -> &[FunctionSpec] {
        &self.allocators
    }

    /// Deallocators in stub emission order: sub-frees first.
    pub fn frees(&self) -> &[FreeFunctionSpec] {
        &self.frees
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// All wrapped names, allocators first, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.allocators
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.frees.iter().map(|f| f.name.as_str()))
    }

    pub fn allocator(&self, name: &str) -> Option<&FunctionSpec> {
        self.allocators.iter().find(|a| a.name == name)
    }

    pub fn free(&self, name: &str) -> Option<&FreeFunctionSpec> {
        self.frees.iter().find(|f| f.name == name)
    }
}

fn parse_all(texts: &[String], kind: DescriptorKind) -> Result<Vec<Descriptor>> {
    texts
        .iter()
        .map(|t| {
            Descriptor::parse(t, kind).map_err(|e| {
                warn!("descriptor `{}` doesn't match {}", t, kind);
                e
            })
        })
        .collect()
}
