//! Builder for the stub translation unit.
//!
//! The unit is a list of macro definitions and invocations; the trampolines
//! themselves are expanded from `stubgen.h`. Everything written here must
//! keep one directive or invocation per line.

use crate::utils::WriteStr;

use std::io;
use std::path::Path;

/// Where a wrapper finds the allocation size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeExpr {
    /// The argument at `index`, tagged `tag`.
    Argument { index: usize, tag: char },
    /// A constant: the size of the type a typed allocator returns.
    Constant(u64),
}

/// Which trampoline macro to expand for a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper<'a> {
    Alloc { ret: Option<char> },
    SizeAlloc { ret: Option<char> },
    SubAlloc { ret: Option<char> },
    Free,
    SubFree { owner: &'a str },
}

/// Writes a stub unit to `W`.
///
/// Created by `StubUnitBuilder::create`, which emits the template include.
pub struct StubUnitBuilder<W: WriteStr> {
    writer: W,
}

impl<W: WriteStr> StubUnitBuilder<W> {
    pub fn create(mut writer: W, header: &Path) -> io::Result<Self> {
        writeln!(writer, "#include \"{}\"", header.display())?;
        Ok(Self { writer })
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Defines `arglist_<name>` and `arglist_nocomma_<name>`, the argument
    /// lists the wrapper macros use to declare and forward parameters.
    pub fn arg_lists(&mut self, name: &str, kinds: &[char]) -> io::Result<()> {
        let args: Vec<String> = kinds
            .iter()
            .enumerate()
            .map(|(i, c)| format!("make_arg({}, {})", i, c))
            .collect();
        self.define(&format!("arglist_{}(make_arg)", name), &args.join(", "))?;
        self.define(&format!("arglist_nocomma_{}(make_arg)", name), &args.concat())
    }

    pub fn size_arg(&mut self, name: &str, size: &SizeExpr) -> io::Result<()> {
        let value = match size {
            SizeExpr::Argument { index, tag } => format!("make_argname({}, {})", index, tag),
            SizeExpr::Constant(n) => n.to_string(),
        };
        self.define(&format!("size_arg_{}", name), &value)
    }

    pub fn ptr_arg(&mut self, name: &str, index: usize, tag: char) -> io::Result<()> {
        self.define(
            &format!("ptr_arg_{}", name),
            &format!("make_argname({}, {})", index, tag),
        )
    }

    pub fn wrapper(&mut self, name: &str, wrapper: Wrapper) -> io::Result<()> {
        let ret = |r: Option<char>| r.map(String::from).unwrap_or_default();
        match wrapper {
            Wrapper::Alloc { ret: r } => writeln!(self.writer, "make_wrapper({}, {})", name, ret(r)),
            Wrapper::SizeAlloc { ret: r } => {
                writeln!(self.writer, "make_size_wrapper({}, {})", name, ret(r))
            }
            Wrapper::SubAlloc { ret: r } => writeln!(
                self.writer,
                "make_suballocator_alloc_wrapper({}, {})",
                name,
                ret(r)
            ),
            Wrapper::Free => writeln!(self.writer, "make_free_wrapper({})", name),
            Wrapper::SubFree { owner } => writeln!(
                self.writer,
                "make_suballocator_free_wrapper({}, {})",
                name, owner
            ),
        }
    }

    fn define(&mut self, head: &str, body: &str) -> io::Result<()> {
        if body.is_empty() {
            writeln!(self.writer, "#define {}", head)
        } else {
            writeln!(self.writer, "#define {} {}", head, body)
        }
    }
}
