//! Allocation stub generation.
//!
//! For every wrapped function we emit a `__wrap_<f>` trampoline (expanded
//! from the `stubgen.h` template) that records the allocation site, size and
//! owning allocator before calling `__real_<f>`. All trampolines go into one
//! translation unit, compiled into one object that executables are linked
//! against.

mod unit;

pub use self::unit::{SizeExpr, StubUnitBuilder, Wrapper};

use crate::config::Config;
use crate::registry::{AllocCategory, WrappedSymbolSet};
use crate::tools::{Compiler, ExternalTools};
use crate::utils::{self, LogFile, StringWriter};
use crate::{Error, Result};

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Tokens identifying the lines that later patching works on.
const FAMILY_TOKENS: &[&str] = &["__real_", "__wrap_", "__current_"];

/// Writes the stub unit for `symbols` as C source text.
///
/// Typed allocators (no size argument) get their size from
/// `tools.allocated_type_size`, run against `objects`; if it has no answer the
/// whole generation fails with `MissingSizeInfo`.
pub fn generate_source<T>(
    symbols: &WrappedSymbolSet,
    header: &Path,
    tools: &T,
    objects: &[PathBuf],
) -> Result<String>
where
    T: ExternalTools + ?Sized,
{
    let mut unit = StubUnitBuilder::create(StringWriter(String::new()), header)?;

    for alloc in symbols.allocators() {
        unit.arg_lists(&alloc.name, &alloc.arg_kinds)?;

        let size = match alloc.size_arg_index {
            Some(index) => SizeExpr::Argument {
                index,
                tag: alloc.arg_kinds[index],
            },
            None => match tools.allocated_type_size(&alloc.name, objects)? {
                Some(size) => SizeExpr::Constant(size),
                None => {
                    warn!("no static type size found for `{}`", alloc.name);
                    return Err(Error::MissingSizeInfo(alloc.name.clone()));
                }
            },
        };
        unit.size_arg(&alloc.name, &size)?;

        let ret = alloc.return_kind;
        let wrapper = match alloc.category {
            AllocCategory::L1Alloc => Wrapper::Alloc { ret },
            AllocCategory::AllocSzFamily => Wrapper::SizeAlloc { ret },
            AllocCategory::SubAlloc => Wrapper::SubAlloc { ret },
        };
        unit.wrapper(&alloc.name, wrapper)?;
    }

    for free in symbols.frees() {
        if let Some(index) = free.ptr_arg_index() {
            unit.ptr_arg(&free.name, index, free.arg_kinds[index])?;
        }
        unit.arg_lists(&free.name, &free.arg_kinds)?;
        let wrapper = match &free.owner {
            Some(owner) => Wrapper::SubFree {
                owner: owner.as_str(),
            },
            None => Wrapper::Free,
        };
        unit.wrapper(&free.name, wrapper)?;
    }

    Ok(unit.into_writer().0)
}

/// Cleans up preprocessor output so later patching can work line by line.
///
/// Line markers pointing into `stubgen.h` are dropped, and any line mentioning
/// a wrap/real/current-site token is broken after every `;`, `{` and `}`.
pub fn normalize_preprocessed(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.starts_with('#') && line.contains("stubgen.h\"") {
            continue;
        }
        if FAMILY_TOKENS.iter().any(|t| line.contains(t)) {
            for c in line.chars() {
                out.push(c);
                if c == ';' || c == '{' || c == '}' {
                    out.push('\n');
                }
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// The files one stub build produces, all named after the link output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubPaths {
    pub source: PathBuf,
    pub preprocessed: PathBuf,
    pub object: PathBuf,
    /// Diagnostics of the preprocess and compile steps.
    pub log: PathBuf,
}

impl StubPaths {
    pub fn for_output(output: &Path) -> Self {
        let with = |ext: &str| {
            let mut name = OsString::from(output.as_os_str());
            name.push(".allocstubs");
            name.push(ext);
            PathBuf::from(name)
        };
        Self {
            source: with(".c"),
            preprocessed: with(".i"),
            object: with(".o"),
            log: with(".log"),
        }
    }
}

/// Generates and compiles the stub object for a link.
pub struct StubGenerator<'a> {
    config: &'a Config,
    compiler: &'a Compiler,
    tools: &'a dyn ExternalTools,
}

impl<'a> StubGenerator<'a> {
    pub fn new(config: &'a Config, compiler: &'a Compiler, tools: &'a dyn ExternalTools) -> Self {
        Self {
            config,
            compiler,
            tools,
        }
    }

    /// Builds the stub object for the link producing `output` and returns its
    /// path.
    ///
    /// Only `-D` flags from `pass_through` reach the preprocessor; the compile
    /// itself uses a fixed flag set, plus `-fPIC` if `pic` is set.
    pub fn generate(
        &self,
        symbols: &WrappedSymbolSet,
        output: &Path,
        pass_through: &[String],
        pic: bool,
    ) -> Result<PathBuf> {
        let paths = StubPaths::for_output(output);
        let header = self.config.tools_dir().join("stubgen.h");
        let objects: Vec<PathBuf> = pass_through
            .iter()
            .filter(|a| a.ends_with(".o"))
            .map(PathBuf::from)
            .collect();

        // sizes are resolved before anything touches the disk
        let source = generate_source(symbols, &header, self.tools, &objects)?;
        debug!("stubs file is {}", paths.source.display());
        fs::write(&paths.source, source)?;

        let mut log = LogFile::create(&paths.log)?;
        let result = self.compile_stubs(&paths, &mut log, pass_through, pic);
        if result.is_err() {
            log.surface();
        }
        result?;

        if !paths.object.exists() {
            return Err(Error::MissingOutputArtifact(paths.object));
        }
        Ok(paths.object)
    }

    fn compile_stubs(
        &self,
        paths: &StubPaths,
        log: &mut LogFile,
        pass_through: &[String],
        pic: bool,
    ) -> Result<()> {
        let include = {
            let mut flag = OsString::from("-I");
            flag.push(self.config.tools_dir());
            flag
        };
        let pic_flags: &[&str] = if pic { &["-fPIC"] } else { &[] };

        let mut pp = self.compiler.command();
        pp.args(&["-std=c11", "-E", "-Wp,-P"])
            .args(pic_flags)
            .arg("-o")
            .arg(&paths.preprocessed)
            .arg(&include)
            .args(crate::args::define_flags(pass_through))
            .arg(&paths.source);
        utils::run(&mut pp, Some(&mut *log)).map_err(|e| {
            error!("could not preprocess stubs file {}", paths.source.display());
            e
        })?;

        let text = fs::read_to_string(&paths.preprocessed)?;
        fs::write(&paths.preprocessed, normalize_preprocessed(&text))?;

        let mut cc = self.compiler.command();
        cc.args(&["-std=c11", "-g"])
            .args(pic_flags)
            .arg("-c")
            .arg("-o")
            .arg(&paths.object)
            .arg(&include)
            .arg(&paths.preprocessed);
        utils::run(&mut cc, Some(log)).map_err(|e| {
            error!("could not compile stubs file {}", paths.preprocessed.display());
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptorLists;
    use crate::utils::LogFile;

    use std::cell::RefCell;

    /// Size lookup answering from a fixed table, recording each query.
    struct FixedSizes {
        sizes: Vec<(&'static str, u64)>,
        asked: RefCell<Vec<(String, Vec<PathBuf>)>>,
    }

    impl FixedSizes {
        fn new(sizes: Vec<(&'static str, u64)>) -> Self {
            Self {
                sizes,
                asked: RefCell::new(Vec::new()),
            }
        }
    }

    impl ExternalTools for FixedSizes {
        fn link_used_types(&self, _: &Path, _: &mut LogFile) -> Result<()> {
            Ok(())
        }

        fn allocated_type_size(&self, allocator: &str, objects: &[PathBuf]) -> Result<Option<u64>> {
            self.asked
                .borrow_mut()
                .push((allocator.to_string(), objects.to_vec()));
            Ok(self
                .sizes
                .iter()
                .find(|(name, _)| *name == allocator)
                .map(|(_, size)| *size))
        }
    }

    fn symbols(l1: &[&str], sub: &[&str], sz: &[&str], free: &[&str], subfree: &[&str]) -> WrappedSymbolSet {
        let v = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        WrappedSymbolSet::parse(&DescriptorLists {
            l1_allocs: v(l1),
            sub_allocs: v(sub),
            allocsz_allocs: v(sz),
            l1_frees: v(free),
            sub_frees: v(subfree),
        })
        .unwrap()
    }

    #[test]
    fn stub_unit() {
        let syms = symbols(
            &["xmalloc(Z)P", "new_node()p"],
            &["pool_alloc(pZ)p"],
            &["sz_alloc(Z)p"],
            &["xfree(P)"],
            &["pool_free(P)->pool_alloc"],
        );
        let tools = FixedSizes::new(vec![("new_node", 24)]);
        let objects = vec![PathBuf::from("main.o"), PathBuf::from("node.o")];
        let output = generate_source(
            &syms,
            Path::new("/opt/liballocs/tools/stubgen.h"),
            &tools,
            &objects,
        )
        .unwrap();

        // only the typed allocator needs the lookup
        assert_eq!(
            *tools.asked.borrow(),
            vec![("new_node".to_string(), objects.clone())]
        );

        let mut settings = insta::Settings::clone_current();
        settings.set_prepend_module_to_snapshot(false);
        settings.bind(|| {
            assert_snapshot!("stub_unit", output);
        });
    }

    #[test]
    fn l1_allocator_reads_its_size_argument() {
        let syms = symbols(&["xmalloc(Z)P"], &[], &[], &[], &[]);
        let tools = FixedSizes::new(vec![]);
        let out = generate_source(&syms, Path::new("stubgen.h"), &tools, &[]).unwrap();
        assert!(out.contains("#define size_arg_xmalloc make_argname(0, Z)\n"));
        assert!(out.contains("make_wrapper(xmalloc, P)\n"));
        assert!(tools.asked.borrow().is_empty());
    }

    #[test]
    fn sub_free_threads_its_owner() {
        let syms = symbols(&[], &[], &[], &[], &["pool_free(P)->pool_alloc"]);
        let tools = FixedSizes::new(vec![]);
        let out = generate_source(&syms, Path::new("stubgen.h"), &tools, &[]).unwrap();
        assert!(out.contains("#define ptr_arg_pool_free make_argname(0, P)\n"));
        assert!(out.contains("make_suballocator_free_wrapper(pool_free, pool_alloc)\n"));
    }

    #[test]
    fn unresolvable_typed_allocator() {
        let syms = symbols(&["xmalloc(Z)p", "new_node()p"], &[], &[], &[], &[]);
        let tools = FixedSizes::new(vec![]);
        match generate_source(&syms, Path::new("stubgen.h"), &tools, &[]) {
            Err(Error::MissingSizeInfo(name)) => assert_eq!(name, "new_node"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_size_fails_before_compiling() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("prog");
        let mut config = Config::from_vars(|_| None);
        config.liballocs_base = dir.path().to_path_buf();
        // a compiler that must never run
        let compiler = Compiler {
            path: PathBuf::from("/nonexistent/cc"),
            is_clang: false,
        };
        let tools = FixedSizes::new(vec![]);
        let generator = StubGenerator::new(&config, &compiler, &tools);

        let syms = symbols(&["new_node()p"], &[], &[], &[], &[]);
        let r = generator.generate(&syms, &output, &["node.o".to_string()], false);
        match r {
            Err(Error::MissingSizeInfo(name)) => assert_eq!(name, "new_node"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!StubPaths::for_output(&output).source.exists());
    }

    #[test]
    fn failed_preprocess_is_logged() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("prog");
        let mut config = Config::from_vars(|_| None);
        config.liballocs_base = dir.path().to_path_buf();
        let compiler = Compiler {
            path: PathBuf::from("false"),
            is_clang: false,
        };
        let tools = FixedSizes::new(vec![]);
        let generator = StubGenerator::new(&config, &compiler, &tools);

        let syms = symbols(&["xmalloc(Z)p"], &[], &[], &[], &[]);
        match generator.generate(&syms, &output, &[], false) {
            Err(Error::SubprocessFailure { code, .. }) => assert_eq!(code, 1),
            other => panic!("unexpected {:?}", other),
        }
        let log = fs::read_to_string(StubPaths::for_output(&output).log).unwrap();
        assert!(log.contains("-E -Wp,-P"));
        assert!(log.contains("Exit status was 1"));
    }

    #[test]
    fn normalization() {
        let pp = "# 1 \"/opt/liballocs/tools/stubgen.h\" 1\n\
                  int x;\n\
                  void *__wrap_xmalloc(size_t a0) { void *r = __real_xmalloc(a0); return r; }\n\
                  # 12 \"prog.allocstubs.c\"\n";
        assert_eq!(
            normalize_preprocessed(pp),
            "int x;\n\
             void *__wrap_xmalloc(size_t a0) {\n void *r = __real_xmalloc(a0);\n return r;\n }\n\n\
             # 12 \"prog.allocstubs.c\"\n"
        );
    }

    #[test]
    fn stub_paths_follow_output() {
        let paths = StubPaths::for_output(Path::new("build/prog"));
        assert_eq!(paths.source, PathBuf::from("build/prog.allocstubs.c"));
        assert_eq!(paths.preprocessed, PathBuf::from("build/prog.allocstubs.i"));
        assert_eq!(paths.object, PathBuf::from("build/prog.allocstubs.o"));
        assert_eq!(paths.log, PathBuf::from("build/prog.allocstubs.log"));
    }
}
