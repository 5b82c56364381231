//! Sequencing of one wrapped compiler invocation.

use crate::args::{self, BuildMode, Invocation};
use crate::config::Config;
use crate::fixup::FixupEngine;
use crate::link::LinkOrchestrator;
use crate::metadata;
use crate::registry::WrappedSymbolSet;
use crate::stubgen::StubGenerator;
use crate::symbols::SymbolTableEditor;
use crate::tools::{Compiler, ExternalTools};
use crate::utils;
use crate::Result;

use tempfile::TempDir;

use std::path::{Path, PathBuf};

/// Flags that make the stub object position-independent too.
const PIC_FLAGS: &[&str] = &["-fPIC", "-fpic", "-pie", "-shared"];

pub struct Driver<'a> {
    config: &'a Config,
    symbols: &'a WrappedSymbolSet,
    compiler: &'a Compiler,
    editor: &'a dyn SymbolTableEditor,
    tools: &'a dyn ExternalTools,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: &'a Config,
        symbols: &'a WrappedSymbolSet,
        compiler: &'a Compiler,
        editor: &'a dyn SymbolTableEditor,
        tools: &'a dyn ExternalTools,
    ) -> Self {
        Self {
            config,
            symbols,
            compiler,
            editor,
            tools,
        }
    }

    fn fixup(&self) -> FixupEngine<'_> {
        FixupEngine::new(self.symbols, self.editor, self.tools)
    }

    /// Runs the compiler for `args` (without `argv[0]`) and post-processes
    /// whatever it produced. Stops at the first failure.
    pub fn run(&self, args: Vec<String>) -> Result<()> {
        let inv = Invocation::parse(args);
        let mode = inv.build_mode();
        debug!("{:?}: {}", mode, inv.args.join(" "));
        if self.symbols.is_empty() {
            debug!("no allocation functions configured");
        }

        match mode {
            BuildMode::Compile => self.compile(&inv),
            _ => self.link(&inv, mode),
        }
    }

    fn compile(&self, inv: &Invocation) -> Result<()> {
        let mut cmd = self.compiler.command();
        cmd.args(self.compiler.instrumentation_flags()).args(&inv.args);
        utils::run(&mut cmd, None)?;

        let fixup = self.fixup();
        for object in inv.compile_outputs() {
            fixup.fixup_object(&object)?;
        }
        Ok(())
    }

    fn link(&self, inv: &Invocation, mode: BuildMode) -> Result<()> {
        // objects built from source inputs live until the link is done
        let scratch;
        let pass_through = if inv.sources.is_empty() {
            inv.args.clone()
        } else {
            scratch = TempDir::new()?;
            self.compile_sources(inv, scratch.path())?
        };

        let orchestrator = LinkOrchestrator::new(self.config, self.symbols);
        let policy = orchestrator.policy(mode);
        let output = inv.link_output();

        let stub = if policy.compile_stub {
            let pic = pass_through.iter().any(|a| PIC_FLAGS.contains(&a.as_str()));
            let generator = StubGenerator::new(self.config, self.compiler, self.tools);
            Some(generator.generate(self.symbols, &output, &pass_through, pic)?)
        } else {
            None
        };

        let link_args = orchestrator.plan(mode, &pass_through, stub.as_deref())?;
        let mut cmd = self.compiler.command();
        cmd.args(&link_args);
        utils::run(&mut cmd, None)?;

        match mode {
            BuildMode::LinkRelocatable => Ok(()),
            _ => {
                if mode.is_executable() {
                    self.fixup().fixup_linked_object(&output)?;
                }
                metadata::build_metadata(self.config, &output)
            }
        }
    }

    /// Compiles and fixes up each source input of a link command, returning
    /// the arguments with every source replaced by its object.
    fn compile_sources(&self, inv: &Invocation, dir: &Path) -> Result<Vec<String>> {
        let flags = inv.compile_flags();
        let fixup = self.fixup();
        let mut objects: Vec<(&PathBuf, PathBuf)> = Vec::new();

        for (i, source) in inv.sources.iter().enumerate() {
            // numbered so that `a/util.c` and `b/util.c` don't collide
            let name = args::object_name_for(source);
            let object = dir.join(format!("{}-{}", i, name.display()));
            info!("compiling '{}' ahead of the link", source.display());

            let mut cmd = self.compiler.command();
            cmd.args(&flags)
                .args(self.compiler.instrumentation_flags())
                .arg("-c")
                .arg(source)
                .arg("-o")
                .arg(&object);
            utils::run(&mut cmd, None)?;
            fixup.fixup_object(&object)?;
            objects.push((source, object));
        }

        Ok(inv
            .args
            .iter()
            .map(|arg| {
                objects
                    .iter()
                    .find(|(source, _)| source.as_os_str() == arg.as_str())
                    .map(|(_, object)| object.to_string_lossy().into_owned())
                    .unwrap_or_else(|| arg.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptorLists;
    use crate::symbols::DefinedSymbol;
    use crate::utils::LogFile;
    use crate::Error;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// An editor for objects that define nothing.
    struct EmptyTables;

    impl SymbolTableEditor for EmptyTables {
        fn list_defined_symbols(&self, _: &Path) -> Result<Vec<DefinedSymbol>> {
            Ok(Vec::new())
        }

        fn split_definition_from_references(
            &self,
            _: &Path,
            _: &[String],
            _: &mut LogFile,
        ) -> Result<()> {
            unreachable!()
        }

        fn rename_symbols(&self, _: &Path, _: &[(String, String)], _: &mut LogFile) -> Result<()> {
            unreachable!()
        }

        fn define_aliases(&self, _: &Path, _: &[(String, String)], _: &mut LogFile) -> Result<()> {
            unreachable!()
        }

        fn promote_to_global(&self, _: &Path, _: &[String], _: &mut LogFile) -> Result<()> {
            unreachable!()
        }
    }

    struct NoTools;

    impl ExternalTools for NoTools {
        fn link_used_types(&self, _: &Path, _: &mut LogFile) -> Result<()> {
            Ok(())
        }

        fn allocated_type_size(&self, _: &str, _: &[PathBuf]) -> Result<Option<u64>> {
            Ok(None)
        }
    }

    /// A scratch directory holding a fake `cc` that records its arguments
    /// and creates whatever `-o` names.
    struct Sandbox {
        dir: TempDir,
        config: Config,
        symbols: WrappedSymbolSet,
        compiler: Compiler,
    }

    impl Sandbox {
        fn new(exit_code: i32) -> Self {
            let dir = TempDir::new().unwrap();
            let cc = dir.path().join("cc");
            let script = format!(
                "#!/bin/sh\n\
                 printf '%s\\n' \"$@\" >> '{calls}'\n\
                 echo -- >> '{calls}'\n\
                 out=\n\
                 while [ $# -gt 0 ]; do\n\
                 \x20 if [ \"$1\" = -o ]; then out=\"$2\"; fi\n\
                 \x20 shift\n\
                 done\n\
                 if [ -n \"$out\" ]; then : > \"$out\"; fi\n\
                 exit {code}\n",
                calls = dir.path().join("calls").display(),
                code = exit_code
            );
            fs::write(&cc, script).unwrap();
            fs::set_permissions(&cc, fs::Permissions::from_mode(0o755)).unwrap();

            let mut config = Config::from_vars(|_| None);
            config.liballocs_base = dir.path().join("liballocs");
            config.allocsites_base = dir.path().join("allocsites");
            config.make = PathBuf::from("true");
            let symbols = WrappedSymbolSet::parse(&DescriptorLists {
                l1_allocs: vec!["xmalloc(Z)p".into()],
                ..DescriptorLists::default()
            })
            .unwrap();

            Self {
                compiler: Compiler {
                    path: cc,
                    is_clang: true,
                },
                dir,
                config,
                symbols,
            }
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).to_string_lossy().into_owned()
        }

        fn run(&self, args: &[&str]) -> Result<()> {
            let driver = Driver::new(
                &self.config,
                &self.symbols,
                &self.compiler,
                &EmptyTables,
                &NoTools,
            );
            driver.run(args.iter().map(|s| s.to_string()).collect())
        }

        /// The argument lists `cc` was called with, in order.
        fn calls(&self) -> Vec<Vec<String>> {
            let text = fs::read_to_string(self.dir.path().join("calls")).unwrap_or_default();
            text.split("--\n")
                .filter(|c| !c.is_empty())
                .map(|c| c.lines().map(String::from).collect())
                .collect()
        }
    }

    #[test]
    fn compile_adds_instrumentation_and_fixes_up() {
        let sb = Sandbox::new(0);
        let obj = sb.path("alloc.o");
        sb.run(&["-O2", "-c", "alloc.c", "-o", &obj]).unwrap();

        let calls = sb.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                "-gdwarf-4",
                "-gstrict-dwarf",
                "-fno-omit-frame-pointer",
                "-ffunction-sections",
                "-O2",
                "-c",
                "alloc.c",
                "-o",
                obj.as_str(),
            ]
        );
        assert!(Path::new(&format!("{}.fixuplog", obj)).exists());
    }

    #[test]
    fn compiler_failure_propagates_its_status() {
        let sb = Sandbox::new(4);
        let obj = sb.path("alloc.o");
        let err = sb.run(&["-c", "alloc.c", "-o", &obj]).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        // no fixup after a failed compile
        assert!(!Path::new(&format!("{}.fixuplog", obj)).exists());
    }

    #[test]
    fn partial_link_passes_through() {
        let sb = Sandbox::new(0);
        let out = sb.path("ab.o");
        sb.run(&["-r", "a.o", "b.o", "-o", &out]).unwrap();

        assert_eq!(sb.calls(), vec![vec!["-r", "a.o", "b.o", "-o", out.as_str()]]);
        assert!(!Path::new(&format!("{}.allocstubs.c", out)).exists());
        assert!(!sb.dir.path().join("allocsites").exists());
    }

    #[test]
    fn executable_link() {
        let sb = Sandbox::new(0);
        let prog = sb.path("prog");
        sb.run(&["main.o", "-o", &prog]).unwrap();

        let stub_c = format!("{}.allocstubs.c", prog);
        let stub_o = format!("{}.allocstubs.o", prog);
        let source = fs::read_to_string(&stub_c).unwrap();
        assert!(source.contains("make_wrapper(xmalloc, p)"));

        let calls = sb.calls();
        // preprocess, compile the stub, link
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains(&"-E".to_string()));
        assert_eq!(calls[1].last(), Some(&format!("{}.allocstubs.i", prog)));
        let link = &calls[2];
        assert_eq!(link[0], stub_o);
        assert!(link.contains(&"-Wl,--wrap,xmalloc".to_string()));
        assert!(link.contains(&"-Wl,--undefined=__current_allocsite".to_string()));

        assert!(Path::new(&format!("{}.fixuplog", prog)).exists());
        let real = fs::canonicalize(&prog).unwrap();
        let makelog = format!(
            "{}{}.makelog",
            sb.dir.path().join("allocsites").display(),
            real.display()
        );
        assert!(Path::new(&makelog).exists());
    }

    #[test]
    fn shared_library_link_has_no_stub() {
        let sb = Sandbox::new(0);
        let lib = sb.path("libx.so");
        sb.run(&["-shared", "x.o", "-o", &lib]).unwrap();

        let calls = sb.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "-shared");
        assert!(!Path::new(&format!("{}.allocstubs.c", lib)).exists());
        // libraries aren't checked like executables, but do get metadata
        assert!(!Path::new(&format!("{}.fixuplog", lib)).exists());
    }

    #[test]
    fn sources_in_links_are_compiled_first() {
        let sb = Sandbox::new(0);
        let prog = sb.path("prog");
        sb.run(&["-O1", "src/main.c", "util.o", "-lm", "-o", &prog])
            .unwrap();

        let calls = sb.calls();
        let compile = &calls[0];
        assert_eq!(&compile[..2], &["-O1".to_string(), "-gdwarf-4".to_string()]);
        assert!(compile.contains(&"src/main.c".to_string()));
        let object = compile.last().unwrap().clone();
        assert!(object.ends_with("0-main.o"));

        let link = calls.last().unwrap();
        assert!(link.contains(&object));
        assert!(!link.contains(&"src/main.c".to_string()));
        let pos = |a: &str| link.iter().position(|x| x == a).unwrap();
        assert!(pos(&object) < pos("util.o"));
        assert!(pos("util.o") < pos("-lm"));
    }

    #[test]
    fn missing_size_aborts_the_link() {
        let mut sb = Sandbox::new(0);
        sb.symbols = WrappedSymbolSet::parse(&DescriptorLists {
            l1_allocs: vec!["new_node()p".into()],
            ..DescriptorLists::default()
        })
        .unwrap();
        let prog = sb.path("prog");

        match sb.run(&["node.o", "-o", &prog]) {
            Err(Error::MissingSizeInfo(name)) => assert_eq!(name, "new_node"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sb.calls().is_empty());
    }
}
