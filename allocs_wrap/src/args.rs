//! Classification of a `cc`-style command line.
//!
//! We only need to know enough to pick a build mode and find the files we
//! must post-process; everything else is passed through untouched.

use std::path::{Path, PathBuf};

/// The shape of the output a command produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildMode {
    /// Compile (and maybe assemble) without linking.
    Compile,
    /// `-r`: partial link into a relocatable object.
    LinkRelocatable,
    /// `-shared`
    LinkSharedLibrary,
    LinkExecutableDynamic,
    /// `-static`
    LinkExecutableStatic,
}

impl BuildMode {
    pub fn is_link(self) -> bool {
        self != BuildMode::Compile
    }

    pub fn is_executable(self) -> bool {
        match self {
            BuildMode::LinkExecutableDynamic | BuildMode::LinkExecutableStatic => true,
            _ => false,
        }
    }
}

/// Options whose value is the following, separate argument.
const OPTIONS_WITH_VALUE: &[&str] = &[
    "-o",
    "-I",
    "-L",
    "-l",
    "-D",
    "-U",
    "-x",
    "-u",
    "-T",
    "-z",
    "-MF",
    "-MT",
    "-MQ",
    "-include",
    "-imacros",
    "-isystem",
    "-iquote",
    "-idirafter",
    "-isysroot",
    "-Xlinker",
    "-Xpreprocessor",
    "-Xassembler",
    "-aux-info",
];

/// Flags that mean no object file will be written.
const STOPS_BEFORE_OBJECT: &[&str] = &["-E", "-S", "-fsyntax-only", "-M", "-MM"];

const SOURCE_EXTENSIONS: &[&str] = &["c", "i", "s", "S", "cc", "cpp", "cxx", "C", "ii", "m"];

/// A classified compiler command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The arguments as given, minus `argv[0]`.
    pub args: Vec<String>,
    pub sources: Vec<PathBuf>,
    /// Object, archive and shared library inputs.
    pub link_inputs: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub is_link: bool,
    pub stops_before_object: bool,
}

impl Invocation {
    pub fn parse(args: Vec<String>) -> Self {
        let mut sources = Vec::new();
        let mut link_inputs = Vec::new();
        let mut output = None;
        let mut compile_only = false;
        let mut stops_before_object = false;

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let arg = arg.as_str();
            if arg == "-o" {
                output = iter.next().map(PathBuf::from);
            } else if let Some(joined) = arg.strip_prefix("-o") {
                output = Some(PathBuf::from(joined));
            } else if OPTIONS_WITH_VALUE.contains(&arg) {
                iter.next();
            } else if arg == "-c" {
                compile_only = true;
            } else if STOPS_BEFORE_OBJECT.contains(&arg) {
                compile_only = true;
                stops_before_object = true;
            } else if arg.starts_with('-') {
                // other flags
            } else if is_source(arg) {
                sources.push(PathBuf::from(arg));
            } else {
                link_inputs.push(PathBuf::from(arg));
            }
        }

        Self {
            args,
            sources,
            link_inputs,
            output,
            is_link: !compile_only,
            stops_before_object,
        }
    }

    fn has_flag(&self, flags: &[&str]) -> bool {
        self.args.iter().any(|a| flags.contains(&a.as_str()))
    }

    /// Derives the build mode from link-only selector flags.
    pub fn build_mode(&self) -> BuildMode {
        if !self.is_link {
            BuildMode::Compile
        } else if self.has_flag(&["-r", "-Wl,-r", "-Wl,--relocatable"]) {
            BuildMode::LinkRelocatable
        } else if self.has_flag(&["-shared", "-G"]) {
            BuildMode::LinkSharedLibrary
        } else if self.has_flag(&["-static", "-Bstatic"]) {
            // `-Wl,-Bstatic` only switches how the following libraries are
            // searched; the executable itself stays dynamic
            BuildMode::LinkExecutableStatic
        } else {
            BuildMode::LinkExecutableDynamic
        }
    }

    /// The objects a compile-only command leaves behind.
    ///
    /// With `-o` that is the named output; otherwise the compiler writes one
    /// `<stem>.o` per source into the working directory.
    pub fn compile_outputs(&self) -> Vec<PathBuf> {
        if self.stops_before_object || self.is_link {
            return Vec::new();
        }
        match &self.output {
            Some(out) => vec![out.clone()],
            None => self.sources.iter().map(|s| object_name_for(s)).collect(),
        }
    }

    /// The linked output; `a.out` unless named.
    pub fn link_output(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from("a.out"))
    }

    /// Preprocessor definitions, the only flags the stub unit inherits.
    pub fn define_flags(&self) -> Vec<String> {
        define_flags(&self.args)
    }

    /// The arguments relevant to compiling a single source on its own: no
    /// inputs, no output, no link-only flags.
    pub fn compile_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            let a = arg.as_str();
            if a == "-o" || a == "-L" || a == "-l" || a == "-Xlinker" || a == "-u" || a == "-T" || a == "-z" {
                iter.next();
            } else if OPTIONS_WITH_VALUE.contains(&a) {
                flags.push(arg.clone());
                if let Some(v) = iter.next() {
                    flags.push(v.clone());
                }
            } else if a.starts_with("-o") {
                // joined output
            } else if a.starts_with('-') {
                if !is_link_only_flag(a) {
                    flags.push(arg.clone());
                }
            }
        }
        flags
    }
}

/// `-D` flags from an argument list, in both `-DX` and `-D X` forms.
pub fn define_flags(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-D" {
            if let Some(v) = iter.next() {
                out.push(format!("-D{}", v));
            }
        } else if arg.starts_with("-D") {
            out.push(arg.clone());
        }
    }
    out
}

fn is_link_only_flag(flag: &str) -> bool {
    flag.starts_with("-Wl,")
        || flag.starts_with("-L")
        || flag.starts_with("-l")
        || match flag {
            "-shared" | "-G" | "-static" | "-Bstatic" | "-r" | "-pie" | "-no-pie" | "-rdynamic"
            | "-nostdlib" | "-nostartfiles" | "-nodefaultlibs" | "-c" | "-E" | "-S" => true,
            _ => false,
        }
}

fn is_source(arg: &str) -> bool {
    Path::new(arg)
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| SOURCE_EXTENSIONS.contains(&e))
}

/// `dir/foo.c` compiles to `foo.o` in the working directory.
pub fn object_name_for(source: &Path) -> PathBuf {
    let mut name = source
        .file_stem()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("a"));
    name.set_extension("o");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(line: &str) -> Invocation {
        Invocation::parse(line.split_whitespace().map(String::from).collect())
    }

    #[test]
    fn compile_only() {
        let i = inv("-O2 -c -o build/foo.o -I include src/foo.c");
        assert!(!i.is_link);
        assert_eq!(i.build_mode(), BuildMode::Compile);
        assert_eq!(i.sources, vec![PathBuf::from("src/foo.c")]);
        assert!(i.link_inputs.is_empty());
        assert_eq!(i.compile_outputs(), vec![PathBuf::from("build/foo.o")]);
    }

    #[test]
    fn compile_many_without_output() {
        let i = inv("-c src/a.c lib/b.c");
        assert_eq!(
            i.compile_outputs(),
            vec![PathBuf::from("a.o"), PathBuf::from("b.o")]
        );
    }

    #[test]
    fn preprocess_only_has_no_object() {
        let i = inv("-E foo.c -o foo.i");
        assert!(!i.is_link);
        assert!(i.stops_before_object);
        assert!(i.compile_outputs().is_empty());
    }

    #[test]
    fn link_modes() {
        assert_eq!(inv("a.o b.o -o prog").build_mode(), BuildMode::LinkExecutableDynamic);
        assert_eq!(inv("-static a.o -o prog").build_mode(), BuildMode::LinkExecutableStatic);
        assert_eq!(inv("-shared -fPIC a.o -o libx.so").build_mode(), BuildMode::LinkSharedLibrary);
        assert_eq!(inv("-r a.o b.o -o ab.o").build_mode(), BuildMode::LinkRelocatable);
        assert_eq!(inv("-Wl,-r a.o -o ab.o").build_mode(), BuildMode::LinkRelocatable);
        // a partial link wins over everything else
        assert_eq!(inv("-r -static a.o -o ab.o").build_mode(), BuildMode::LinkRelocatable);
        assert!(BuildMode::LinkExecutableStatic.is_executable());
        assert!(!BuildMode::LinkSharedLibrary.is_executable());
    }

    #[test]
    fn static_library_section_keeps_executable_dynamic() {
        let i = inv("main.o -Wl,-Bstatic -lfoo -Wl,-Bdynamic -o prog");
        assert_eq!(i.build_mode(), BuildMode::LinkExecutableDynamic);
        assert_eq!(inv("-Bstatic main.o -o prog").build_mode(), BuildMode::LinkExecutableStatic);
    }

    #[test]
    fn joined_output() {
        let i = inv("-c src/foo.c -obuild/foo.o");
        assert_eq!(i.output, Some(PathBuf::from("build/foo.o")));
        assert_eq!(i.compile_outputs(), vec![PathBuf::from("build/foo.o")]);

        let i = inv("-O2 main.c util.o -oprog");
        assert_eq!(i.link_output(), PathBuf::from("prog"));
        assert_eq!(i.compile_flags(), vec!["-O2"]);
    }

    #[test]
    fn link_inputs_and_output() {
        let i = inv("main.c util.o libfoo.a -L /opt/lib -lm -o prog");
        assert!(i.is_link);
        assert_eq!(i.sources, vec![PathBuf::from("main.c")]);
        assert_eq!(
            i.link_inputs,
            vec![PathBuf::from("util.o"), PathBuf::from("libfoo.a")]
        );
        assert_eq!(i.link_output(), PathBuf::from("prog"));
        assert_eq!(inv("a.o").link_output(), PathBuf::from("a.out"));
    }

    #[test]
    fn only_defines_reach_the_stubs() {
        let i = inv("-O2 -DNO_TLS -D DEBUG=1 -I inc -Wall a.o -o prog");
        assert_eq!(i.define_flags(), vec!["-DNO_TLS", "-DDEBUG=1"]);
    }

    #[test]
    fn compile_flags_drop_link_options() {
        let i = inv("-O2 -g -DX -I inc main.c util.o -Wl,--gc-sections -L /opt -lm -static -o prog");
        assert_eq!(i.compile_flags(), vec!["-O2", "-g", "-DX", "-I", "inc"]);
    }
}
