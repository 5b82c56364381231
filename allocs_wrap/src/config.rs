//! Wrapper configuration, read once from the process environment.
//!
//! Nothing else in the crate looks at environment variables; the `Config`
//! built at start-up is passed by reference to every component.

use crate::utils;

use std::env;
use std::path::PathBuf;

/// The five descriptor lists, still in their raw configured form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorLists {
    /// `LIBALLOCS_ALLOC_FNS`: top-level allocators and their wrappers.
    pub l1_allocs: Vec<String>,
    /// `LIBALLOCS_SUBALLOC_FNS`
    pub sub_allocs: Vec<String>,
    /// `LIBALLOCS_ALLOCSZ_FNS`
    pub allocsz_allocs: Vec<String>,
    /// `LIBALLOCS_FREE_FNS`
    pub l1_frees: Vec<String>,
    /// `LIBALLOCS_SUBFREE_FNS`
    pub sub_frees: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub descriptors: DescriptorLists,
    /// Resolve the allocator runtime by load-time preloading. Turned off with
    /// `LIBALLOCS_USE_PRELOAD=no`, in which case it is linked directly.
    pub use_preload: bool,
    /// `CC_IS_CLANG` hint; also inferred from the discovered compiler.
    pub cc_is_clang: bool,
    /// Root of the per-binary metadata tree (`ALLOCSITES_BASE`).
    pub allocsites_base: PathBuf,
    /// Root of the liballocs installation: `tools/` and `lib/` live here.
    pub liballocs_base: PathBuf,
    /// `DEBUG_CC`: chatty logging, and always surface make logs.
    pub debug: bool,
    /// Explicit compiler to wrap (`LIBALLOCS_CC`). Discovered if unset.
    pub cc: Option<PathBuf>,
    pub objcopy: PathBuf,
    pub ld: PathBuf,
    pub make: PathBuf,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Reads the configuration through `var`, which maps a variable name to
    /// its value.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let list = |name: &str| -> Vec<String> {
            var(name)
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or_default()
        };
        let tool = |name: &str, default: &str| -> PathBuf {
            var(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Self {
            descriptors: DescriptorLists {
                l1_allocs: list("LIBALLOCS_ALLOC_FNS"),
                sub_allocs: list("LIBALLOCS_SUBALLOC_FNS"),
                allocsz_allocs: list("LIBALLOCS_ALLOCSZ_FNS"),
                l1_frees: list("LIBALLOCS_FREE_FNS"),
                sub_frees: list("LIBALLOCS_SUBFREE_FNS"),
            },
            use_preload: var("LIBALLOCS_USE_PRELOAD").map_or(true, |v| v != "no"),
            cc_is_clang: var("CC_IS_CLANG").is_some(),
            allocsites_base: tool("ALLOCSITES_BASE", utils::DEFAULT_ALLOCSITES_BASE),
            liballocs_base: var("LIBALLOCS_BASE")
                .map(PathBuf::from)
                .unwrap_or_else(default_liballocs_base),
            debug: var("DEBUG_CC").is_some(),
            cc: var("LIBALLOCS_CC").filter(|v| !v.is_empty()).map(PathBuf::from),
            objcopy: tool("OBJCOPY", "objcopy"),
            ld: tool("LD", "ld"),
            make: tool("MAKE", "make"),
        }
    }

    /// `<liballocs>/tools`, home of the stub header and helper scripts.
    pub fn tools_dir(&self) -> PathBuf {
        self.liballocs_base.join("tools")
    }

    /// `<liballocs>/lib`, where the runtime libraries are installed.
    pub fn lib_dir(&self) -> PathBuf {
        self.liballocs_base.join("lib")
    }
}

/// The wrapper is installed as `<liballocs>/tools/allocscc` or
/// `<liballocs>/bin/allocscc`; either way the base is one level up.
fn default_liballocs_base() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(|p| p.parent()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[("LIBALLOCS_BASE", "/opt/liballocs")]);
        assert_eq!(cfg.descriptors, DescriptorLists::default());
        assert!(cfg.use_preload);
        assert!(!cfg.cc_is_clang);
        assert!(!cfg.debug);
        assert_eq!(cfg.cc, None);
        assert_eq!(cfg.objcopy, PathBuf::from("objcopy"));
        assert_eq!(cfg.allocsites_base, PathBuf::from(utils::DEFAULT_ALLOCSITES_BASE));
        assert_eq!(cfg.tools_dir(), PathBuf::from("/opt/liballocs/tools"));
        assert_eq!(cfg.lib_dir(), PathBuf::from("/opt/liballocs/lib"));
    }

    #[test]
    fn lists_split_on_any_whitespace() {
        let cfg = config(&[
            ("LIBALLOCS_ALLOC_FNS", "xmalloc(Z)p  xcalloc(zZ)p\txrealloc(pZ)p "),
            ("LIBALLOCS_SUBFREE_FNS", "pool_free(P)->pool_alloc"),
        ]);
        assert_eq!(
            cfg.descriptors.l1_allocs,
            vec!["xmalloc(Z)p", "xcalloc(zZ)p", "xrealloc(pZ)p"]
        );
        assert_eq!(cfg.descriptors.sub_frees, vec!["pool_free(P)->pool_alloc"]);
        assert!(cfg.descriptors.sub_allocs.is_empty());
    }

    #[test]
    fn toggles() {
        let cfg = config(&[
            ("LIBALLOCS_USE_PRELOAD", "no"),
            ("CC_IS_CLANG", "1"),
            ("DEBUG_CC", ""),
            ("ALLOCSITES_BASE", "/tmp/allocsites"),
            ("LIBALLOCS_CC", "/usr/bin/gcc-12"),
        ]);
        assert!(!cfg.use_preload);
        assert!(cfg.cc_is_clang);
        assert!(cfg.debug);
        assert_eq!(cfg.allocsites_base, PathBuf::from("/tmp/allocsites"));
        assert_eq!(cfg.cc, Some(PathBuf::from("/usr/bin/gcc-12")));

        // anything but an explicit "no" keeps preloading on
        let cfg = config(&[("LIBALLOCS_USE_PRELOAD", "yes")]);
        assert!(cfg.use_preload);
    }
}
