//! External device-library discovery.
//!
//! Libraries to link come from three places: per-symbol library
//! annotations on extern declarations, the module-level library
//! dictionary, and the implicit default math library pulled in whenever
//! the module calls any external symbol at all.
//!
//! The default math library file is searched in order:
//!   1. the `TENSILE_MATHLIB_PATH` environment variable
//!   2. `mathlib.tm` next to the compiler binary (and two ancestors)
//!   3. `runtime/mathlib.tm` in the source tree (development)

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::ir::Module;

/// Name of the implicitly linked math library.
pub const DEFAULT_MATHLIB: &str = "mathlib";

const MATHLIB_FILE: &str = "mathlib.tm";
pub const MATHLIB_ENV: &str = "TENSILE_MATHLIB_PATH";

/// A required library could not be located on disk.
#[derive(Debug)]
pub struct MissingLib {
    pub name: String,
}

impl fmt::Display for MissingLib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "external library '{}' could not be located", self.name)
    }
}

/// Resolves library names to files. The environment is read once at
/// construction so the pipeline sees one consistent view.
#[derive(Clone, Debug, Default)]
pub struct LibResolver {
    /// Explicit math-library location; authoritative when set.
    pub mathlib_override: Option<PathBuf>,
}

impl LibResolver {
    pub fn from_env() -> Self {
        Self {
            mathlib_override: std::env::var(MATHLIB_ENV).ok().map(PathBuf::from),
        }
    }

    /// Gather every library the module needs, name → file path.
    pub fn collect(&self, module: &Module) -> Result<BTreeMap<String, PathBuf>, MissingLib> {
        let mut libs: BTreeMap<String, PathBuf> = BTreeMap::new();

        // Per-symbol annotations carry both name and path.
        for ext in &module.externs {
            if let (Some(name), Some(path)) = (&ext.libname, &ext.libpath) {
                libs.insert(name.clone(), PathBuf::from(path));
            }
        }

        // The module-level dictionary wins over per-symbol paths.
        for (name, path) in &module.extern_libs {
            libs.insert(name.clone(), PathBuf::from(path));
        }

        // Any external call at all pulls in the default math library.
        if !module.externs.is_empty() && !libs.contains_key(DEFAULT_MATHLIB) {
            let path = self.resolve_mathlib().ok_or_else(|| MissingLib {
                name: DEFAULT_MATHLIB.to_string(),
            })?;
            libs.insert(DEFAULT_MATHLIB.to_string(), path);
        }

        Ok(libs)
    }

    fn resolve_mathlib(&self) -> Option<PathBuf> {
        // An explicit override must point at a real file.
        if let Some(path) = &self.mathlib_override {
            if path.is_file() {
                return Some(path.clone());
            }
            return None;
        }

        // Next to the compiler binary and its ancestors.
        if let Ok(exe) = std::env::current_exe() {
            let mut dir = exe.parent();
            for _ in 0..3 {
                let Some(d) = dir else { break };
                let candidate = d.join(MATHLIB_FILE);
                if candidate.is_file() {
                    return Some(candidate);
                }
                dir = d.parent();
            }
        }

        // Source-tree fallback.
        let dev = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("runtime")
            .join(MATHLIB_FILE);
        if dev.is_file() {
            return Some(dev);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ExternFn;

    fn module_calling(name: &str) -> Module {
        let mut m = Module::new("m");
        m.declare_extern(ExternFn {
            name: name.into(),
            libname: None,
            libpath: None,
        });
        m
    }

    #[test]
    fn test_no_externs_means_no_libs() {
        let m = Module::new("m");
        let libs = LibResolver::default().collect(&m).unwrap();
        assert!(libs.is_empty());
    }

    #[test]
    fn test_extern_call_pulls_in_default_mathlib() {
        let m = module_calling("__tl_exp_f32");
        // No override: resolution falls through to the source tree.
        let libs = LibResolver::default().collect(&m).unwrap();
        let path = libs.get(DEFAULT_MATHLIB).unwrap();
        assert!(path.ends_with("runtime/mathlib.tm"));
    }

    #[test]
    fn test_override_is_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.tm");
        std::fs::write(&path, "; module mathlib\n").unwrap();
        let resolver = LibResolver {
            mathlib_override: Some(path.clone()),
        };
        let libs = resolver.collect(&module_calling("__tl_exp_f32")).unwrap();
        assert_eq!(libs.get(DEFAULT_MATHLIB), Some(&path));

        // A dangling override is an error, not a silent fallback.
        let resolver = LibResolver {
            mathlib_override: Some(dir.path().join("nope.tm")),
        };
        let err = resolver.collect(&module_calling("__tl_exp_f32")).unwrap_err();
        assert_eq!(err.name, DEFAULT_MATHLIB);
    }

    #[test]
    fn test_symbol_annotations_and_dictionary() {
        let mut m = Module::new("m");
        m.declare_extern(ExternFn {
            name: "__vendor_op".into(),
            libname: Some("vendor".into()),
            libpath: Some("/opt/vendor.tm".into()),
        });
        m.add_external_libs(&["extra".into()], &["/opt/extra.tm".into()]);
        // Explicit mathlib entry suppresses the implicit lookup.
        m.add_external_libs(
            &[DEFAULT_MATHLIB.into()],
            &["/opt/mathlib.tm".into()],
        );
        let libs = LibResolver::default().collect(&m).unwrap();
        assert_eq!(libs.len(), 3);
        assert_eq!(libs.get("vendor"), Some(&PathBuf::from("/opt/vendor.tm")));
        assert_eq!(libs.get("extra"), Some(&PathBuf::from("/opt/extra.tm")));
        assert_eq!(
            libs.get(DEFAULT_MATHLIB),
            Some(&PathBuf::from("/opt/mathlib.tm"))
        );
    }

    #[test]
    fn test_dictionary_overrides_symbol_annotation() {
        let mut m = Module::new("m");
        m.declare_extern(ExternFn {
            name: "f".into(),
            libname: Some("lib".into()),
            libpath: Some("/old.tm".into()),
        });
        m.add_external_libs(&["lib".into()], &["/new.tm".into()]);
        let libs = LibResolver::default().collect(&m).unwrap();
        assert_eq!(libs.get("lib"), Some(&PathBuf::from("/new.tm")));
    }
}
