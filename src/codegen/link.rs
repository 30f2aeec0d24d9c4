//! Needed-only linking of device libraries.
//!
//! A library module is never absorbed wholesale: only definitions for
//! symbols the destination actually references are pulled in, and the
//! pull is transitive so a library function may call its own helpers.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use super::module::CodeModule;

/// Linking a library failed. Carries the library name and file so the
/// report points at the offending input.
#[derive(Debug)]
pub struct LinkError {
    pub lib: String,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to link library '{}' ({}): {}",
            self.lib,
            self.path.display(),
            self.message
        )
    }
}

impl std::error::Error for LinkError {}

/// Pull the definitions `dest` needs out of `lib`. Returns how many
/// functions were linked in.
pub fn link_only_needed(dest: &mut CodeModule, lib: &CodeModule) -> usize {
    let mut pulled = 0;
    loop {
        let defined = dest.defined_symbols();
        let needed: BTreeSet<String> = dest
            .unresolved_symbols()
            .into_iter()
            .filter(|s| !defined.contains(s))
            .collect();
        let mut progress = false;
        for symbol in needed {
            if let Some(func) = lib.function(&symbol) {
                dest.functions.push(func.clone());
                dest.externs.remove(&symbol);
                pulled += 1;
                progress = true;
            }
        }
        if !progress {
            return pulled;
        }
    }
}

/// Read, parse and link one library file.
pub fn link_library_file(
    dest: &mut CodeModule,
    name: &str,
    path: &Path,
) -> Result<usize, LinkError> {
    let fail = |message: String| LinkError {
        lib: name.to_string(),
        path: path.to_path_buf(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    let lib = CodeModule::parse(&text).map_err(|e| fail(e.to_string()))?;
    Ok(link_only_needed(dest, &lib))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::module::CodeFunction;

    fn library() -> CodeModule {
        let mut lib = CodeModule::new("mathlib");
        let mut exp = CodeFunction::new("__tl_exp_f32");
        exp.body = vec!["%0 = call @__tl_exp_inner %arg0".into(), "ret %0".into()];
        let mut inner = CodeFunction::new("__tl_exp_inner");
        inner.body = vec!["ret %arg0".into()];
        let mut log = CodeFunction::new("__tl_log_f32");
        log.body = vec!["ret %arg0".into()];
        lib.functions.extend([exp, inner, log]);
        lib
    }

    fn caller_of(symbol: &str) -> CodeModule {
        let mut dest = CodeModule::new("m");
        dest.externs.insert(symbol.to_string());
        let mut k = CodeFunction::new("k");
        k.body = vec![format!("%0 = call @{} %arg0", symbol), "ret".into()];
        dest.functions.push(k);
        dest
    }

    #[test]
    fn test_links_only_needed_transitively() {
        let mut dest = caller_of("__tl_exp_f32");
        let pulled = link_only_needed(&mut dest, &library());
        // exp plus its helper, but not log.
        assert_eq!(pulled, 2);
        assert!(dest.function("__tl_exp_f32").is_some());
        assert!(dest.function("__tl_exp_inner").is_some());
        assert!(dest.function("__tl_log_f32").is_none());
        assert!(dest.unresolved_symbols().is_empty());
        assert!(!dest.externs.contains("__tl_exp_f32"));
    }

    #[test]
    fn test_unknown_symbol_stays_unresolved() {
        let mut dest = caller_of("__tl_missing_f32");
        let pulled = link_only_needed(&mut dest, &library());
        assert_eq!(pulled, 0);
        assert!(dest.unresolved_symbols().contains("__tl_missing_f32"));
    }

    #[test]
    fn test_link_library_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mathlib.tm");
        std::fs::write(&path, library().to_string()).unwrap();
        let mut dest = caller_of("__tl_exp_f32");
        let pulled = link_library_file(&mut dest, "mathlib", &path).unwrap();
        assert_eq!(pulled, 2);
    }

    #[test]
    fn test_link_error_names_library_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tm");
        std::fs::write(&path, "garbage\n").unwrap();
        let mut dest = caller_of("__tl_exp_f32");
        let err = link_library_file(&mut dest, "vendor", &path).unwrap_err();
        assert_eq!(err.lib, "vendor");
        let text = err.to_string();
        assert!(text.contains("vendor"));
        assert!(text.contains("broken.tm"));
    }
}
