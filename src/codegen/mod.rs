//! Code generation: drives a lowered tile-IR module all the way to a
//! linked, optimized hardware module.
//!
//! The pipeline runs in a fixed stage order: structured control flow is
//! flattened, index types fixed, tiles converted to hardware layouts,
//! math lowered to external calls, the IR cleaned up, kernel metadata
//! extracted, the module exported and the metadata replayed, and finally
//! the needed external libraries are discovered, linked and the result
//! dead-stripped.
//!
//! Set `TENSILE_ENABLE_DUMP=1` to dump the IR after each stage to
//! stderr, and `TENSILE_CODE_DUMP=1` to print the final module text.

pub mod libs;
pub mod link;
pub mod metadata;
pub mod module;
pub mod translate;

use std::fmt;
use std::path::PathBuf;

use crate::ir::Module;
use crate::lower::convert::EncodingConverter;
use crate::lower::repr::ReprConverter;
use crate::lower::{convert, passes};

use libs::{LibResolver, DEFAULT_MATHLIB};
use module::{CallConv, CodeModule};

/// Hardware backend to generate for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Primary backend.
    Nv,
    /// Alternate backend.
    Amd,
}

/// Options controlling one lowering run.
#[derive(Clone, Debug)]
pub struct LowerOptions {
    pub backend: Backend,
    /// Hardware capability number, e.g. 80.
    pub capability: u32,
    pub num_warps: u32,
    /// Extra libraries to link, by name and path. Mismatched lists are
    /// ignored.
    pub extern_lib_names: Vec<String>,
    pub extern_lib_paths: Vec<String>,
    /// Explicit math-library location; the environment is consulted
    /// when unset.
    pub mathlib_path: Option<PathBuf>,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Nv,
            capability: 80,
            num_warps: 4,
            extern_lib_names: Vec::new(),
            extern_lib_paths: Vec::new(),
            mathlib_path: None,
        }
    }
}

/// Failure modes of the lowering pipeline.
#[derive(Debug)]
pub enum LowerError {
    /// Internal pipeline defect, e.g. a legalization deadlock.
    Defect(String),
    /// The lowered IR could not be exported.
    Export(String),
    /// A required library could not be located.
    MissingLib(libs::MissingLib),
    /// A located library could not be linked.
    Link(link::LinkError),
    /// Post-link optimization found the module incomplete.
    Optimize(String),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::Defect(m) => write!(f, "internal defect: {}", m),
            LowerError::Export(m) => write!(f, "{}", m),
            LowerError::MissingLib(e) => write!(f, "{}", e),
            LowerError::Link(e) => write!(f, "{}", e),
            LowerError::Optimize(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for LowerError {}

impl From<libs::MissingLib> for LowerError {
    fn from(e: libs::MissingLib) -> Self {
        LowerError::MissingLib(e)
    }
}

impl From<link::LinkError> for LowerError {
    fn from(e: link::LinkError) -> Self {
        LowerError::Link(e)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v != "0").unwrap_or(false)
}

fn dump_stage(module: &Module, stage: &str) {
    if env_flag("TENSILE_ENABLE_DUMP") {
        eprintln!("// after {}\n{}", stage, module);
    }
}

/// Lower an IR module to a linked hardware module.
pub fn lower_module(mut module: Module, opts: &LowerOptions) -> Result<CodeModule, LowerError> {
    // Surface-provided libraries join the module dictionary up front so
    // discovery sees one merged view.
    module.add_external_libs(&opts.extern_lib_names, &opts.extern_lib_paths);

    for func in &mut module.functions {
        passes::eliminate_structured_cf(func);
    }
    dump_stage(&module, "structured-cf-elimination");

    for func in &mut module.functions {
        passes::eliminate_index_type(func);
    }
    dump_stage(&module, "index-elimination");

    let converter = EncodingConverter::new(opts.num_warps);
    convert::run(&mut module, &converter).map_err(|d| LowerError::Defect(d.message))?;
    dump_stage(&module, "tile-to-hardware");

    passes::lower_math_calls(&mut module);
    dump_stage(&module, "math-lowering");

    for func in &mut module.functions {
        passes::canonicalize(func);
        passes::cse(func);
        passes::dce(func);
    }
    passes::symbol_dce(&mut module);
    dump_stage(&module, "cleanup");

    let kernel_meta = metadata::extract(&module);

    let repr = ReprConverter::new();
    let mut code =
        translate::export(&module, &repr).map_err(|e| LowerError::Export(e.message))?;
    // Replay precedes linking and the post-link dead-strip: the strip
    // identifies kernel roots by the markers replay attaches.
    metadata::replay(&mut code, &kernel_meta, opts.backend);

    let resolver = match &opts.mathlib_path {
        Some(path) => LibResolver {
            mathlib_override: Some(path.clone()),
        },
        None => LibResolver::from_env(),
    };
    let libraries = resolver.collect(&module)?;

    for (name, path) in &libraries {
        if name == DEFAULT_MATHLIB && opts.backend == Backend::Nv {
            // The math library's denormal behavior is selected through a
            // module flag read at final assembly.
            code.flags.insert("reflect-ftz".to_string(), 1);
        }
        link::link_library_file(&mut code, name, path)?;
    }

    optimize(&mut code)?;

    if env_flag("TENSILE_CODE_DUMP") {
        println!("{}", code);
    }
    Ok(code)
}

/// Post-link cleanup: strip functions unreachable from any kernel, drop
/// satisfied extern declarations, and reject a still-incomplete module.
fn optimize(code: &mut CodeModule) -> Result<(), LowerError> {
    let is_kernel = |f: &module::CodeFunction| {
        f.call_conv == CallConv::Kernel
            || code
                .annotations
                .iter()
                .any(|a| a.func == f.name && a.key == "kernel")
    };

    let mut live: Vec<String> = code
        .functions
        .iter()
        .filter(|f| is_kernel(f))
        .map(|f| f.name.clone())
        .collect();
    let mut reachable: std::collections::BTreeSet<String> = live.iter().cloned().collect();
    while let Some(name) = live.pop() {
        if let Some(func) = code.function(&name) {
            for symbol in func.referenced_symbols() {
                if code.function(&symbol).is_some() && reachable.insert(symbol.clone()) {
                    live.push(symbol);
                }
            }
        }
    }
    // A module with no kernels keeps everything; it is a library build.
    if !reachable.is_empty() {
        code.functions.retain(|f| reachable.contains(&f.name));
        code.annotations.retain(|a| reachable.contains(&a.func));
    }

    let referenced = code.referenced_symbols();
    code.externs.retain(|e| referenced.contains(e));

    let defined = code.defined_symbols();
    if let Some(missing) = code
        .referenced_symbols()
        .into_iter()
        .find(|s| !defined.contains(s))
    {
        return Err(LowerError::Optimize(format!(
            "symbol '{}' is still unresolved after linking",
            missing
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::module::{Annotation, CodeFunction};
    use super::*;

    #[test]
    fn test_optimize_strips_unreachable_device_functions() {
        let mut code = CodeModule::new("m");
        let mut k = CodeFunction::new("k");
        k.call_conv = CallConv::Kernel;
        k.body = vec!["%0 = call @used %r0".into(), "ret".into()];
        let mut used = CodeFunction::new("used");
        used.body = vec!["ret".into()];
        let mut dead = CodeFunction::new("dead");
        dead.body = vec!["ret".into()];
        code.functions.extend([k, used, dead]);

        optimize(&mut code).unwrap();
        assert!(code.function("k").is_some());
        assert!(code.function("used").is_some());
        assert!(code.function("dead").is_none());
    }

    #[test]
    fn test_optimize_respects_annotation_kernels() {
        let mut code = CodeModule::new("m");
        let mut k = CodeFunction::new("k");
        k.body = vec!["ret".into()];
        code.functions.push(k);
        code.functions.push(CodeFunction::new("dead"));
        code.annotations.push(Annotation {
            func: "k".into(),
            key: "kernel".into(),
            value: 1,
        });
        optimize(&mut code).unwrap();
        assert!(code.function("k").is_some());
        assert!(code.function("dead").is_none());
    }

    #[test]
    fn test_optimize_rejects_unresolved_externs() {
        let mut code = CodeModule::new("m");
        let mut k = CodeFunction::new("k");
        k.call_conv = CallConv::Kernel;
        k.body = vec!["%0 = call @__tl_exp_f32 %r0".into(), "ret".into()];
        code.functions.push(k);
        code.externs.insert("__tl_exp_f32".into());
        let err = optimize(&mut code).unwrap_err();
        assert!(err.to_string().contains("__tl_exp_f32"));
    }

    #[test]
    fn test_optimize_drops_satisfied_externs() {
        let mut code = CodeModule::new("m");
        let mut k = CodeFunction::new("k");
        k.call_conv = CallConv::Kernel;
        k.body = vec!["ret".into()];
        code.functions.push(k);
        code.externs.insert("never_called".into());
        optimize(&mut code).unwrap();
        assert!(code.externs.is_empty());
    }
}
