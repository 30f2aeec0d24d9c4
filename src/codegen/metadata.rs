//! Kernel metadata carried across the export boundary.
//!
//! Launch bounds and kernel-entry markers live on IR functions; the
//! exported code module has no place for them until they are replayed in
//! the backend's own vocabulary. Extraction happens before export,
//! replay after, keyed by symbol name.

use std::collections::BTreeMap;

use crate::ir::Module;

use super::module::{Annotation, CallConv, CodeModule};
use super::Backend;

/// What a kernel needs re-attached after export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelMetadata {
    /// Maximum threads per block, up to three dimensions.
    pub max_threads: Vec<u32>,
    pub is_kernel: bool,
}

/// Pull per-function metadata out of the IR module.
pub fn extract(module: &Module) -> BTreeMap<String, KernelMetadata> {
    module
        .functions
        .iter()
        .filter(|f| f.is_kernel || !f.max_threads.is_empty())
        .map(|f| {
            (
                f.name.clone(),
                KernelMetadata {
                    max_threads: f.max_threads.clone(),
                    is_kernel: f.is_kernel,
                },
            )
        })
        .collect()
}

const LAUNCH_BOUND_KEYS: [&str; 3] = ["maxntidx", "maxntidy", "maxntidz"];

/// Re-attach extracted metadata to the exported module.
///
/// The primary backend records launch bounds and kernel entries as
/// module annotations; the alternate backend marks the function itself
/// with the kernel calling convention and a flat work-group-size
/// attribute.
pub fn replay(
    code: &mut CodeModule,
    metadata: &BTreeMap<String, KernelMetadata>,
    backend: Backend,
) {
    for (name, meta) in metadata {
        if code.function(name).is_none() {
            continue;
        }
        match backend {
            Backend::Nv => {
                for (dim, threads) in meta.max_threads.iter().enumerate().take(3) {
                    code.annotations.push(Annotation {
                        func: name.clone(),
                        key: LAUNCH_BOUND_KEYS[dim].to_string(),
                        value: *threads,
                    });
                }
                if meta.is_kernel {
                    code.annotations.push(Annotation {
                        func: name.clone(),
                        key: "kernel".to_string(),
                        value: 1,
                    });
                }
            }
            Backend::Amd => {
                if let Some(func) = code.function_mut(name) {
                    if meta.is_kernel {
                        func.call_conv = CallConv::Kernel;
                        func.attrs.insert(
                            "amdgpu-flat-work-group-size".to_string(),
                            "1, 1024".to_string(),
                        );
                    }
                    if !meta.max_threads.is_empty() {
                        let bound = meta
                            .max_threads
                            .iter()
                            .take(3)
                            .map(u32::to_string)
                            .collect::<Vec<_>>()
                            .join(", ");
                        func.attrs.insert("maxntid".to_string(), bound);
                    }
                }
            }
        }
    }
}
