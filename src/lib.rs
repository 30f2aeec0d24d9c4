//! Tensile — lowering and code generation for tensor tile programs.
//!
//! A frontend hands this crate a layout-annotated tile-IR module; the
//! pipeline flattens structured control flow, legalizes every tensor
//! onto a hardware layout, maps logical types to physical register
//! shapes, exports a textual hardware module, links the external device
//! libraries it needs and replays kernel metadata for the chosen
//! backend.

pub mod codegen;
pub mod diagnostic;
pub mod ir;
pub mod lower;
pub mod span;

// Re-exports — the surface most callers need.
pub use codegen::module::CodeModule;
pub use codegen::{lower_module, Backend, LowerError, LowerOptions};
pub use diagnostic::{render_diagnostics, Diagnostic, Severity};
pub use ir::builder::FunctionBuilder;
pub use ir::{Function, Module};
pub use lower::convert::EncodingConverter;
pub use lower::repr::ReprConverter;
