//! Lowering: from layout-annotated tile IR down to an exportable form.
//!
//! `convert` drives the tile-to-hardware rewrite against the legality
//! `legal` target, `repr` maps converted types to physical register
//! shapes, and `passes` holds the surrounding pipeline passes.

pub mod convert;
pub mod legal;
pub mod passes;
pub mod repr;
