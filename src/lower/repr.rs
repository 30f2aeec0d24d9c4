//! Physical Type Converter — decides the physical representation of every
//! value and moves elements between "many slots" and "one aggregate".
//!
//! A logical tensor becomes an ordered list of primitive slots:
//!   - distributed family: `elems_per_lane` slots of the (possibly
//!     storage-promoted) element type, packed per the matrix-unit tables;
//!   - shared layout: one shared-memory pointer plus an offset and a
//!     stride (i32 each) per dimension;
//!   - scalars and pointers pass through as a single slot.
//!
//! Storage promotion (f8 → i8, bf16 → i16) is substituted transparently
//! at every boundary; it is a reinterpretation, never a numeric cast.

use std::fmt;

use crate::diagnostic::Diagnostic;
use crate::ir::encoding::{Encoding, MmaVersion};
use crate::ir::types::{AddrSpace, ElemType, TensorType, Type};
use crate::span::Span;

// ─── Physical types ───────────────────────────────────────────────

/// One primitive slot: a scalar or a short fixed-width vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhysType {
    Scalar(ElemType),
    Vector { elem: ElemType, width: u32 },
}

impl fmt::Display for PhysType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysType::Scalar(e) => write!(f, "{}", e),
            PhysType::Vector { elem, width } => write!(f, "vec<{}x{}>", width, elem),
        }
    }
}

/// The physical representation of a logical type: an ordered slot list.
///
/// `aggregate` distinguishes a true aggregate (tensors, even single-slot
/// ones) from a scalar pass-through, which packs and unpacks to itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysRepr {
    pub slots: Vec<PhysType>,
    aggregate: bool,
}

impl PhysRepr {
    pub fn scalar(ty: PhysType) -> Self {
        Self {
            slots: vec![ty],
            aggregate: false,
        }
    }

    pub fn aggregate(slots: Vec<PhysType>) -> Self {
        Self {
            slots,
            aggregate: true,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    pub fn arity(&self) -> usize {
        self.slots.len()
    }
}

/// A lowered value: one primitive slot or a packed aggregate.
#[derive(Clone, Debug, PartialEq)]
pub enum PhysValue {
    /// A primitive value slot; `id` names the underlying register.
    Slot { ty: PhysType, id: u32 },
    Aggregate { repr: PhysRepr, elems: Vec<PhysValue> },
}

impl PhysValue {
    pub fn slot_ty(&self) -> Option<PhysType> {
        match self {
            PhysValue::Slot { ty, .. } => Some(*ty),
            PhysValue::Aggregate { .. } => None,
        }
    }
}

// ─── Converter ────────────────────────────────────────────────────

/// Stateless converter from logical types to physical representations.
pub struct ReprConverter;

impl ReprConverter {
    pub fn new() -> Self {
        Self
    }

    /// Physical representation of a logical type.
    ///
    /// Fails on a tensor that never went through the tile-to-hardware
    /// conversion (no layout encoding): that is a pipeline-ordering bug
    /// surfaced as a diagnostic rather than a crash.
    pub fn representation_of(&self, ty: &Type) -> Result<PhysRepr, Diagnostic> {
        match ty {
            Type::Scalar(e) => Ok(PhysRepr::scalar(PhysType::Scalar(e.storage_type()))),
            Type::Tensor(t) => self.tensor_representation(t),
        }
    }

    fn tensor_representation(&self, t: &TensorType) -> Result<PhysRepr, Diagnostic> {
        let Some(encoding) = &t.encoding else {
            return Err(Diagnostic::error(
                format!("cannot lower tensor type {} without a layout encoding", t),
                Span::dummy(),
            )
            .with_help("the tile-to-hardware conversion must run first".to_string()));
        };

        if let Encoding::Shared(_) = encoding {
            // Descriptor: base pointer, then offset and stride per dim.
            let mut slots = Vec::with_capacity(1 + 2 * t.rank());
            slots.push(PhysType::Scalar(ElemType::Ptr(AddrSpace::Shared)));
            for _ in 0..t.rank() * 2 {
                slots.push(PhysType::Scalar(ElemType::I32));
            }
            return Ok(PhysRepr::aggregate(slots));
        }

        let slot = self.slot_type(t);
        let count = encoding.elems_per_lane(&t.shape) as usize;
        Ok(PhysRepr::aggregate(vec![slot; count]))
    }

    /// Slot type for one element of a distributed tensor.
    ///
    /// Fused-multiply operands are packed to the width the matrix unit
    /// consumes; everything else is the storage-promoted element.
    fn slot_type(&self, t: &TensorType) -> PhysType {
        let elem = t.elem.storage_type();
        let Some(Encoding::MmaOperand(operand)) = &t.encoding else {
            return PhysType::Scalar(elem);
        };
        let Encoding::Mma(mma) = operand.parent.as_ref() else {
            // FMA path through a blocked parent: plain element slots.
            return PhysType::Scalar(elem);
        };
        match mma.version {
            MmaVersion::Ampere => {
                let width = elem.bit_width();
                if elem.is_integer() && width < 32 {
                    // Sub-word integers are packed into one 32-bit register.
                    return PhysType::Scalar(ElemType::I32);
                }
                let vec_width = match width {
                    32 => 1,
                    16 => 2,
                    8 => 4,
                    _ => 1,
                };
                PhysType::Vector {
                    elem,
                    width: vec_width,
                }
            }
            MmaVersion::Volta => PhysType::Vector { elem, width: 2 },
        }
    }

    /// Pack slot values into one aggregate of representation `repr`.
    ///
    /// A scalar (non-aggregate) representation returns the sole input
    /// unchanged. Arity mismatches, absent values and slot-type
    /// mismatches are reported with expected vs. actual.
    pub fn pack(
        &self,
        span: Span,
        values: &[Option<PhysValue>],
        repr: &PhysRepr,
    ) -> Result<PhysValue, Diagnostic> {
        if !repr.is_aggregate() {
            if values.len() != 1 {
                return Err(Diagnostic::error(
                    format!(
                        "size mismatch when packing elements: expected 1 value but got {}",
                        values.len()
                    ),
                    span,
                ));
            }
            return match &values[0] {
                Some(v) => Ok(v.clone()),
                None => Err(Diagnostic::error(
                    "cannot pack a null value".to_string(),
                    span,
                )),
            };
        }

        if values.len() != repr.arity() {
            return Err(Diagnostic::error(
                format!(
                    "size mismatch when packing elements: expected {} values but got {}",
                    repr.arity(),
                    values.len()
                ),
                span,
            ));
        }

        let mut elems = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let Some(value) = value else {
                return Err(Diagnostic::error(
                    format!("cannot pack a null value into slot {}", i),
                    span,
                ));
            };
            match value.slot_ty() {
                Some(ty) if ty == repr.slots[i] => {}
                Some(ty) => {
                    return Err(Diagnostic::error(
                        format!(
                            "invalid element type in slot {}: expected {} but got {}",
                            i, repr.slots[i], ty
                        ),
                        span,
                    ));
                }
                None => {
                    return Err(Diagnostic::error(
                        format!("cannot pack an aggregate into slot {}", i),
                        span,
                    ));
                }
            }
            elems.push(value.clone());
        }
        Ok(PhysValue::Aggregate {
            repr: repr.clone(),
            elems,
        })
    }

    /// Unpack an aggregate into its ordered slot values. A primitive
    /// value is returned as a one-element sequence. Passing an aggregate
    /// that was never constructed is a caller contract violation; the
    /// type system rules out the null case.
    pub fn unpack(&self, value: &PhysValue) -> Vec<PhysValue> {
        match value {
            PhysValue::Slot { .. } => vec![value.clone()],
            PhysValue::Aggregate { repr, elems } => {
                debug_assert_eq!(repr.arity(), elems.len());
                elems.clone()
            }
        }
    }
}

impl Default for ReprConverter {
    fn default() -> Self {
        Self::new()
    }
}
