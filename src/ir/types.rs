//! Value types of the tile IR.
//!
//! A logical tensor type is shape + element type + optional layout
//! encoding. Identity is structural: two types with equal shape, element
//! and encoding are interchangeable everywhere.

use std::fmt;

use super::encoding::Encoding;

// ─── Address spaces ───────────────────────────────────────────────

/// Memory address space a pointer lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddrSpace {
    /// Device-global memory.
    Global,
    /// Fast on-chip shared memory.
    Shared,
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrSpace::Global => write!(f, "global"),
            AddrSpace::Shared => write!(f, "shared"),
        }
    }
}

// ─── Element types ────────────────────────────────────────────────

/// Scalar element type. Closed set; the lowering never meets anything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemType {
    I1,
    I8,
    I16,
    I32,
    I64,
    /// Target-independent index type; eliminated to `I64` early in the
    /// pipeline and never reaches the code generator.
    Index,
    F8E4M3,
    F8E5M2,
    F16,
    BF16,
    F32,
    F64,
    /// Pointer into the given address space.
    Ptr(AddrSpace),
}

impl ElemType {
    pub fn bit_width(&self) -> u32 {
        match self {
            ElemType::I1 => 1,
            ElemType::I8 | ElemType::F8E4M3 | ElemType::F8E5M2 => 8,
            ElemType::I16 | ElemType::F16 | ElemType::BF16 => 16,
            ElemType::I32 | ElemType::F32 => 32,
            ElemType::I64 | ElemType::Index | ElemType::F64 | ElemType::Ptr(_) => 64,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ElemType::I1 | ElemType::I8 | ElemType::I16 | ElemType::I32 | ElemType::I64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            ElemType::F8E4M3
                | ElemType::F8E5M2
                | ElemType::F16
                | ElemType::BF16
                | ElemType::F32
                | ElemType::F64
        )
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, ElemType::Ptr(_))
    }

    /// Storage type substituted at every representation boundary.
    ///
    /// Sub-byte floats are stored as i8 and bf16 as i16. This is a
    /// storage-only reinterpretation, not a numeric conversion; it must
    /// be reversed before any semantic operation reads the value.
    pub fn storage_type(&self) -> ElemType {
        match self {
            ElemType::F8E4M3 | ElemType::F8E5M2 => ElemType::I8,
            ElemType::BF16 => ElemType::I16,
            other => *other,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::I1 => write!(f, "i1"),
            ElemType::I8 => write!(f, "i8"),
            ElemType::I16 => write!(f, "i16"),
            ElemType::I32 => write!(f, "i32"),
            ElemType::I64 => write!(f, "i64"),
            ElemType::Index => write!(f, "index"),
            ElemType::F8E4M3 => write!(f, "f8e4m3"),
            ElemType::F8E5M2 => write!(f, "f8e5m2"),
            ElemType::F16 => write!(f, "f16"),
            ElemType::BF16 => write!(f, "bf16"),
            ElemType::F32 => write!(f, "f32"),
            ElemType::F64 => write!(f, "f64"),
            ElemType::Ptr(space) => write!(f, "ptr<{}>", space),
        }
    }
}

// ─── Tensor types ─────────────────────────────────────────────────

/// A logical tensor type: shape, element type, optional layout encoding.
///
/// `encoding == None` means the value has not been through the
/// tile-to-hardware conversion yet.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Vec<u64>,
    pub elem: ElemType,
    pub encoding: Option<Encoding>,
}

impl TensorType {
    pub fn new(shape: Vec<u64>, elem: ElemType) -> Self {
        debug_assert!(shape.iter().all(|&d| d > 0));
        Self {
            shape,
            elem,
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<")?;
        for d in &self.shape {
            write!(f, "{}x", d)?;
        }
        write!(f, "{}", self.elem)?;
        if let Some(enc) = &self.encoding {
            write!(f, ", {}", enc)?;
        }
        write!(f, ">")
    }
}

// ─── Value types ──────────────────────────────────────────────────

/// The type of an IR value: a scalar or a tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(ElemType),
    Tensor(TensorType),
}

impl Type {
    pub fn tensor(shape: Vec<u64>, elem: ElemType) -> Self {
        Type::Tensor(TensorType::new(shape, elem))
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            Type::Scalar(_) => None,
        }
    }

    /// True once the type needs no further conversion: scalars always,
    /// tensors only when they carry a layout encoding.
    pub fn is_encoded(&self) -> bool {
        match self {
            Type::Scalar(_) => true,
            Type::Tensor(t) => t.encoding.is_some(),
        }
    }

    pub fn elem(&self) -> ElemType {
        match self {
            Type::Scalar(e) => *e,
            Type::Tensor(t) => t.elem,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(e) => write!(f, "{}", e),
            Type::Tensor(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_promotion() {
        assert_eq!(ElemType::F8E4M3.storage_type(), ElemType::I8);
        assert_eq!(ElemType::F8E5M2.storage_type(), ElemType::I8);
        assert_eq!(ElemType::BF16.storage_type(), ElemType::I16);
        assert_eq!(ElemType::F16.storage_type(), ElemType::F16);
        assert_eq!(ElemType::F32.storage_type(), ElemType::F32);
    }

    #[test]
    fn test_bit_widths() {
        assert_eq!(ElemType::I1.bit_width(), 1);
        assert_eq!(ElemType::F8E4M3.bit_width(), 8);
        assert_eq!(ElemType::BF16.bit_width(), 16);
        assert_eq!(ElemType::Index.bit_width(), 64);
        assert_eq!(ElemType::Ptr(AddrSpace::Global).bit_width(), 64);
    }

    #[test]
    fn test_structural_identity() {
        let a = TensorType::new(vec![16, 16], ElemType::F32);
        let b = TensorType::new(vec![16, 16], ElemType::F32);
        assert_eq!(a, b);
        let c = b.clone().with_encoding(Encoding::natural(&[16, 16], 4));
        assert_ne!(a, c);
    }

    #[test]
    fn test_encoded_predicate() {
        let scalar = Type::Scalar(ElemType::F32);
        assert!(scalar.is_encoded());
        let bare = Type::tensor(vec![8], ElemType::F16);
        assert!(!bare.is_encoded());
        let enc = Type::Tensor(TensorType::new(vec![8], ElemType::F16)
            .with_encoding(Encoding::natural(&[8], 1)));
        assert!(enc.is_encoded());
    }

    #[test]
    fn test_display() {
        let t = Type::tensor(vec![4, 8], ElemType::BF16);
        assert_eq!(format!("{}", t), "tensor<4x8xbf16>");
        assert_eq!(format!("{}", Type::Scalar(ElemType::I32)), "i32");
    }
}
