//! Layout encodings — how a logical tensor maps onto hardware.
//!
//! An encoding is pure data: it decides how many physical values one
//! lane holds for a given shape (`elems_per_lane`) and whether the tensor
//! lives in lane registers (distributed family) or in a shared-memory
//! descriptor. The tile shapes of the matrix units are fixed hardware
//! capability tables, not derived rules.

use std::fmt;

// ─── Matrix-unit generations ──────────────────────────────────────

/// Hardware generation of the matrix-multiply unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MmaVersion {
    /// Previous generation: paired-lane unit, operands always packed 2-wide.
    Volta,
    /// Next generation: operands packed by element width (32→1, 16→2, 8→4).
    Ampere,
}

/// Which side of a fused multiply-accumulate an operand feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperandSide {
    A,
    B,
}

// ─── Encoding variants ────────────────────────────────────────────

/// Distributed layout: elements partitioned across lanes in a
/// lane/warp/block grid, with per-lane contiguous runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockedEncoding {
    /// Contiguous elements each lane owns, per dimension.
    pub size_per_lane: Vec<u32>,
    /// Lane grid within one warp, per dimension. Product is the warp width.
    pub lanes_per_warp: Vec<u32>,
    /// Warp grid within one block, per dimension.
    pub warps_per_block: Vec<u32>,
    /// Dimension traversal order, fastest-varying first.
    pub order: Vec<u32>,
}

/// Matrix-unit result layout (distributed family).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MmaEncoding {
    pub version: MmaVersion,
    pub warps_per_block: Vec<u32>,
}

/// Operand-of-fused-multiply wrapper. Records which operand position it
/// feeds; used only to select the packing width of the physical slots.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MmaOperandEncoding {
    pub side: OperandSide,
    pub parent: Box<Encoding>,
}

/// A distributed parent with one dimension removed; reduction results.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlicedEncoding {
    pub dim: u32,
    pub parent: Box<Encoding>,
}

/// Shared-memory layout: the tensor lowers to one descriptor value
/// (base pointer + per-dimension offset/stride), never to lane registers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SharedEncoding {
    /// Swizzle vector width.
    pub vec: u32,
    /// Rows sharing one swizzle phase.
    pub per_phase: u32,
    /// Number of distinct swizzle phases.
    pub max_phase: u32,
    pub order: Vec<u32>,
}

/// Layout encoding of a tensor type. Closed set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    Blocked(BlockedEncoding),
    Mma(MmaEncoding),
    MmaOperand(MmaOperandEncoding),
    Sliced(SlicedEncoding),
    Shared(SharedEncoding),
}

// ─── Matrix-unit tile tables ──────────────────────────────────────
// Fixed per-generation tile shapes. One warp covers an m×n result tile
// and holds `acc` accumulator elements per lane.

const AMPERE_TILE_M: u64 = 16;
const AMPERE_TILE_N: u64 = 8;
const AMPERE_TILE_K: u64 = 16;
const AMPERE_ACC_PER_LANE: u32 = 4;
const AMPERE_A_PER_REP: u32 = 8;
const AMPERE_B_PER_REP: u32 = 4;

const VOLTA_TILE_M: u64 = 16;
const VOLTA_TILE_N: u64 = 16;
const VOLTA_TILE_K: u64 = 4;
const VOLTA_ACC_PER_LANE: u32 = 8;
const VOLTA_OPERAND_PER_REP: u32 = 4;

fn ceil_div(a: u64, b: u64) -> u64 {
    debug_assert!(b > 0);
    (a + b - 1) / b
}

impl Encoding {
    /// True for layouts whose values live in lane registers.
    pub fn is_distributed(&self) -> bool {
        !matches!(self, Encoding::Shared(_))
    }

    /// Number of physical values one lane holds for a tensor of `shape`.
    ///
    /// Authoritative for the whole distributed family; the physical type
    /// converter must not second-guess it. Not defined for shared layouts.
    pub fn elems_per_lane(&self, shape: &[u64]) -> u32 {
        debug_assert!(self.is_distributed(), "shared layouts have no per-lane elements");
        match self {
            Encoding::Blocked(b) => b.elems_per_lane(shape),
            Encoding::Mma(m) => m.elems_per_lane(shape),
            Encoding::MmaOperand(o) => o.elems_per_lane(shape),
            Encoding::Sliced(s) => s.elems_per_lane(shape),
            Encoding::Shared(_) => unreachable!(),
        }
    }

    /// Pessimistic default for a tensor that carries no encoding yet:
    /// one element per lane, identity dimension order.
    pub fn natural(shape: &[u64], num_warps: u32) -> Encoding {
        let rank = shape.len();
        let size_per_lane = vec![1u32; rank];
        let order: Vec<u32> = (0..rank as u32).collect();
        let lanes_per_warp = distribute(32, shape, &size_per_lane, &order);
        let covered: Vec<u64> = shape
            .iter()
            .zip(&lanes_per_warp)
            .map(|(&d, &l)| ceil_div(d, l as u64))
            .collect();
        let warps_per_block = distribute(num_warps, &covered, &size_per_lane, &order);
        Encoding::Blocked(BlockedEncoding {
            size_per_lane,
            lanes_per_warp,
            warps_per_block,
            order,
        })
    }
}

/// Distribute `total` units (a power of two) over the dimensions of
/// `shape`, fastest-varying dimension first, never giving a dimension
/// more units than it has elements to cover. Leftover units land on the
/// slowest dimension so the product always equals `total`.
fn distribute(total: u32, shape: &[u64], size_per_lane: &[u32], order: &[u32]) -> Vec<u32> {
    let mut out = vec![1u32; shape.len()];
    if shape.is_empty() {
        return out;
    }
    let mut remaining = total.max(1);
    for &d in order {
        let d = d as usize;
        let need = ceil_div(shape[d], size_per_lane[d] as u64) as u32;
        let take = remaining.min(need.next_power_of_two());
        let take = prev_power_of_two(take);
        out[d] = take;
        remaining /= take;
        if remaining <= 1 {
            break;
        }
    }
    if remaining > 1 {
        let last = *order.last().unwrap() as usize;
        out[last] *= remaining;
    }
    out
}

fn prev_power_of_two(v: u32) -> u32 {
    if v == 0 {
        1
    } else {
        1 << (31 - v.leading_zeros())
    }
}

impl BlockedEncoding {
    pub fn elems_per_lane(&self, shape: &[u64]) -> u32 {
        debug_assert_eq!(shape.len(), self.size_per_lane.len());
        let mut total = 1u64;
        for d in 0..shape.len() {
            let cover = self.size_per_lane[d] as u64
                * self.lanes_per_warp[d] as u64
                * self.warps_per_block[d] as u64;
            let reps = ceil_div(shape[d], cover);
            total *= reps * self.size_per_lane[d] as u64;
        }
        total as u32
    }
}

impl MmaEncoding {
    pub fn elems_per_lane(&self, shape: &[u64]) -> u32 {
        debug_assert_eq!(shape.len(), 2, "matrix-unit layouts are rank-2");
        let (wm, wn) = (self.warps_per_block[0] as u64, self.warps_per_block[1] as u64);
        match self.version {
            MmaVersion::Ampere => {
                let rep_m = ceil_div(shape[0], AMPERE_TILE_M * wm);
                let rep_n = ceil_div(shape[1], AMPERE_TILE_N * wn);
                (rep_m * rep_n) as u32 * AMPERE_ACC_PER_LANE
            }
            MmaVersion::Volta => {
                let rep_m = ceil_div(shape[0], VOLTA_TILE_M * wm);
                let rep_n = ceil_div(shape[1], VOLTA_TILE_N * wn);
                (rep_m * rep_n) as u32 * VOLTA_ACC_PER_LANE
            }
        }
    }
}

impl MmaOperandEncoding {
    /// Operand shapes are A: m×k, B: k×n. Replication along the result
    /// dimension is split across warps; the k dimension is walked whole.
    pub fn elems_per_lane(&self, shape: &[u64]) -> u32 {
        debug_assert_eq!(shape.len(), 2, "fused-multiply operands are rank-2");
        match self.parent.as_ref() {
            Encoding::Mma(mma) => {
                let (wm, wn) =
                    (mma.warps_per_block[0] as u64, mma.warps_per_block[1] as u64);
                match (mma.version, self.side) {
                    (MmaVersion::Ampere, OperandSide::A) => {
                        let rep_m = ceil_div(shape[0], AMPERE_TILE_M * wm);
                        let rep_k = ceil_div(shape[1], AMPERE_TILE_K);
                        (rep_m * rep_k) as u32 * AMPERE_A_PER_REP
                    }
                    (MmaVersion::Ampere, OperandSide::B) => {
                        let rep_k = ceil_div(shape[0], AMPERE_TILE_K);
                        let rep_n = ceil_div(shape[1], AMPERE_TILE_N * wn);
                        (rep_k * rep_n) as u32 * AMPERE_B_PER_REP
                    }
                    (MmaVersion::Volta, OperandSide::A) => {
                        let rep_m = ceil_div(shape[0], VOLTA_TILE_M * wm);
                        let rep_k = ceil_div(shape[1], VOLTA_TILE_K);
                        (rep_m * rep_k) as u32 * VOLTA_OPERAND_PER_REP
                    }
                    (MmaVersion::Volta, OperandSide::B) => {
                        let rep_k = ceil_div(shape[0], VOLTA_TILE_K);
                        let rep_n = ceil_div(shape[1], VOLTA_TILE_N * wn);
                        (rep_k * rep_n) as u32 * VOLTA_OPERAND_PER_REP
                    }
                }
            }
            // FMA path: a blocked parent replicates its own grid over the
            // operand shape.
            parent => parent.elems_per_lane(shape),
        }
    }
}

impl SlicedEncoding {
    /// The sliced dimension is reinserted (extent 1) and the parent asked.
    pub fn elems_per_lane(&self, shape: &[u64]) -> u32 {
        let mut expanded = shape.to_vec();
        expanded.insert(self.dim as usize, 1);
        self.parent.elems_per_lane(&expanded)
    }
}

// ─── Display ──────────────────────────────────────────────────────

fn write_grid(f: &mut fmt::Formatter<'_>, name: &str, grid: &[u32]) -> fmt::Result {
    write!(f, "{}=[", name)?;
    for (i, v) in grid.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", v)?;
    }
    write!(f, "]")
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Blocked(b) => {
                write!(f, "#blocked<")?;
                write_grid(f, "size", &b.size_per_lane)?;
                write!(f, " ")?;
                write_grid(f, "lanes", &b.lanes_per_warp)?;
                write!(f, " ")?;
                write_grid(f, "warps", &b.warps_per_block)?;
                write!(f, ">")
            }
            Encoding::Mma(m) => {
                let v = match m.version {
                    MmaVersion::Volta => 1,
                    MmaVersion::Ampere => 2,
                };
                write!(f, "#mma<v{} ", v)?;
                write_grid(f, "warps", &m.warps_per_block)?;
                write!(f, ">")
            }
            Encoding::MmaOperand(o) => {
                let side = match o.side {
                    OperandSide::A => "a",
                    OperandSide::B => "b",
                };
                write!(f, "#mma_operand<{} of {}>", side, o.parent)
            }
            Encoding::Sliced(s) => write!(f, "#sliced<dim={} of {}>", s.dim, s.parent),
            Encoding::Shared(s) => write!(
                f,
                "#shared<vec={} per_phase={} max_phase={}>",
                s.vec, s.per_phase, s.max_phase
            ),
        }
    }
}

impl SharedEncoding {
    /// Unswizzled row-major default.
    pub fn row_major(rank: usize) -> Self {
        Self {
            vec: 1,
            per_phase: 1,
            max_phase: 1,
            order: (0..rank as u32).rev().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ampere(warps: [u32; 2]) -> Encoding {
        Encoding::Mma(MmaEncoding {
            version: MmaVersion::Ampere,
            warps_per_block: warps.to_vec(),
        })
    }

    #[test]
    fn test_natural_covers_all_lanes() {
        let enc = Encoding::natural(&[128, 128], 4);
        let Encoding::Blocked(b) = &enc else {
            panic!("natural encoding must be blocked");
        };
        let lanes: u32 = b.lanes_per_warp.iter().product();
        let warps: u32 = b.warps_per_block.iter().product();
        assert_eq!(lanes, 32);
        assert_eq!(warps, 4);
        assert!(b.size_per_lane.iter().all(|&s| s == 1));
    }

    #[test]
    fn test_natural_small_tensor_still_full_warp() {
        // Shape smaller than the warp: lanes are replicated, product stays 32.
        let enc = Encoding::natural(&[4], 1);
        let Encoding::Blocked(b) = &enc else {
            panic!();
        };
        assert_eq!(b.lanes_per_warp.iter().product::<u32>(), 32);
    }

    #[test]
    fn test_blocked_elems_per_lane() {
        // 128x128 over 1-elem lanes, warp 4x8, block 2x2: reps (16,4) → 64.
        let b = BlockedEncoding {
            size_per_lane: vec![1, 1],
            lanes_per_warp: vec![4, 8],
            warps_per_block: vec![2, 2],
            order: vec![0, 1],
        };
        assert_eq!(b.elems_per_lane(&[128, 128]), 16 * 8);
    }

    #[test]
    fn test_blocked_replication_rounds_up() {
        let b = BlockedEncoding {
            size_per_lane: vec![2],
            lanes_per_warp: vec![32],
            warps_per_block: vec![1],
            order: vec![0],
        };
        // 100 elements over a 64-element cover: 2 reps of 2 per lane.
        assert_eq!(b.elems_per_lane(&[100]), 4);
    }

    #[test]
    fn test_mma_ampere_acc() {
        // One 16x8 tile per warp, 4 accumulator values per lane.
        assert_eq!(ampere([1, 1]).elems_per_lane(&[16, 8]), 4);
        assert_eq!(ampere([1, 1]).elems_per_lane(&[32, 16]), 4 * 2 * 2);
        assert_eq!(ampere([2, 2]).elems_per_lane(&[32, 16]), 4);
    }

    #[test]
    fn test_mma_operand_ampere() {
        let parent = ampere([1, 1]);
        let a = MmaOperandEncoding {
            side: OperandSide::A,
            parent: Box::new(parent.clone()),
        };
        // 16x16 A operand: one m-rep, one k-rep, 8 values.
        assert_eq!(a.elems_per_lane(&[16, 16]), 8);
        let b = MmaOperandEncoding {
            side: OperandSide::B,
            parent: Box::new(parent),
        };
        // 16x8 B operand: one rep, 4 values.
        assert_eq!(b.elems_per_lane(&[16, 8]), 4);
    }

    #[test]
    fn test_sliced_reinserts_dim() {
        let parent = Encoding::natural(&[16, 16], 1);
        let sliced = SlicedEncoding {
            dim: 1,
            parent: Box::new(parent.clone()),
        };
        assert_eq!(
            sliced.elems_per_lane(&[16]),
            parent.elems_per_lane(&[16, 1])
        );
    }

    #[test]
    fn test_shared_is_not_distributed() {
        let enc = Encoding::Shared(SharedEncoding::row_major(2));
        assert!(!enc.is_distributed());
        assert!(Encoding::natural(&[8], 1).is_distributed());
    }
}
