//! Rotation tables for the Hilbert space-filling curve.
//!
//! The recursive descent of every SFC routine in this crate is steered by
//! three lookup tables, keyed by a rotation id: the permutation from SFC
//! child rank to Morton child index, its inverse, and the rotation id each
//! child subtree continues with. A rotation id stands for an orientation of
//! the curve, i.e. a pair of entry corner and travel direction of the
//! canonical pattern inside the current subtree.
//!
//! The tables are generated once per dimension from the Gray-code
//! construction of the Hilbert curve: within one subtree the children are
//! visited in Gray-code order, transformed by the entry corner (an XOR) and
//! the travel direction (a bit rotation). The set of orientations reachable
//! from the root orientation is closed and small (4 in 2D, 24 in 3D), so a
//! breadth-first enumeration of the reachable states yields the full table.

use std::sync::OnceLock;

use crate::constants::{num_children, MAX_DIM};

/// Rotation and orientation lookup tables for one dimension.
pub struct HilbertTables {
    dim: usize,
    nc: usize,
    num_rotations: usize,
    /// Row layout per rotation: `nc` entries SFC rank -> Morton child,
    /// followed by `nc` entries Morton child -> SFC rank.
    rotations: Vec<u8>,
    /// Per rotation, `nc` entries Morton child -> child rotation id.
    child_rot: Vec<u32>,
}

#[inline]
fn gray(i: u32) -> u32 {
    i ^ (i >> 1)
}

#[inline]
fn rotl(x: u32, r: u32, n: u32) -> u32 {
    let r = r % n;
    if r == 0 {
        return x;
    }
    let mask = (1 << n) - 1;
    ((x << r) | (x >> (n - r))) & mask
}

/// Entry corner of the `i`-th subcell of the canonical pattern.
#[inline]
fn entry(i: u32) -> u32 {
    if i == 0 {
        0
    } else {
        gray(2 * ((i - 1) / 2))
    }
}

/// Intra-subcell travel direction of the `i`-th subcell.
#[inline]
fn intra_dir(i: u32, n: u32) -> u32 {
    if i == 0 {
        0
    } else if i % 2 == 1 {
        i.trailing_ones() % n
    } else {
        (i - 1).trailing_ones() % n
    }
}

impl HilbertTables {
    fn generate(dim: usize) -> Self {
        let n = dim as u32;
        let nc = num_children(dim);

        // Breadth-first enumeration of the orientations reachable from the
        // root state (entry corner 0, direction 0). States are (e, d) pairs.
        let mut state_id = vec![u32::MAX; nc * dim];
        let mut states: Vec<(u32, u32)> = Vec::new();
        let mut queue = std::collections::VecDeque::new();

        state_id[0] = 0;
        states.push((0, 0));
        queue.push_back((0u32, 0u32));

        let mut rotations = Vec::new();
        let mut child_rot = Vec::new();

        while let Some((e, d)) = queue.pop_front() {
            let mut row_perm = vec![0u8; nc];
            let mut row_inv = vec![0u8; nc];
            let mut row_child = vec![0u32; nc];

            for w in 0..nc as u32 {
                // Morton child visited at SFC rank w.
                let l = rotl(gray(w), d + 1, n) ^ e;
                row_perm[w as usize] = l as u8;
                row_inv[l as usize] = w as u8;

                // Orientation the curve continues with inside child l.
                let ce = e ^ rotl(entry(w), d + 1, n);
                let cd = (d + intra_dir(w, n) + 1) % n;
                let slot = (ce as usize) * dim + cd as usize;
                if state_id[slot] == u32::MAX {
                    state_id[slot] = states.len() as u32;
                    states.push((ce, cd));
                    queue.push_back((ce, cd));
                }
                row_child[l as usize] = state_id[slot];
            }

            rotations.extend_from_slice(&row_perm);
            rotations.extend_from_slice(&row_inv);
            child_rot.extend_from_slice(&row_child);
        }

        Self {
            dim,
            nc,
            num_rotations: states.len(),
            rotations,
            child_rot,
        }
    }

    /// Dimension the tables were generated for.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of children per subtree (`2^dim`).
    pub fn num_children(&self) -> usize {
        self.nc
    }

    /// Number of distinct rotations.
    pub fn num_rotations(&self) -> usize {
        self.num_rotations
    }

    /// Morton child index visited at SFC rank `sfc_rank` under `rot`.
    #[inline]
    pub fn sfc_to_morton(&self, rot: u32, sfc_rank: usize) -> usize {
        self.rotations[rot as usize * 2 * self.nc + sfc_rank] as usize
    }

    /// SFC rank at which Morton child `morton_child` is visited under `rot`.
    #[inline]
    pub fn morton_to_sfc(&self, rot: u32, morton_child: usize) -> usize {
        self.rotations[rot as usize * 2 * self.nc + self.nc + morton_child] as usize
    }

    /// Rotation id of the subtree rooted at Morton child `morton_child`.
    #[inline]
    pub fn child_rotation(&self, rot: u32, morton_child: usize) -> u32 {
        self.child_rot[rot as usize * self.nc + morton_child]
    }
}

static TABLES: [OnceLock<HilbertTables>; MAX_DIM + 1] = [
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
];

/// The process-wide Hilbert tables for `dim` dimensions.
///
/// Generated on first use and immutable afterwards. Callers that want the
/// construction cost out of their timed sections call [`init_hcurve`] up
/// front.
pub fn hcurve_tables(dim: usize) -> &'static HilbertTables {
    assert!(
        (2..=MAX_DIM).contains(&dim),
        "unsupported dimension {}",
        dim
    );
    TABLES[dim].get_or_init(|| HilbertTables::generate(dim))
}

/// Force generation of the tables for `dim` dimensions.
pub fn init_hcurve(dim: usize) {
    let _ = hcurve_tables(dim);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rows_are_permutations() {
        for dim in 2..=MAX_DIM {
            let t = hcurve_tables(dim);
            for rot in 0..t.num_rotations() as u32 {
                let mut seen = vec![false; t.num_children()];
                for w in 0..t.num_children() {
                    let l = t.sfc_to_morton(rot, w);
                    assert!(!seen[l]);
                    seen[l] = true;
                    assert_eq!(t.morton_to_sfc(rot, l), w);
                    assert!((t.child_rotation(rot, l) as usize) < t.num_rotations());
                }
            }
        }
    }

    #[test]
    fn test_rotation_counts() {
        assert_eq!(hcurve_tables(2).num_rotations(), 4);
        assert_eq!(hcurve_tables(3).num_rotations(), 24);
    }

    /// Expand the curve to unit cells at a fixed depth.
    fn curve_cells(dim: usize, depth: u32) -> Vec<Vec<u32>> {
        let t = hcurve_tables(dim);
        let mut out = Vec::new();
        fn recurse(
            t: &HilbertTables,
            rot: u32,
            level: u32,
            depth: u32,
            anchor: &mut Vec<u32>,
            out: &mut Vec<Vec<u32>>,
        ) {
            if level == depth {
                out.push(anchor.clone());
                return;
            }
            for w in 0..t.num_children() {
                let m = t.sfc_to_morton(rot, w);
                let c_rot = t.child_rotation(rot, m);
                for d in 0..t.dim() {
                    anchor[d] = 2 * anchor[d] + ((m >> d) & 1) as u32;
                }
                recurse(t, c_rot, level + 1, depth, anchor, out);
                for d in 0..t.dim() {
                    anchor[d] = (anchor[d] - ((m >> d) & 1) as u32) / 2;
                }
            }
        }
        let mut anchor = vec![0u32; dim];
        recurse(t, 0, 0, depth, &mut anchor, &mut out);
        out
    }

    #[test]
    fn test_curve_is_continuous() {
        // Consecutive cells of the expanded curve differ by one step along
        // exactly one axis. This is the defining locality property of the
        // Hilbert curve and what separates it from plain Morton order.
        for (dim, depth) in [(2, 3), (3, 2), (4, 2)] {
            let cells = curve_cells(dim, depth);
            assert_eq!(cells.len(), 1usize << (dim as u32 * depth));
            for pair in cells.windows(2) {
                let dist: u32 = (0..dim)
                    .map(|d| pair[0][d].abs_diff(pair[1][d]))
                    .sum();
                assert_eq!(dist, 1, "jump between {:?} and {:?}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn test_curve_visits_every_cell() {
        let mut cells = curve_cells(2, 3);
        cells.sort_unstable();
        cells.dedup();
        assert_eq!(cells.len(), 64);
    }
}
