//! Nodal-point emission for a single element.
//!
//! An element of polynomial order `k` carries a regular `(k+1)^D` grid of
//! nodes. The grid positions are `anchor + (len * j) / k` for
//! `j in [0, k]^D` with truncating integer division, so two elements that
//! share a k-face emit bitwise identical coordinates for the shared nodes
//! while nodes of elements at different levels in general do not coincide.

use crate::bits::TallBitMatrix;
use crate::tnpoint::TNPoint;
use crate::treenode::TreeNode;

/// An octant in its role as a finite element.
#[derive(Copy, Clone, Debug)]
pub struct Element<const D: usize> {
    cell: TreeNode<D>,
}

/// Advance a mixed-radix multi-index with per-axis range `[lo, hi]`.
/// Returns false when the index wraps around.
#[inline]
fn advance<const D: usize>(j: &mut [u32; D], lo: u32, hi: u32) -> bool {
    for jd in j.iter_mut() {
        *jd += 1;
        if *jd <= hi {
            return true;
        }
        *jd = lo;
    }
    false
}

impl<const D: usize> Element<D> {
    /// Wrap an octant.
    pub fn new(cell: TreeNode<D>) -> Self {
        Self { cell }
    }

    /// The underlying octant.
    pub fn cell(&self) -> TreeNode<D> {
        self.cell
    }

    #[inline]
    fn node_coords(&self, j: &[u32; D], order: u32) -> [u32; D] {
        let anchor = self.cell.coords();
        let len = self.cell.len() as u64;
        let mut coords = [0u32; D];
        for d in 0..D {
            coords[d] = anchor[d] + ((len * j[d] as u64) / order as u64) as u32;
        }
        coords
    }

    /// Emit the full `(order+1)^D` nodal grid, tagged with this element's
    /// level, in lexicographic order (axis 0 fastest).
    pub fn append_nodes(&self, order: u32, out: &mut Vec<TNPoint<D>>) {
        debug_assert!(order >= 1);
        let mut j = [0u32; D];
        loop {
            out.push(TNPoint::new(self.node_coords(&j, order), self.cell.level()));
            if !advance(&mut j, 0, order) {
                break;
            }
        }
    }

    /// Emit the `(order-1)^D` strictly interior nodes.
    pub fn append_interior_nodes(&self, order: u32, out: &mut Vec<TNPoint<D>>) {
        if order < 2 {
            return;
        }
        let mut j = [1u32; D];
        loop {
            out.push(TNPoint::new(self.node_coords(&j, order), self.cell.level()));
            if !advance(&mut j, 1, order - 1) {
                break;
            }
        }
    }

    /// Emit the boundary nodes of the grid. The walk skips ahead over the
    /// interior run of axis 0 whenever all higher axes are interior.
    pub fn append_exterior_nodes(&self, order: u32, out: &mut Vec<TNPoint<D>>) {
        debug_assert!(order >= 1);
        let mut j = [0u32; D];
        loop {
            let higher_interior = (1..D).all(|d| j[d] >= 1 && j[d] < order);
            out.push(TNPoint::new(self.node_coords(&j, order), self.cell.level()));
            if higher_interior && j[0] == 0 {
                // Only j0 = 0 and j0 = order touch the boundary here.
                j[0] = order;
                continue;
            }
            if !advance(&mut j, 0, order) {
                break;
            }
        }
    }
}

/// Decompose the closed k-face `(anchor, level, orient)` into its `3^fdim`
/// open sub-faces, pushing `(sub_anchor, sub_orient)` pairs.
///
/// Along every interior axis of the face the closure splits into the low
/// boundary point, the open middle, and the high boundary point; the
/// sub-face digits are scattered onto the face axes through the
/// orientation mask.
pub fn append_kfaces<const D: usize>(
    anchor: [u32; D],
    level: u32,
    orient: u8,
    out: &mut Vec<([u32; D], u8)>,
) {
    let len = crate::constants::level_len(level);
    let axes = TallBitMatrix::generate_columns(orient);
    let fdim = axes.num_columns();

    // Mixed-radix counter over {low, mid, high} per face axis.
    let mut state = vec![0u8; fdim];
    loop {
        let mut sub_anchor = anchor;
        let mut sub_orient = 0u8;
        for (t, &s) in state.iter().enumerate() {
            let axis_bit = axes.expand_bitstring(1 << t);
            let d = axis_bit.trailing_zeros() as usize;
            match s {
                0 => {}
                1 => sub_orient |= axis_bit,
                _ => sub_anchor[d] = anchor[d] + len,
            }
        }
        out.push((sub_anchor, sub_orient));

        let mut t = 0;
        loop {
            if t == fdim {
                return;
            }
            state[t] += 1;
            if state[t] <= 2 {
                break;
            }
            state[t] = 0;
            t += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::level_len;

    #[test]
    fn test_append_nodes_counts() {
        let elem = Element::new(TreeNode::<3>::root().child_morton(0));
        for order in 1..=4u32 {
            let mut all = Vec::new();
            elem.append_nodes(order, &mut all);
            assert_eq!(all.len(), ((order + 1).pow(3)) as usize);

            let mut interior = Vec::new();
            elem.append_interior_nodes(order, &mut interior);
            assert_eq!(interior.len(), ((order - 1).pow(3)) as usize);

            let mut exterior = Vec::new();
            elem.append_exterior_nodes(order, &mut exterior);
            assert_eq!(exterior.len(), all.len() - interior.len());
        }
    }

    #[test]
    fn test_exterior_nodes_touch_the_hull() {
        let elem = Element::new(TreeNode::<2>::root().child_morton(3));
        let cell = elem.cell();
        let mut exterior = Vec::new();
        elem.append_exterior_nodes(3, &mut exterior);
        for p in &exterior {
            let on_hull = (0..2).any(|d| {
                p.coords()[d] == cell.coords()[d] || p.coords()[d] == cell.coords()[d] + cell.len()
            });
            assert!(on_hull, "{} is interior", p);
        }
    }

    #[test]
    fn test_node_positions_order_two() {
        let elem = Element::new(TreeNode::<2>::root().child_morton(0));
        let len = level_len(1);
        let mut nodes = Vec::new();
        elem.append_nodes(2, &mut nodes);
        // Lexicographic order, axis 0 fastest.
        assert_eq!(nodes[0].coords(), [0, 0]);
        assert_eq!(nodes[1].coords(), [len / 2, 0]);
        assert_eq!(nodes[2].coords(), [len, 0]);
        assert_eq!(nodes[3].coords(), [0, len / 2]);
        assert_eq!(nodes[8].coords(), [len, len]);
    }

    #[test]
    fn test_shared_face_nodes_coincide() {
        // Sibling octants sharing a face emit identical coordinates on it.
        let root = TreeNode::<2>::root();
        let a = Element::new(root.child_morton(0));
        let b = Element::new(root.child_morton(1));
        let mut na = Vec::new();
        let mut nb = Vec::new();
        a.append_nodes(3, &mut na);
        b.append_nodes(3, &mut nb);
        let shared: Vec<_> = na
            .iter()
            .filter(|p| nb.iter().any(|q| q == *p))
            .collect();
        // The shared edge holds order + 1 nodes.
        assert_eq!(shared.len(), 4);
    }

    #[test]
    fn test_kfaces_counts() {
        let mut out = Vec::new();
        // A 2-face decomposes into 9 open sub-faces.
        append_kfaces::<3>([0, 0, 0], 1, 0b011, &mut out);
        assert_eq!(out.len(), 9);
        // 1 open face + 4 open edges + 4 vertices.
        assert_eq!(out.iter().filter(|(_, o)| o.count_ones() == 2).count(), 1);
        assert_eq!(out.iter().filter(|(_, o)| o.count_ones() == 1).count(), 4);
        assert_eq!(out.iter().filter(|(_, o)| *o == 0).count(), 4);
    }

    #[test]
    fn test_kfaces_anchors() {
        let len = level_len(2);
        let mut out = Vec::new();
        append_kfaces::<2>([len, 0], 2, 0b10, &mut out);
        // An edge along axis 1: two endpoints and the open middle.
        assert_eq!(out.len(), 3);
        assert!(out.contains(&([len, 0], 0)));
        assert!(out.contains(&([len, 0], 0b10)));
        assert!(out.contains(&([len, len], 0)));
    }

    #[test]
    fn test_kfaces_of_a_vertex() {
        let mut out = Vec::new();
        append_kfaces::<2>([0, 0], 1, 0, &mut out);
        assert_eq!(out, vec![([0, 0], 0)]);
    }
}
