//! The hyperoctant key type and the SFC total order.

use std::cmp::Ordering;
use std::mem::offset_of;

use mpi::datatype::{UncommittedDatatypeRef, UserDatatype};
use mpi::traits::Equivalence;

use crate::constants::{level_len, DOMAIN_SPAN, MAX_DEPTH};
use crate::hilbert::hcurve_tables;

/// A hyperoctant: an axis-aligned cube at refinement level `level` whose
/// anchor (lexicographically smallest corner) is `coords`.
///
/// Every anchor coordinate is a multiple of the side length
/// `2^(MAX_DEPTH - level)`. The root octant is the whole domain.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct TreeNode<const D: usize> {
    coords: [u32; D],
    level: u32,
}

impl<const D: usize> TreeNode<D> {
    /// Number of children of a hyperoctant in `D` dimensions.
    pub const NUM_CHILDREN: usize = 1 << D;

    /// Create a new octant from an anchor and a level.
    pub fn new(coords: [u32; D], level: u32) -> Self {
        debug_assert!(level <= MAX_DEPTH);
        debug_assert!(coords
            .iter()
            .all(|&x| x % level_len(level) == 0 && x < DOMAIN_SPAN));
        Self { coords, level }
    }

    /// The root octant covering the whole domain.
    pub fn root() -> Self {
        Self {
            coords: [0; D],
            level: 0,
        }
    }

    /// Refinement level.
    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Anchor coordinates.
    #[inline]
    pub fn coords(&self) -> [u32; D] {
        self.coords
    }

    /// Side length of the octant.
    #[inline]
    pub fn len(&self) -> u32 {
        level_len(self.level)
    }

    /// The Morton child index of the level-`lev` ancestor of this octant
    /// within its parent: bit `MAX_DEPTH - lev` of each coordinate, packed
    /// low to high across axes. Requires `1 <= lev <= level`.
    #[inline]
    pub fn morton_index(&self, lev: u32) -> usize {
        debug_assert!(lev >= 1 && lev <= MAX_DEPTH);
        let shift = MAX_DEPTH - lev;
        let mut child = 0;
        for d in 0..D {
            child |= (((self.coords[d] >> shift) & 1) as usize) << d;
        }
        child
    }

    /// The child octant whose Morton index relative to this octant is
    /// `child`.
    pub fn child_morton(&self, child: usize) -> Self {
        debug_assert!(child < Self::NUM_CHILDREN);
        debug_assert!(self.level < MAX_DEPTH);
        let child_len = level_len(self.level + 1);
        let mut coords = self.coords;
        for (d, x) in coords.iter_mut().enumerate() {
            *x += child_len * (((child >> d) & 1) as u32);
        }
        Self {
            coords,
            level: self.level + 1,
        }
    }

    /// The parent octant.
    pub fn parent(&self) -> Self {
        debug_assert!(self.level > 0);
        let parent_len = level_len(self.level - 1);
        let mut coords = self.coords;
        for x in coords.iter_mut() {
            *x -= *x % parent_len;
        }
        Self {
            coords,
            level: self.level - 1,
        }
    }

    /// The ancestor at level `lev <= level`.
    pub fn ancestor(&self, lev: u32) -> Self {
        debug_assert!(lev <= self.level);
        let len = level_len(lev);
        let mut coords = self.coords;
        for x in coords.iter_mut() {
            *x -= *x % len;
        }
        Self { coords, level: lev }
    }

    /// True if `self` is an ancestor of `other`. An octant is an ancestor
    /// of itself.
    pub fn is_ancestor(&self, other: &Self) -> bool {
        if other.level < self.level {
            return false;
        }
        let shift = MAX_DEPTH - self.level;
        (0..D).all(|d| (other.coords[d] >> shift) == (self.coords[d] >> shift))
    }

    /// True if the octant touches the boundary of the domain.
    pub fn is_on_domain_boundary(&self) -> bool {
        let len = self.len();
        self.coords
            .iter()
            .any(|&x| x == 0 || x + len == DOMAIN_SPAN)
    }

    /// The first descendant of this octant on the deepest level.
    pub fn deepest_first_descendant(&self) -> Self {
        Self {
            coords: self.coords,
            level: MAX_DEPTH,
        }
    }

    /// The last descendant of this octant on the deepest level.
    pub fn deepest_last_descendant(&self) -> Self {
        let len = self.len();
        let mut coords = self.coords;
        for x in coords.iter_mut() {
            *x += len - 1;
        }
        Self {
            coords,
            level: MAX_DEPTH,
        }
    }
}

impl<const D: usize> std::fmt::Display for TreeNode<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(level: {}, anchor: {:?})", self.level, self.coords)
    }
}

// The derive macro cannot emit a datatype for `[u32; D]` under a const
// generic, so the layout is described by hand. Depending on the MPI
// implementation the displacement type is an i64 or isize, hence the
// conversion dance.
unsafe impl<const D: usize> Equivalence for TreeNode<D> {
    type Out = UserDatatype;

    #[allow(clippy::useless_conversion)]
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured::<UncommittedDatatypeRef>(
            &[D as i32, 1],
            &[
                (offset_of!(TreeNode<D>, coords) as i64).try_into().unwrap(),
                (offset_of!(TreeNode<D>, level) as i64).try_into().unwrap(),
            ],
            &[
                u32::equivalent_datatype().into(),
                u32::equivalent_datatype().into(),
            ],
        )
    }
}

/// The SFC-maximal deepest descendant of `node`: the unit cell visited
/// last by the curve inside the subtree. This is in general not the
/// Morton-maximal corner, because the curve exits a subtree through a
/// rotation-dependent child.
pub fn sfc_last_descendant<const D: usize>(node: &TreeNode<D>) -> TreeNode<D> {
    let tables = hcurve_tables(D);
    let nc = tables.num_children();

    // Recover the rotation at `node` by walking down from the root.
    let mut rot = 0u32;
    for lev in 1..=node.level() {
        rot = tables.child_rotation(rot, node.morton_index(lev));
    }

    // Descend through the SFC-last child until the deepest level.
    let mut cell = *node;
    while cell.level() < MAX_DEPTH {
        let child = tables.sfc_to_morton(rot, nc - 1);
        rot = tables.child_rotation(rot, child);
        cell = cell.child_morton(child);
    }
    cell
}

/// Total SFC order on octants. An ancestor sorts before all of its
/// descendants; disjoint octants order by the SFC rank of the children in
/// which their paths from the root diverge.
pub fn sfc_compare_nodes<const D: usize>(a: &TreeNode<D>, b: &TreeNode<D>) -> Ordering {
    let tables = hcurve_tables(D);
    let mut rot = 0u32;
    let mut lev = 0u32;
    loop {
        if lev == a.level() && lev == b.level() {
            return Ordering::Equal;
        }
        if lev == a.level() {
            return Ordering::Less;
        }
        if lev == b.level() {
            return Ordering::Greater;
        }
        let ca = a.morton_index(lev + 1);
        let cb = b.morton_index(lev + 1);
        if ca != cb {
            return tables.morton_to_sfc(rot, ca).cmp(&tables.morton_to_sfc(rot, cb));
        }
        rot = tables.child_rotation(rot, ca);
        lev += 1;
    }
}
