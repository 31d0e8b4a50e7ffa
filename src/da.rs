//! The distributed-adaptive consumer surface.
//!
//! A [`Da`] is built from a locally sorted, globally partitioned slice of
//! leaf octants. Construction runs the full node discovery pipeline and
//! leaves behind the owned-node vector, the ghost layer with its exchange
//! plans, and the reference element. The matrix-free operator layer talks
//! to it through [`ElementalOps`] and [`Da::mat_vec`].

use std::collections::HashMap;
use std::mem;

use mpi::request::WaitGuard;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::{Communicator, CommunicatorCollectives, Destination, Source};

use crate::constants::{level_len, DOMAIN_SPAN, MAX_DEPTH};
use crate::hilbert::init_hcurve;
use crate::nsort::{dist_count_cg_nodes, CgNodes};
use crate::refel::RefElement;
use crate::sfc_loop::{SfcTreeLoop, TreeLoopOps};
use crate::tnpoint::TNPoint;
use crate::tools::global_exclusive_sum;
use crate::treenode::TreeNode;
use crate::tsort::tree_part_fronts;

/// The capability set an elemental operator provides to [`Da::mat_vec`].
pub trait ElementalOps<const D: usize> {
    /// Apply the elemental operator to one element's nodal values.
    /// `coords` holds the reference-domain coordinates of the element's
    /// nodes, `D` values per node, axis 0 fastest.
    fn elemental_mat_vec(&mut self, input: &[f64], output: &mut [f64], coords: &[f64], scale: f64);

    /// Called once before the element loop. Return true on success.
    fn pre_mat_vec(&mut self, _input: &[f64], _output: &mut [f64], _scale: f64) -> bool {
        true
    }

    /// Called once after the element loop. Return true on success.
    fn post_mat_vec(&mut self, _input: &[f64], _output: &mut [f64], _scale: f64) -> bool {
        true
    }
}

/// Lookup from `(coords, level)` to the slot in the ghosted node vector.
pub(crate) type NodeIndex<const D: usize> = HashMap<([u32; D], u32), usize>;

/// Map a coordinate offset within a cell back to the 1D grid index that
/// generated it. The truncating-division node positions are strictly
/// increasing, so the index is unique.
fn grid_offset_to_index(offset: u32, len: u32, order: u32) -> Option<u32> {
    (0..=order).find(|&j| ((len as u64 * j as u64) / order as u64) as u32 == offset)
}

/// The value of the CG field at a nodal position of a level-`lev` element
/// grid. Non-hanging positions resolve directly (at their own level, or
/// one level up for coincident coarse nodes); hanging positions
/// interpolate through the parent-level face that contains them,
/// recursively if the face grid itself hangs.
pub(crate) fn node_value<const D: usize>(
    index: &NodeIndex<D>,
    ref_el: &RefElement<D>,
    values: &[f64],
    coords: [u32; D],
    lev: u32,
) -> f64 {
    if let Some(&i) = index.get(&(coords, lev)) {
        return values[i];
    }
    assert!(lev >= 1, "no node at {:?} up to the root", coords);
    if let Some(&i) = index.get(&(coords, lev - 1)) {
        return values[i];
    }

    let mut value = 0.0;
    for_each_parent_face_node(ref_el, coords, lev, |w, cx| {
        value += w * node_value(index, ref_el, values, cx, lev - 1);
    });
    value
}

/// The transpose of [`node_value`]: accumulate a contribution at a nodal
/// position, distributing hanging contributions onto the parent face.
pub(crate) fn node_accumulate<const D: usize>(
    index: &NodeIndex<D>,
    ref_el: &RefElement<D>,
    values: &mut [f64],
    coords: [u32; D],
    lev: u32,
    v: f64,
) {
    if let Some(&i) = index.get(&(coords, lev)) {
        values[i] += v;
        return;
    }
    assert!(lev >= 1, "no node at {:?} up to the root", coords);
    if let Some(&i) = index.get(&(coords, lev - 1)) {
        values[i] += v;
        return;
    }

    for_each_parent_face_node(ref_el, coords, lev, |w, cx| {
        node_accumulate(index, ref_el, values, cx, lev - 1, w * v);
    });
}

/// Enumerate the parent-level face grid nodes that constrain the hanging
/// position `(coords, lev)`, with their interpolation weights.
fn for_each_parent_face_node<const D: usize>(
    ref_el: &RefElement<D>,
    coords: [u32; D],
    lev: u32,
    mut visit: impl FnMut(f64, [u32; D]),
) {
    let order = ref_el.order();
    let n = ref_el.nrp();
    let parent_lev = lev - 1;
    let parent_len = level_len(parent_lev);
    let cell_len = level_len(lev);

    let point = TNPoint::<D>::new(coords, lev);
    let (face_anchor, orient) = point.open_cell_at(parent_lev);
    let cell = point.cell_at(lev);

    // Which half of the parent the containing cell occupies, and the 1D
    // grid index of the point within that cell, per face axis.
    let mut child_bit = [0usize; D];
    let mut jidx = [0usize; D];
    for d in 0..D {
        child_bit[d] = ((cell.coords()[d] >> (MAX_DEPTH - lev)) & 1) as usize;
        if (orient >> d) & 1 != 0 {
            let off = coords[d] - cell.coords()[d];
            jidx[d] = grid_offset_to_index(off, cell_len, order)
                .expect("coordinate is not a grid node of its cell") as usize;
        }
    }

    let tangent: Vec<usize> = (0..D).filter(|d| (orient >> d) & 1 != 0).collect();

    let mut idx = vec![0u32; tangent.len()];
    loop {
        let mut w = 1.0;
        let mut cx = coords;
        for (t, &d) in tangent.iter().enumerate() {
            let i = idx[t] as usize;
            w *= ref_el.ip1d(child_bit[d])[jidx[d] * n + i];
            cx[d] = face_anchor[d] + ((parent_len as u64 * idx[t] as u64) / order as u64) as u32;
        }
        if w != 0.0 {
            visit(w, cx);
        }

        let mut t = 0;
        loop {
            if t == tangent.len() {
                return;
            }
            idx[t] += 1;
            if idx[t] <= order {
                break;
            }
            idx[t] = 0;
            t += 1;
        }
    }
}

/// Gather one element's nodal values from the ghosted vector, resolving
/// hanging positions by interpolation, and emit the node coordinates in
/// units of the reference domain.
pub(crate) fn gather_element<const D: usize>(
    index: &NodeIndex<D>,
    ref_el: &RefElement<D>,
    ghosted: &[f64],
    elem: &TreeNode<D>,
    out: &mut [f64],
    coords_out: &mut [f64],
) {
    let order = ref_el.order();
    let anchor = elem.coords();
    let len = elem.len() as u64;

    let mut j = [0u32; D];
    let mut k = 0;
    loop {
        let mut x = [0u32; D];
        for d in 0..D {
            x[d] = anchor[d] + ((len * j[d] as u64) / order as u64) as u32;
            coords_out[k * D + d] = x[d] as f64 / DOMAIN_SPAN as f64;
        }
        out[k] = node_value(index, ref_el, ghosted, x, elem.level());
        k += 1;

        let mut d = 0;
        loop {
            if d == D {
                debug_assert_eq!(k, out.len());
                return;
            }
            j[d] += 1;
            if j[d] <= order {
                break;
            }
            j[d] = 0;
            d += 1;
        }
    }
}

/// Scatter one element's output contributions back into the ghosted
/// vector, transposing hanging contributions onto the parent face.
pub(crate) fn scatter_element<const D: usize>(
    index: &NodeIndex<D>,
    ref_el: &RefElement<D>,
    ghosted: &mut [f64],
    elem: &TreeNode<D>,
    contrib: &[f64],
) {
    let order = ref_el.order();
    let anchor = elem.coords();
    let len = elem.len() as u64;

    let mut j = [0u32; D];
    let mut k = 0;
    loop {
        let mut x = [0u32; D];
        for d in 0..D {
            x[d] = anchor[d] + ((len * j[d] as u64) / order as u64) as u32;
        }
        node_accumulate(index, ref_el, ghosted, x, elem.level(), contrib[k]);
        k += 1;

        let mut d = 0;
        loop {
            if d == D {
                return;
            }
            j[d] += 1;
            if j[d] <= order {
                break;
            }
            j[d] = 0;
            d += 1;
        }
    }
}

/// Leaf distribution for the element traversal: route each leaf into the
/// child subtree containing it.
struct LeafBucketer<const D: usize>;

impl<const D: usize> TreeLoopOps<D> for LeafBucketer<D> {
    type Input = TreeNode<D>;
    type Output = ();

    fn top_down(
        &mut self,
        subtree: &TreeNode<D>,
        input: &[TreeNode<D>],
        child_input: &mut [Vec<TreeNode<D>>],
    ) -> u16 {
        let mut extant = 0u16;
        for leaf in input {
            debug_assert!(subtree.is_ancestor(leaf));
            if leaf.level() == subtree.level() {
                continue;
            }
            let child = leaf.morton_index(subtree.level() + 1);
            child_input[child].push(*leaf);
            extant |= 1 << child;
        }
        extant
    }

    fn bottom_up(
        &mut self,
        _subtree: &TreeNode<D>,
        _output: &mut Vec<()>,
        _child_output: &mut [Vec<()>],
    ) {
    }
}

/// The distributed-adaptive mesh layer.
pub struct Da<C: CommunicatorCollectives, const D: usize> {
    comm: C,
    active_comm: Option<SimpleCommunicator>,
    tree_part: Vec<TreeNode<D>>,
    order: u32,
    ref_el: RefElement<D>,
    info: CgNodes<D>,
    /// Node keys of the ghosted vector: pre-ghost | owned | post-ghost.
    total_points: Vec<TNPoint<D>>,
    point_index: NodeIndex<D>,
    pre_ghost_len: usize,
    global_node_sz: u64,
    global_node_offset: u64,
    boundary_indices: Vec<u32>,
}

impl<C: CommunicatorCollectives, const D: usize> Da<C, D> {
    /// Build the DA for a locally sorted, globally partitioned slice of
    /// leaves. Every rank of `comm` must hold at least one leaf.
    pub fn new(tree_part: &[TreeNode<D>], order: u32, comm: C) -> Self {
        assert!(
            !tree_part.is_empty(),
            "every rank needs at least one element"
        );
        init_hcurve(D);

        let ref_el = RefElement::<D>::new(order);

        let mut points = Vec::with_capacity(tree_part.len() * ref_el.nodes_per_element());
        for leaf in tree_part {
            crate::element::Element::new(*leaf).append_nodes(order, &mut points);
        }

        let fronts = tree_part_fronts(tree_part, &comm);
        let (global_node_sz, info) = dist_count_cg_nodes(&mut points, order, &fronts, &comm);

        let global_node_offset = global_exclusive_sum(info.owned.len(), &comm) as u64;

        let rank = comm.rank();
        let pre_ghost_len = info.ghosts.iter().filter(|g| g.owner() < rank).count();

        let mut total_points =
            Vec::with_capacity(info.ghosts.len() + info.owned.len());
        total_points.extend_from_slice(&info.ghosts[..pre_ghost_len]);
        total_points.extend_from_slice(&info.owned);
        total_points.extend_from_slice(&info.ghosts[pre_ghost_len..]);

        let point_index: NodeIndex<D> = total_points
            .iter()
            .enumerate()
            .map(|(i, p)| ((p.coords(), p.level()), i))
            .collect();

        let boundary_indices: Vec<u32> = info
            .owned
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_on_domain_boundary())
            .map(|(i, _)| i as u32)
            .collect();

        let active_comm = comm.split_by_color(Color::with_value(0));

        Self {
            comm,
            active_comm,
            tree_part: tree_part.to_vec(),
            order,
            ref_el,
            info,
            total_points,
            point_index,
            pre_ghost_len,
            global_node_sz,
            global_node_offset,
            boundary_indices,
        }
    }

    /// Number of nodes per element, `(order + 1)^D`.
    pub fn num_nodes_per_element(&self) -> usize {
        self.ref_el.nodes_per_element()
    }

    /// The reference element.
    pub fn reference_element(&self) -> &RefElement<D> {
        &self.ref_el
    }

    /// Element order.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// The local leaf partition.
    pub fn tree_part(&self) -> &[TreeNode<D>] {
        &self.tree_part
    }

    /// Number of locally owned nodes.
    pub fn local_nodal_sz(&self) -> usize {
        self.info.owned.len()
    }

    /// Global number of CG nodes.
    pub fn global_node_sz(&self) -> u64 {
        self.global_node_sz
    }

    /// Global index of the first locally owned node.
    pub fn global_node_offset(&self) -> u64 {
        self.global_node_offset
    }

    /// Length of the ghosted vector.
    pub fn total_nodal_sz(&self) -> usize {
        self.total_points.len()
    }

    /// Offset of the owned segment inside the ghosted vector.
    pub fn local_node_begin(&self) -> usize {
        self.pre_ghost_len
    }

    /// The owned node keys, in SFC order.
    pub fn owned_nodes(&self) -> &[TNPoint<D>] {
        &self.info.owned
    }

    /// The ghost node keys, grouped by owner rank: the pre-ghosts (owners
    /// below this rank) followed by the post-ghosts.
    pub fn ghost_nodes(&self) -> &[TNPoint<D>] {
        &self.info.ghosts
    }

    /// Local indices (into the owned segment) of the nodes on the domain
    /// boundary.
    pub fn boundary_node_indices(&self) -> &[u32] {
        &self.boundary_indices
    }

    /// Allocate a zeroed nodal vector, ghosted or owned-only.
    pub fn create_vector(&self, ghosted: bool) -> Vec<f64> {
        vec![
            0.0;
            if ghosted {
                self.total_nodal_sz()
            } else {
                self.local_nodal_sz()
            }
        ]
    }

    /// True if this rank carries elements. Ranks are currently required
    /// to be active; the query mirrors the solver-facing contract.
    pub fn is_active(&self) -> bool {
        !self.tree_part.is_empty()
    }

    /// The communicator of the active ranks.
    pub fn active_comm(&self) -> Option<&SimpleCommunicator> {
        self.active_comm.as_ref()
    }

    /// The communicator the DA was built on.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Fill the ghost segments of a ghosted vector with the owners'
    /// values. Nonblocking sends and receives, all awaited before
    /// returning.
    pub fn read_from_ghosts(&self, vec: &mut [f64]) {
        assert_eq!(vec.len(), self.total_nodal_sz());
        let owned_len = self.local_nodal_sz();
        let sm = &self.info.scatter;
        let gm = &self.info.gather;
        if sm.send_procs.is_empty() && gm.recv_procs.is_empty() {
            return;
        }

        let send_buf: Vec<f64> = sm
            .send_ids
            .iter()
            .map(|&id| vec[self.pre_ghost_len + id as usize])
            .collect();

        // Carve the per-source ghost segments out of the vector.
        let (pre_part, rest) = vec.split_at_mut(self.pre_ghost_len);
        let (_, post_part) = rest.split_at_mut(owned_len);
        let mut pre_rest = pre_part;
        let mut post_rest = post_part;
        let mut segments: Vec<(i32, &mut [f64])> = Vec::new();
        for k in 0..gm.recv_procs.len() {
            let cnt = gm.recv_counts[k] as usize;
            let seg;
            if (gm.recv_offsets[k] as usize) < self.pre_ghost_len {
                let (a, b) = mem::take(&mut pre_rest).split_at_mut(cnt);
                seg = a;
                pre_rest = b;
            } else {
                let (a, b) = mem::take(&mut post_rest).split_at_mut(cnt);
                seg = a;
                post_rest = b;
            }
            segments.push((gm.recv_procs[k], seg));
        }

        mpi::request::scope(|scope| {
            let mut guards = Vec::new();
            for (rank, seg) in segments {
                guards.push(WaitGuard::from(
                    self.comm
                        .process_at_rank(rank)
                        .immediate_receive_into(scope, seg),
                ));
            }
            for (k, &rank) in sm.send_procs.iter().enumerate() {
                let begin = sm.send_offsets[k] as usize;
                let end = begin + sm.send_counts[k] as usize;
                guards.push(WaitGuard::from(
                    self.comm
                        .process_at_rank(rank)
                        .immediate_send(scope, &send_buf[begin..end]),
                ));
            }
        });
    }

    /// Accumulate the ghost segments of a ghosted vector back onto the
    /// owners (the transpose of [`Self::read_from_ghosts`]).
    pub fn write_to_ghosts(&self, vec: &mut [f64]) {
        assert_eq!(vec.len(), self.total_nodal_sz());
        let owned_len = self.local_nodal_sz();
        let sm = &self.info.scatter;
        let gm = &self.info.gather;
        if sm.send_procs.is_empty() && gm.recv_procs.is_empty() {
            return;
        }

        let mut recv_buf = vec![0.0f64; sm.send_ids.len()];

        mpi::request::scope(|scope| {
            let mut guards = Vec::new();
            let mut rest = &mut recv_buf[..];
            for k in 0..sm.send_procs.len() {
                let cnt = sm.send_counts[k] as usize;
                let (seg, b) = mem::take(&mut rest).split_at_mut(cnt);
                rest = b;
                guards.push(WaitGuard::from(
                    self.comm
                        .process_at_rank(sm.send_procs[k])
                        .immediate_receive_into(scope, seg),
                ));
            }
            for k in 0..gm.recv_procs.len() {
                let cnt = gm.recv_counts[k] as usize;
                let ghost_off = gm.recv_offsets[k] as usize;
                let begin = if ghost_off < self.pre_ghost_len {
                    ghost_off
                } else {
                    owned_len + ghost_off
                };
                guards.push(WaitGuard::from(
                    self.comm
                        .process_at_rank(gm.recv_procs[k])
                        .immediate_send(scope, &vec[begin..begin + cnt]),
                ));
            }
        });

        for (k, &id) in sm.send_ids.iter().enumerate() {
            vec[self.pre_ghost_len + id as usize] += recv_buf[k];
        }
    }

    /// Matrix-free operator application: `output = A * input` over the
    /// owned nodes, with ghost read before and ghost accumulation after
    /// the element loop. Returns false if a pre or post hook fails.
    pub fn mat_vec<Op: ElementalOps<D>>(
        &self,
        op: &mut Op,
        input: &[f64],
        output: &mut [f64],
        scale: f64,
    ) -> bool {
        let owned_len = self.local_nodal_sz();
        assert_eq!(input.len(), owned_len);
        assert_eq!(output.len(), owned_len);

        if !op.pre_mat_vec(input, output, scale) {
            return false;
        }

        let mut ghosted_in = self.create_vector(true);
        ghosted_in[self.pre_ghost_len..self.pre_ghost_len + owned_len].copy_from_slice(input);
        self.read_from_ghosts(&mut ghosted_in);

        let mut ghosted_out = self.create_vector(true);

        let npe = self.num_nodes_per_element();
        let mut elem_in = vec![0.0; npe];
        let mut elem_out = vec![0.0; npe];
        let mut elem_coords = vec![0.0; npe * D];

        let mut lp = SfcTreeLoop::new(self.tree_part.clone(), LeafBucketer::<D>);
        while !lp.is_finished() {
            let at_leaf = lp.is_pre()
                && lp.input().len() == 1
                && lp.input()[0].level() == lp.subtree().level();
            if !at_leaf {
                lp.step();
                continue;
            }
            let elem = lp.input()[0];
            gather_element(
                &self.point_index,
                &self.ref_el,
                &ghosted_in,
                &elem,
                &mut elem_in,
                &mut elem_coords,
            );
            elem_out.fill(0.0);
            op.elemental_mat_vec(&elem_in, &mut elem_out, &elem_coords, scale);
            scatter_element(
                &self.point_index,
                &self.ref_el,
                &mut ghosted_out,
                &elem,
                &elem_out,
            );
            lp.next();
        }

        self.write_to_ghosts(&mut ghosted_out);
        output
            .copy_from_slice(&ghosted_out[self.pre_ghost_len..self.pre_ghost_len + owned_len]);

        op.post_mat_vec(input, output, scale)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::Element;
    use crate::nsort::resolve_global;
    use crate::tsort::{loc_tree_sort, loc_tree_sort_points};

    /// Serial node discovery for a single-rank mesh: owned nodes, index
    /// map, reference element.
    fn serial_setup<const D: usize>(
        elems: &[TreeNode<D>],
        order: u32,
    ) -> (Vec<TNPoint<D>>, NodeIndex<D>, RefElement<D>) {
        let mut points = Vec::new();
        for e in elems {
            Element::new(*e).append_nodes(order, &mut points);
        }
        loc_tree_sort_points(&mut points);
        let fronts = vec![elems[0]];
        let info = resolve_global(&mut points, order, 0, &fronts);
        let index: NodeIndex<D> = info
            .owned
            .iter()
            .enumerate()
            .map(|(i, p)| ((p.coords(), p.level()), i))
            .collect();
        (info.owned, index, RefElement::<D>::new(order))
    }

    fn apply_identity<const D: usize>(
        elems: &[TreeNode<D>],
        index: &NodeIndex<D>,
        ref_el: &RefElement<D>,
        input: &[f64],
    ) -> Vec<f64> {
        let npe = ref_el.nodes_per_element();
        let mut out = vec![0.0; input.len()];
        let mut elem_in = vec![0.0; npe];
        let mut coords = vec![0.0; npe * D];
        for e in elems {
            gather_element(index, ref_el, input, e, &mut elem_in, &mut coords);
            scatter_element(index, ref_el, &mut out, e, &elem_in);
        }
        out
    }

    #[test]
    fn test_uniform_incidence_counts() {
        // Identity elemental op on a conforming grid: each node
        // accumulates one contribution per incident element.
        let mut elems: Vec<_> = (0..4).map(|k| TreeNode::<2>::root().child_morton(k)).collect();
        loc_tree_sort(&mut elems);
        let (owned, index, ref_el) = serial_setup(&elems, 1);
        assert_eq!(owned.len(), 9);

        let ones = vec![1.0; owned.len()];
        let out = apply_identity(&elems, &index, &ref_el, &ones);

        let h = level_len(1);
        for (p, &v) in owned.iter().zip(&out) {
            let incident = elems
                .iter()
                .filter(|e| {
                    (0..2).all(|d| {
                        let x = p.coords()[d];
                        e.coords()[d] <= x && x <= e.coords()[d] + h
                    })
                })
                .count();
            assert!((v - incident as f64).abs() < 1e-12, "node {}", p);
        }
    }

    fn refined_mesh_2d() -> Vec<TreeNode<2>> {
        let root = TreeNode::<2>::root();
        let mut elems: Vec<_> = (0..4)
            .map(|k| root.child_morton(0).child_morton(k))
            .collect();
        elems.extend((1..4).map(|k| root.child_morton(k)));
        loc_tree_sort(&mut elems);
        elems
    }

    #[test]
    fn test_hanging_interpolation_conserves_mass() {
        // The hanging transposition distributes contributions with
        // partition-of-unity weights, so the global sum of an identity
        // apply equals (number of elements) * (nodes per element).
        for order in [1u32, 2, 3] {
            let elems = refined_mesh_2d();
            let (owned, index, ref_el) = serial_setup(&elems, order);

            let ones = vec![1.0; owned.len()];
            let out = apply_identity(&elems, &index, &ref_el, &ones);

            let total: f64 = out.iter().sum();
            let expected = (elems.len() * ref_el.nodes_per_element()) as f64;
            assert!(
                (total - expected).abs() < 1e-9,
                "order {}: {} vs {}",
                order,
                total,
                expected
            );
        }
    }

    #[test]
    fn test_hanging_apply_is_symmetric() {
        // The identity elemental operator yields a symmetric assembled
        // operator; gather and scatter must be exact transposes for the
        // symmetry to survive hanging-node interpolation.
        let elems = refined_mesh_2d();
        let (owned, index, ref_el) = serial_setup(&elems, 2);

        let n = owned.len();
        let u: Vec<f64> = (0..n).map(|i| ((i * 13 + 5) % 17) as f64).collect();
        let v: Vec<f64> = (0..n).map(|i| ((i * 11 + 2) % 19) as f64).collect();

        let au = apply_identity(&elems, &index, &ref_el, &u);
        let av = apply_identity(&elems, &index, &ref_el, &v);

        let dot = |a: &[f64], b: &[f64]| -> f64 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!((dot(&au, &v) - dot(&u, &av)).abs() < 1e-8);
    }

    #[test]
    fn test_constant_reproduction_on_hanging_face() {
        // Gathering the all-ones field on any element reproduces ones at
        // every node, including interpolated hanging positions (law L2).
        for order in [1u32, 2, 3] {
            let elems = refined_mesh_2d();
            let (owned, index, ref_el) = serial_setup(&elems, order);
            let ones = vec![1.0; owned.len()];
            let npe = ref_el.nodes_per_element();
            let mut elem_in = vec![0.0; npe];
            let mut coords = vec![0.0; npe * 2];
            for e in &elems {
                gather_element(&index, &ref_el, &ones, e, &mut elem_in, &mut coords);
                for &v in &elem_in {
                    assert!((v - 1.0).abs() < 1e-10, "order {} element {}", order, e);
                }
            }
        }
    }
}
