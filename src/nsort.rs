//! The node-sort core: duplicate collapse, hanging-node classification,
//! ownership resolution, and construction of the ghost scatter map.
//!
//! Elements emit their nodal grids independently, so a continuous-Galerkin
//! node shared by several elements arrives as a multiset of replicas. The
//! routines here collapse literal duplicates, decide for every location
//! whether it is an independent degree of freedom or hangs off a coarser
//! neighbor, pick a single owning process for every shared node, and build
//! the send/receive plans for ghost exchange.

use std::collections::{BTreeSet, HashMap, HashSet};

use mpi::collective::SystemOperation;
use mpi::traits::CommunicatorCollectives;

use crate::constants::{level_len, DOMAIN_SPAN, MAX_DEPTH};
use crate::element::append_kfaces;
use crate::hilbert::hcurve_tables;
use crate::tnpoint::{sfc_compare_points, Selection, TNPoint};
use crate::tools::redistribute;
use crate::treenode::{sfc_compare_nodes, sfc_last_descendant, TreeNode};
use crate::tsort::{bucket_by, loc_tree_sort_points};

/// Which owned nodes to send to which neighbor processes: indices into the
/// owned-node vector, grouped by destination rank (ascending), ascending
/// within each destination.
#[derive(Clone, Debug, Default)]
pub struct ScatterMap {
    /// Owned-node indices, concatenated per destination.
    pub send_ids: Vec<u32>,
    /// Number of entries per destination process.
    pub send_counts: Vec<i32>,
    /// Offset of each destination's block in `send_ids`.
    pub send_offsets: Vec<i32>,
    /// The destination ranks, ascending.
    pub send_procs: Vec<i32>,
}

/// The receiving side of the ghost exchange: how many ghost nodes arrive
/// from which source rank. Ghost nodes are stored grouped by source rank,
/// SFC-sorted within each group, matching the sender's scatter order.
#[derive(Clone, Debug, Default)]
pub struct GatherMap {
    /// Number of ghost nodes per source process.
    pub recv_counts: Vec<i32>,
    /// Offset of each source's block in the ghost vector.
    pub recv_offsets: Vec<i32>,
    /// The source ranks, ascending.
    pub recv_procs: Vec<i32>,
}

/// The outcome of distributed node discovery on one process.
#[derive(Clone, Debug)]
pub struct CgNodes<const D: usize> {
    /// The nodes owned by this process, in SFC order.
    pub owned: Vec<TNPoint<D>>,
    /// Remotely owned nodes referenced by local elements, grouped by
    /// owner rank, SFC-sorted within each group. The `owner` field holds
    /// the owning rank.
    pub ghosts: Vec<TNPoint<D>>,
    /// Ghost-exchange send plan.
    pub scatter: ScatterMap,
    /// Ghost-exchange receive plan.
    pub gather: GatherMap,
}

/// Collapse literal duplicates at the same `(coords, level, owner)`. The
/// first replica of each group survives and accumulates the instance
/// counts; consumed duplicates are zeroed out. Requires point-sorted
/// input. Returns the number of survivors.
pub fn count_instances<const D: usize>(points: &mut [TNPoint<D>]) -> usize {
    let mut unique = 0;
    let mut i = 0;
    while i < points.len() {
        let mut j = i + 1;
        while j < points.len() && points[j] == points[i] {
            j += 1;
        }
        // Within one (coords, level) group, merge per contributing owner.
        points[i..j].sort_by_key(|p| p.owner());
        let mut s = i;
        while s < j {
            let owner = points[s].owner();
            let mut t = s + 1;
            while t < j && points[t].owner() == owner {
                let extra = points[t].num_instances();
                points[t].clear_instances();
                points[s].add_instances(extra);
                t += 1;
            }
            unique += 1;
            s = t;
        }
        i = j;
    }
    unique
}

/// Drop consumed duplicates.
pub fn compact_duplicates<const D: usize>(points: &mut Vec<TNPoint<D>>) {
    points.retain(|p| p.num_instances() > 0);
}

/// One survivor per unique coordinate location, marked `Yes`; everything
/// else `No`. The coarsest live replica survives. Used for the domain
/// boundary, where every location is a degree of freedom.
fn scan_for_duplicates<const D: usize>(points: &mut [TNPoint<D>]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < points.len() {
        let coords = points[i].coords();
        let mut survivor = None;
        let mut j = i;
        while j < points.len() && points[j].coords() == coords {
            if survivor.is_none() && points[j].num_instances() > 0 {
                survivor = Some(j);
            }
            points[j].set_selection(Selection::No);
            j += 1;
        }
        if let Some(k) = survivor {
            points[k].set_selection(Selection::Yes);
            count += 1;
        }
        i = j;
    }
    count
}

/// Resolve a run of coincident-coordinate points for order <= 2, where
/// coordinates of coarse and fine nodes still coincide exactly.
fn resolve_interface_low_order<const D: usize>(points: &mut [TNPoint<D>]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < points.len() {
        let coords = points[i].coords();
        let mut j = i;
        while j < points.len() && points[j].coords() == coords {
            j += 1;
        }

        let run = &mut points[i..j];
        let coarsest = run
            .iter()
            .filter(|p| p.num_instances() > 0)
            .map(|p| p.level())
            .min();

        let mut selected = None;
        if let Some(lmin) = coarsest {
            let multi_level = run
                .iter()
                .any(|p| p.num_instances() > 0 && p.level() != lmin);
            if multi_level {
                // The coarsest replica is non-hanging; the finer copies
                // hang off it.
                selected = run
                    .iter()
                    .position(|p| p.num_instances() > 0 && p.level() == lmin);
            } else {
                // Single level: non-hanging iff the full number of
                // incident elements of this cell type emitted the node.
                let total: u32 = run
                    .iter()
                    .map(|p| p.num_instances() as u32)
                    .sum();
                let first = run.iter().position(|p| p.num_instances() > 0).unwrap();
                let cell_dim = run[first].cell_type().cell_dim() as u32;
                if total == 1u32 << (D as u32 - cell_dim) {
                    selected = Some(first);
                }
            }
        }

        for p in run.iter_mut() {
            p.set_selection(Selection::No);
        }
        if let Some(k) = selected {
            run[k].set_selection(Selection::Yes);
            count += 1;
        }
        i = j;
    }
    count
}

/// Resolve an ancestor set for order >= 3, where coordinates no longer
/// coincide across levels.
///
/// The evidence table holds the native open cell of every live point. A
/// point at level L hangs exactly when its open cell on the level L-1
/// grid appears as the native cell of a point at level L-1: the witness
/// is a node interior to the coarse k-face the point sits on, and for
/// order >= 3 at least one such interior node falls into every child
/// sub-cell of a present parent face, so a missing witness proves the
/// parent face is absent.
fn resolve_interface_high_order<const D: usize>(points: &mut [TNPoint<D>]) -> usize {
    let mut native: HashSet<([u32; D], u32, u8)> = HashSet::new();
    for p in points.iter() {
        if p.num_instances() == 0 {
            continue;
        }
        let (anchor, orient) = p.open_cell_at(p.level());
        native.insert((anchor, p.level(), orient));
    }

    let hanging = |p: &TNPoint<D>| -> bool {
        if p.level() == 0 {
            return false;
        }
        let parent_lev = p.level() - 1;
        let (anchor, orient) = p.open_cell_at(parent_lev);
        native.contains(&(anchor, parent_lev, orient))
    };

    let mut count = 0;
    let mut i = 0;
    while i < points.len() {
        let coords = points[i].coords();
        let mut j = i;
        while j < points.len() && points[j].coords() == coords {
            j += 1;
        }

        let run = &mut points[i..j];
        let selected = run
            .iter()
            .position(|p| p.num_instances() > 0 && !hanging(p));

        for p in run.iter_mut() {
            p.set_selection(Selection::No);
        }
        if let Some(k) = selected {
            run[k].set_selection(Selection::Yes);
            count += 1;
        }
        i = j;
    }
    count
}

/// Classify the ancestor set of one bucket: the points living on the
/// child-grid hyperplanes of the current cell.
fn resolve_ancestors<const D: usize>(points: &mut [TNPoint<D>], lev: u32, order: u32) -> usize {
    if points.is_empty() {
        return 0;
    }

    // Group by the first incident hyperplane of the child grid, then
    // restore SFC point order within each group so that coincident
    // locations are contiguous.
    points.sort_by_key(|p| p.first_incident_hyperplane(lev + 1));
    let mut start = 0;
    while start < points.len() {
        let axis = points[start].first_incident_hyperplane(lev + 1);
        let mut end = start + 1;
        while end < points.len() && points[end].first_incident_hyperplane(lev + 1) == axis {
            end += 1;
        }
        loc_tree_sort_points(&mut points[start..end]);
        start = end;
    }

    if order <= 2 {
        resolve_interface_low_order(points)
    } else {
        resolve_interface_high_order(points)
    }
}

/// Recursive interior classification: bucket by the finest open
/// container. Points whose container is the current cell live on its
/// child hyperplanes and are resolved here; the rest descend.
fn count_cg_nodes_impl<const D: usize>(
    points: &mut [TNPoint<D>],
    lev: u32,
    p_rot: u32,
    order: u32,
) -> usize {
    if points.is_empty() {
        return 0;
    }
    let tables = hcurve_tables(D);
    let nc = tables.num_children();

    let buckets = bucket_by(points, tables, p_rot, |p: &TNPoint<D>| {
        if p.finest_open_container().level() <= lev {
            None
        } else {
            Some(p.morton_digit(lev + 1))
        }
    });

    let mut count = resolve_ancestors(&mut points[..buckets.ancestor_end], lev, order);

    if lev < MAX_DEPTH {
        for w in 0..nc {
            let child = tables.sfc_to_morton(p_rot, w);
            let c_rot = tables.child_rotation(p_rot, child);
            let begin = if w == 0 {
                buckets.ancestor_end
            } else {
                buckets.splitters[w]
            };
            let end = buckets.splitters[w + 1];
            if end > begin {
                count += count_cg_nodes_impl(&mut points[begin..end], lev + 1, c_rot, order);
            }
        }
    }
    count
}

/// Count the unique continuous-Galerkin nodes of a locally sorted point
/// multiset.
///
/// With `classify == false` only literal duplicates are collapsed
/// (instance counting); the array keeps one live replica per
/// `(coords, level, owner)` with the merged instance count.
///
/// With `classify == true` the full classification runs: domain-boundary
/// locations are deduplicated and selected, interior locations are
/// resolved as hanging or non-hanging, and on return every distinct
/// coordinate location carries exactly one `Yes` replica or only `No`
/// replicas. The relative order of the points is not preserved.
pub fn count_cg_nodes<const D: usize>(
    points: &mut [TNPoint<D>],
    order: u32,
    classify: bool,
) -> usize {
    if points.is_empty() {
        return 0;
    }
    if !classify {
        return count_instances(points);
    }

    count_instances(points);

    // Partition into interior (front) and domain boundary (back),
    // preserving order within both classes.
    let n = points.len();
    let mut interior = Vec::with_capacity(n);
    let mut boundary = Vec::new();
    for p in points.iter() {
        if p.is_on_domain_boundary() {
            boundary.push(*p);
        } else {
            interior.push(*p);
        }
    }
    let n_int = interior.len();
    points[..n_int].copy_from_slice(&interior);
    points[n_int..].copy_from_slice(&boundary);

    // Boundary points land in different top-level buckets than their
    // elements would suggest, so they get their own re-bucketed sort.
    loc_tree_sort_points(&mut points[n_int..]);
    let boundary_count = scan_for_duplicates(&mut points[n_int..]);

    let interior_count = count_cg_nodes_impl(&mut points[..n_int], 0, 0, order);

    boundary_count + interior_count
}

#[inline]
fn effective_rank<const D: usize>(p: &TNPoint<D>, my_rank: i32) -> i32 {
    if p.owner() < 0 {
        my_rank
    } else {
        p.owner()
    }
}

/// The rank whose partition contains `key`, located by binary search over
/// the partition fronts.
fn owner_rank<const D: usize>(fronts: &[TreeNode<D>], key: &TreeNode<D>) -> usize {
    let idx = fronts
        .partition_point(|f| sfc_compare_nodes(f, key) != std::cmp::Ordering::Greater);
    idx.saturating_sub(1)
}

/// Push the 1-ring of level-`lev` cells around the point, clipped to the
/// domain.
fn append_neighbour_cells<const D: usize>(
    p: &TNPoint<D>,
    lev: u32,
    keys: &mut Vec<TreeNode<D>>,
) {
    let len = level_len(lev) as i64;
    let base = p.cell_at(lev).coords();

    let mut delta = [-1i64; D];
    'outer: loop {
        let mut coords = [0u32; D];
        let mut valid = true;
        for d in 0..D {
            let x = base[d] as i64 + delta[d] * len;
            if x < 0 || x >= DOMAIN_SPAN as i64 {
                valid = false;
                break;
            }
            coords[d] = x as u32;
        }
        if valid {
            keys.push(TreeNode::new(coords, lev));
        }

        for d in 0..D {
            delta[d] += 1;
            if delta[d] <= 1 {
                continue 'outer;
            }
            delta[d] = -1;
        }
        break;
    }
}

/// The remote processes whose partitions intersect the neighborhood of a
/// point: the 1-ring of parent-level cells around it, plus the unit-cell
/// ring when the point sits mid-edge of its parent, looked up against the
/// partition fronts.
///
/// The ring is taken one level up so that it covers every element
/// incident on any node of the point's parent-face closure. A hanging
/// point interpolates through that whole closed face, so the halo has to
/// reach its far end even when the fine side of the interface is split
/// across processes.
fn neighbor_ranks<const D: usize>(
    p: &TNPoint<D>,
    fronts: &[TreeNode<D>],
    my_rank: i32,
) -> BTreeSet<i32> {
    let mut procs = BTreeSet::new();
    if fronts.len() <= 1 {
        return procs;
    }

    let mut keys = Vec::new();
    let lev = p.level().saturating_sub(1);
    append_neighbour_cells(p, lev, &mut keys);
    if p.is_crossing() {
        append_neighbour_cells(p, MAX_DEPTH, &mut keys);
    }

    for key in &keys {
        let first = owner_rank(fronts, key);
        let last = owner_rank(fronts, &sfc_last_descendant(key));
        for r in first..=last {
            if r as i32 != my_rank {
                procs.insert(r as i32);
            }
        }
    }
    procs
}

/// Build the per-destination boundary layer: every unique local point is
/// copied to each process whose partition intersects its neighborhood,
/// stamped with the sending rank.
pub(crate) fn boundary_send_lists<const D: usize>(
    points: &[TNPoint<D>],
    fronts: &[TreeNode<D>],
    my_rank: i32,
) -> Vec<Vec<TNPoint<D>>> {
    let mut lists = vec![Vec::new(); fronts.len()];
    for p in points {
        for q in neighbor_ranks(p, fronts, my_rank) {
            let mut copy = *p;
            copy.set_owner(my_rank);
            lists[q as usize].push(copy);
        }
    }
    lists
}

/// Open k-faces annotated with remote owner ranks, indexed by
/// `(anchor, level, orientation)`.
struct FaceTable<const D: usize> {
    cells: HashMap<([u32; D], u32, u8), BTreeSet<i32>>,
    levels: BTreeSet<u32>,
    scratch: Vec<([u32; D], u8)>,
}

impl<const D: usize> FaceTable<D> {
    fn new() -> Self {
        Self {
            cells: HashMap::new(),
            levels: BTreeSet::new(),
            scratch: Vec::new(),
        }
    }

    /// Decompose the closed face of `point`'s open cell on the level
    /// `face_lev` grid into open sub-faces owned by `rank`. Duplicate
    /// (face, owner) pairs coalesce; distinct owners of one face are all
    /// kept.
    fn add_closed_face(&mut self, point: &TNPoint<D>, face_lev: u32, rank: i32) {
        let (anchor, orient) = point.open_cell_at(face_lev);
        self.scratch.clear();
        append_kfaces(anchor, face_lev, orient, &mut self.scratch);
        for k in 0..self.scratch.len() {
            let (a, o) = self.scratch[k];
            self.cells.entry((a, face_lev, o)).or_default().insert(rank);
        }
        self.levels.insert(face_lev);
    }

    /// Collect the owners of every face the point lies on.
    fn ranks_on(&self, p: &TNPoint<D>, out: &mut BTreeSet<i32>) {
        for &lev in &self.levels {
            let (anchor, orient) = p.open_cell_at(lev);
            if let Some(ranks) = self.cells.get(&(anchor, lev, orient)) {
                out.extend(ranks.iter().copied());
            }
        }
    }
}

/// Classify the union of local and received points, finalize ownership,
/// and derive the scatter and gather plans. Pure except for the point
/// array; all collective communication stays in [`dist_count_cg_nodes`].
pub(crate) fn resolve_global<const D: usize>(
    points: &mut Vec<TNPoint<D>>,
    order: u32,
    my_rank: i32,
    fronts: &[TreeNode<D>],
) -> CgNodes<D> {
    loc_tree_sort_points(points);
    count_cg_nodes(points, order, true);

    // Classification permutes the array; restore the deterministic global
    // order before walking coincidence runs.
    points.sort_by(sfc_compare_points);

    let mut owned: Vec<TNPoint<D>> = Vec::new();
    let mut ghost_candidates: Vec<TNPoint<D>> = Vec::new();
    let mut sender_faces = FaceTable::<D>::new();
    let mut receiver_faces = FaceTable::<D>::new();

    let pts = &mut points[..];
    let mut i = 0;
    while i < pts.len() {
        let coords = pts[i].coords();
        let mut j = i;
        while j < pts.len() && pts[j].coords() == coords {
            j += 1;
        }

        // The level subgroup holding this location's Yes mark, if any.
        let yes_level = pts[i..j]
            .iter()
            .find(|p| p.selection() == Selection::Yes)
            .map(|p| p.level());

        let mut s = i;
        while s < j {
            let level = pts[s].level();
            let mut t = s + 1;
            while t < j && pts[t].level() == level {
                t += 1;
            }

            let non_hanging = yes_level == Some(level);
            let crossing = pts[s].is_crossing();

            if non_hanging {
                // Minimum effective rank wins; the local replica counts
                // as this process' rank, so every contender agrees.
                let winner = pts[s..t]
                    .iter()
                    .filter(|p| p.num_instances() > 0)
                    .map(|p| effective_rank(p, my_rank))
                    .min()
                    .unwrap_or(my_rank);

                let mut canonical = pts[s];
                if winner == my_rank {
                    canonical.set_owner(-1);
                    canonical.set_selection(Selection::Yes);
                    owned.push(canonical);
                } else {
                    canonical.set_owner(winner);
                    canonical.set_selection(Selection::No);
                    ghost_candidates.push(canonical);
                }

                // Final replica state: Yes survives only on the local
                // replica of a locally won location.
                for p in pts[s..t].iter_mut() {
                    let keep = winner == my_rank && p.owner() < 0;
                    p.set_selection(if keep { Selection::Yes } else { Selection::No });
                }
            }

            // Face emission. Hanging points anchor the face one level up;
            // crossing points constrain nothing beyond their parent edge
            // midpoint and are skipped.
            let face_lev = if non_hanging {
                Some(level)
            } else if !crossing && level >= 1 {
                Some(level - 1)
            } else {
                None
            };
            if let Some(face_lev) = face_lev {
                for k in s..t {
                    let p = pts[k];
                    if p.num_instances() == 0 {
                        continue;
                    }
                    if p.owner() >= 0 && p.owner() != my_rank {
                        sender_faces.add_closed_face(&p, face_lev, p.owner());
                    } else if p.owner() < 0 {
                        for q in neighbor_ranks(&p, fronts, my_rank) {
                            receiver_faces.add_closed_face(&p, face_lev, q);
                        }
                    }
                }
            }

            s = t;
        }
        i = j;
    }

    // Scatter map: owned nodes intersected with the faces announced by
    // remote replicas, rank-major, ascending node index within each rank.
    let mut per_rank: HashMap<i32, Vec<u32>> = HashMap::new();
    let mut ranks = BTreeSet::new();
    for (idx, node) in owned.iter().enumerate() {
        ranks.clear();
        sender_faces.ranks_on(node, &mut ranks);
        for &r in &ranks {
            if r != my_rank {
                per_rank.entry(r).or_default().push(idx as u32);
            }
        }
    }
    let mut send_procs: Vec<i32> = per_rank.keys().copied().collect();
    send_procs.sort_unstable();
    let mut scatter = ScatterMap::default();
    for &r in &send_procs {
        let ids = &per_rank[&r];
        scatter.send_offsets.push(scatter.send_ids.len() as i32);
        scatter.send_counts.push(ids.len() as i32);
        scatter.send_ids.extend_from_slice(ids);
        scatter.send_procs.push(r);
    }

    // Ghost layer: remotely won locations that lie on a face our own
    // boundary layer announced to the winning rank. Grouped by owner so
    // the receive order matches the sender's scatter order.
    ghost_candidates.sort_by(sfc_compare_points);
    ghost_candidates.dedup();
    let mut ghosts: Vec<TNPoint<D>> = Vec::new();
    for g in ghost_candidates {
        ranks.clear();
        receiver_faces.ranks_on(&g, &mut ranks);
        if ranks.contains(&g.owner()) {
            ghosts.push(g);
        }
    }
    ghosts.sort_by(|a, b| a.owner().cmp(&b.owner()).then_with(|| sfc_compare_points(a, b)));

    let mut gather = GatherMap::default();
    let mut idx = 0;
    while idx < ghosts.len() {
        let r = ghosts[idx].owner();
        let begin = idx;
        while idx < ghosts.len() && ghosts[idx].owner() == r {
            idx += 1;
        }
        gather.recv_procs.push(r);
        gather.recv_counts.push((idx - begin) as i32);
        gather.recv_offsets.push(begin as i32);
    }

    CgNodes {
        owned,
        ghosts,
        scatter,
        gather,
    }
}

/// Distributed CG node discovery.
///
/// Collapses local duplicates, exchanges the boundary layer with every
/// process whose partition intersects a point's neighborhood, classifies
/// the union, resolves a unique owner per node, and builds the scatter
/// and gather plans. `fronts` is the partition splitter array (the first
/// octant of every rank, see [`crate::tsort::tree_part_fronts`]).
///
/// Returns the global number of unique CG nodes together with the local
/// node sets and exchange plans; `points` is left holding the classified
/// replicas.
pub fn dist_count_cg_nodes<const D: usize, C: CommunicatorCollectives>(
    points: &mut Vec<TNPoint<D>>,
    order: u32,
    fronts: &[TreeNode<D>],
    comm: &C,
) -> (u64, CgNodes<D>) {
    let rank = comm.rank();
    let nproc = comm.size() as usize;
    assert_eq!(fronts.len(), nproc);

    loc_tree_sort_points(points);
    count_instances(points);
    compact_duplicates(points);

    if nproc > 1 {
        let lists = boundary_send_lists(points, fronts, rank);
        let mut counts = Vec::with_capacity(nproc);
        let mut flat = Vec::new();
        for list in &lists {
            counts.push(list.len() as i32);
            flat.extend_from_slice(list);
        }
        let received = redistribute(&flat, &counts, comm);
        points.extend(received);
    }

    let info = resolve_global(points, order, rank, fronts);

    let local = info.owned.len() as u64;
    let mut global = 0u64;
    comm.all_reduce_into(&local, &mut global, SystemOperation::sum());

    (global, info)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::Element;
    use crate::tnpoint::Selection;
    use crate::treenode::TreeNode;
    use crate::tsort::loc_tree_sort;

    fn emit_sorted<const D: usize>(elems: &[TreeNode<D>], order: u32) -> Vec<TNPoint<D>> {
        let mut points = Vec::new();
        for e in elems {
            Element::new(*e).append_nodes(order, &mut points);
        }
        loc_tree_sort_points(&mut points);
        points
    }

    fn uniform_grid<const D: usize>(depth: u32) -> Vec<TreeNode<D>> {
        let mut cells = vec![TreeNode::<D>::root()];
        for _ in 0..depth {
            cells = cells
                .iter()
                .flat_map(|c| (0..TreeNode::<D>::NUM_CHILDREN).map(|k| c.child_morton(k)))
                .collect();
        }
        loc_tree_sort(&mut cells);
        cells
    }

    #[test]
    fn test_count_instances() {
        let root = TreeNode::<2>::root();
        let mut points = emit_sorted(&[root.child_morton(0), root.child_morton(1)], 1);
        assert_eq!(points.len(), 8);
        let unique = count_instances(&mut points);
        // Two corners are shared between the siblings.
        assert_eq!(unique, 6);
        let live: Vec<_> = points.iter().filter(|p| p.num_instances() > 0).collect();
        assert_eq!(live.len(), 6);
        assert_eq!(
            live.iter().filter(|p| p.num_instances() == 2).count(),
            2
        );
    }

    #[test]
    fn test_single_root_element() {
        // Order 1 on the root octant: the corners of the domain.
        let mut points = emit_sorted(&[TreeNode::<2>::root()], 1);
        let count = count_cg_nodes(&mut points, 1, true);
        assert_eq!(count, 4);
        assert_eq!(
            points
                .iter()
                .filter(|p| p.selection() == Selection::Yes)
                .count(),
            4
        );
        assert!(points.iter().all(|p| p.is_on_domain_boundary()));
    }

    #[test]
    fn test_uniform_grid_3d_order_1() {
        let mut points = emit_sorted(&uniform_grid::<3>(1), 1);
        let count = count_cg_nodes(&mut points, 1, true);
        assert_eq!(count, 27);

        // The center is the only interior node.
        let interior: Vec<_> = points
            .iter()
            .filter(|p| p.selection() == Selection::Yes && !p.is_on_domain_boundary())
            .collect();
        assert_eq!(interior.len(), 1);
        let mid = level_len(1);
        assert_eq!(interior[0].coords(), [mid, mid, mid]);
    }

    #[test]
    fn test_two_siblings_order_3() {
        let root = TreeNode::<2>::root();
        let mut points = emit_sorted(&[root.child_morton(0), root.child_morton(1)], 3);
        let count = count_cg_nodes(&mut points, 3, true);
        // 16 + 16 - 4 shared edge nodes.
        assert_eq!(count, 28);
    }

    #[test]
    fn test_uniform_grid_2d_order_2_closed_form() {
        // L1: sum of Yes over a regular grid equals (k * 2^lev + 1)^D.
        let mut points = emit_sorted(&uniform_grid::<2>(2), 2);
        let count = count_cg_nodes(&mut points, 2, true);
        assert_eq!(count, (2 * 4 + 1) * (2 * 4 + 1));
    }

    #[test]
    fn test_uniform_grid_2d_order_3_closed_form() {
        let mut points = emit_sorted(&uniform_grid::<2>(1), 3);
        let count = count_cg_nodes(&mut points, 3, true);
        assert_eq!(count, (3 * 2 + 1) * (3 * 2 + 1));
    }

    #[test]
    fn test_two_to_one_face_order_2() {
        // Seven coarse leaves plus the refined children of child 0: a 2:1
        // face between the refined region and child 1. The coarse face
        // nodes win; every fine node on the shared face hangs, whether or
        // not it coincides with a coarse position.
        let root = TreeNode::<3>::root();
        let mut elems: Vec<_> = (1..8).map(|k| root.child_morton(k)).collect();
        elems.extend((0..8).map(|k| root.child_morton(0).child_morton(k)));
        let mut points = emit_sorted(&elems, 2);
        count_cg_nodes(&mut points, 2, true);

        let h = level_len(1);
        for p in &points {
            if p.coords()[0] != h || p.is_on_domain_boundary() {
                continue;
            }
            // The face between the refined region and child 1.
            if p.coords()[1] >= h || p.coords()[2] >= h {
                continue;
            }
            if p.level() == 1 {
                assert_eq!(p.selection(), Selection::Yes, "coarse face node {}", p);
            } else {
                assert_eq!(p.selection(), Selection::No, "fine face node {}", p);
            }
        }

        // The coarse face center coincides with fine cell corners; the
        // coarse replica is the one that survives.
        let coincident = [h, h / 2, h / 2];
        let run: Vec<_> = points
            .iter()
            .filter(|p| p.coords() == coincident)
            .collect();
        assert!(run.len() >= 2);
        assert_eq!(
            run.iter()
                .filter(|p| p.selection() == Selection::Yes)
                .count(),
            1
        );
        assert!(run
            .iter()
            .any(|p| p.level() == 1 && p.selection() == Selection::Yes));
        assert!(run
            .iter()
            .all(|p| p.level() != 2 || p.selection() == Selection::No));
    }

    #[test]
    fn test_refined_octant_order_3() {
        // Seven coarse children plus the eight children of child 0. The
        // high-order resolver must mark the coarse face nodes Yes and the
        // contained fine-face nodes No without any coordinate
        // coincidence.
        let root = TreeNode::<3>::root();
        let mut elems: Vec<_> = (1..8).map(|k| root.child_morton(k)).collect();
        let refined = root.child_morton(0);
        elems.extend((0..8).map(|k| refined.child_morton(k)));
        let mut points = emit_sorted(&elems, 3);
        count_cg_nodes(&mut points, 3, true);

        let h = level_len(1);
        for p in &points {
            if p.coords()[0] != h || p.is_on_domain_boundary() {
                continue;
            }
            // Nodes on the plane between the refined region and child 1.
            if p.coords()[1] >= h || p.coords()[2] >= h {
                continue;
            }
            if p.level() == 1 {
                assert_eq!(p.selection(), Selection::Yes, "coarse node {}", p);
            } else {
                assert_eq!(p.selection(), Selection::No, "fine node {}", p);
            }
        }
    }

    #[test]
    fn test_classification_idempotent() {
        let mut points = emit_sorted(&uniform_grid::<2>(2), 2);
        let first = count_cg_nodes(&mut points, 2, true);
        let state: Vec<_> = {
            let mut sorted = points.clone();
            sorted.sort_by(sfc_compare_points);
            sorted.iter().map(|p| (p.coords(), p.level(), p.selection())).collect()
        };

        let second = count_cg_nodes(&mut points, 2, true);
        let state2: Vec<_> = {
            let mut sorted = points.clone();
            sorted.sort_by(sfc_compare_points);
            sorted.iter().map(|p| (p.coords(), p.level(), p.selection())).collect()
        };

        assert_eq!(first, second);
        assert_eq!(state, state2);
    }

    #[test]
    fn test_boundary_closure() {
        let mut points = emit_sorted(&uniform_grid::<2>(2), 1);
        count_cg_nodes(&mut points, 1, true);
        // Every boundary location retains exactly one Yes replica.
        let mut locations: HashMap<[u32; 2], u32> = HashMap::new();
        for p in points.iter().filter(|p| p.is_on_domain_boundary()) {
            let slot = locations.entry(p.coords()).or_insert(0);
            if p.selection() == Selection::Yes {
                *slot += 1;
            }
        }
        assert!(!locations.is_empty());
        assert!(locations.values().all(|&n| n == 1));
    }

    /// Drive the distributed pipeline for two simulated ranks without a
    /// communicator: split a leaf partition, exchange boundary layers by
    /// hand, resolve on both sides.
    fn simulate_two_ranks<const D: usize>(
        elems: &[TreeNode<D>],
        split: usize,
        order: u32,
    ) -> (CgNodes<D>, CgNodes<D>) {
        let part0 = &elems[..split];
        let part1 = &elems[split..];
        let fronts = vec![part0[0], part1[0]];

        let prepare = |part: &[TreeNode<D>]| {
            let mut pts = emit_sorted(part, order);
            count_instances(&mut pts);
            compact_duplicates(&mut pts);
            pts
        };
        let mut p0 = prepare(part0);
        let mut p1 = prepare(part1);

        let to1 = boundary_send_lists(&p0, &fronts, 0);
        let to0 = boundary_send_lists(&p1, &fronts, 1);
        p0.extend_from_slice(&to0[0]);
        p1.extend_from_slice(&to1[1]);

        let info0 = resolve_global(&mut p0, order, 0, &fronts);
        let info1 = resolve_global(&mut p1, order, 1, &fronts);
        (info0, info1)
    }

    #[test]
    fn test_two_rank_ownership_and_reciprocity() {
        for order in [1u32, 2, 3] {
            let elems = uniform_grid::<2>(2);
            let (info0, info1) = simulate_two_ranks(&elems, 8, order);

            // R3: the owned sets partition the global node set.
            let expected = (order as usize * 4 + 1).pow(2);
            assert_eq!(
                info0.owned.len() + info1.owned.len(),
                expected,
                "order {}",
                order
            );

            // R4: no node has two owners.
            let set0: HashSet<_> = info0.owned.iter().map(|p| (p.coords(), p.level())).collect();
            for p in &info1.owned {
                assert!(!set0.contains(&(p.coords(), p.level())));
            }

            // R5: rank 0's send list to rank 1 equals rank 1's ghost list
            // from rank 0, element for element, and vice versa.
            let sends = |info: &CgNodes<2>, to: i32| -> Vec<([u32; 2], u32)> {
                match info.scatter.send_procs.iter().position(|&r| r == to) {
                    None => Vec::new(),
                    Some(k) => {
                        let begin = info.scatter.send_offsets[k] as usize;
                        let end = begin + info.scatter.send_counts[k] as usize;
                        info.scatter.send_ids[begin..end]
                            .iter()
                            .map(|&id| {
                                let n = &info.owned[id as usize];
                                (n.coords(), n.level())
                            })
                            .collect()
                    }
                }
            };
            let ghosts_from = |info: &CgNodes<2>, from: i32| -> Vec<([u32; 2], u32)> {
                info.ghosts
                    .iter()
                    .filter(|g| g.owner() == from)
                    .map(|g| (g.coords(), g.level()))
                    .collect()
            };

            assert_eq!(sends(&info0, 1), ghosts_from(&info1, 0), "order {}", order);
            assert_eq!(sends(&info1, 0), ghosts_from(&info0, 1), "order {}", order);
            assert!(!sends(&info0, 1).is_empty());
        }
    }

    #[test]
    fn test_two_rank_refined_interface() {
        // Rank 0 holds the refined children of child 0, rank 1 the rest.
        let root = TreeNode::<2>::root();
        let mut elems: Vec<_> = (0..4)
            .map(|k| root.child_morton(0).child_morton(k))
            .collect();
        elems.extend((1..4).map(|k| root.child_morton(k)));
        loc_tree_sort(&mut elems);

        let (info0, info1) = simulate_two_ranks(&elems, 4, 2);

        // Global count: the conforming 2:1 quadrant mesh at order 2.
        // Rank boundaries do not change the global node count.
        let mut all = emit_sorted(&elems, 2);
        let serial = count_cg_nodes(&mut all, 2, true);
        assert_eq!(info0.owned.len() + info1.owned.len(), serial);

        // The fine side references coarse face nodes it does not own.
        assert!(!info0.ghosts.is_empty() || !info1.ghosts.is_empty());
    }
}
