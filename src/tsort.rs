//! Local and distributed SFC sorting of octants and nodal points.
//!
//! The local sort is a most-significant-digit-first bucket sort: at every
//! level the slice is permuted in place into the Morton children of the
//! current cell, visited in the order the Hilbert tables prescribe, and the
//! recursion descends into each child bucket. Octants coarser than the
//! current level collect in a special ancestor bucket at the head of the
//! first SFC child, which is what makes ancestors precede descendants in
//! the final order.
//!
//! The distributed sort refines the top of the tree breadth-first until the
//! global bucket counts bracket every ideal splitter position within the
//! requested load tolerance, then exchanges the octants with an
//! all-to-allv and finishes with a local sort.

use std::collections::VecDeque;

use itertools::Itertools;
use mpi::collective::SystemOperation;
use mpi::traits::CommunicatorCollectives;

use crate::constants::{num_children, MAX_CHILDREN, MAX_DEPTH};
use crate::hilbert::{hcurve_tables, HilbertTables};
use crate::tnpoint::TNPoint;
use crate::tools::{gather_to_all, redistribute};
use crate::treenode::TreeNode;

/// Bucket boundaries produced by one bucketing pass, relative to the
/// bucketed slice. `splitters[w]` is the begin of the SFC child bucket
/// `w`; `splitters[nc]` is the slice length. Ancestors of the children sit
/// in `[0, ancestor_end)`, prefixed to the first SFC child bucket
/// (`splitters[0] == 0`).
#[derive(Copy, Clone, Debug)]
pub struct BucketSplitters {
    /// End of the ancestor run at the head of the slice.
    pub ancestor_end: usize,
    /// SFC child bucket boundaries; only the first `2^D + 1` are used.
    pub splitters: [usize; MAX_CHILDREN + 1],
}

/// A bucket of the breadth-first splitter refinement: a subtree at `lev`
/// with rotation `rot` holding the slice `[begin, end)`.
#[derive(Copy, Clone, Debug)]
struct BucketInfo {
    rot: u32,
    lev: u32,
    begin: usize,
    end: usize,
}

/// Permute `items` into buckets keyed by `key` (`None` marks an ancestor),
/// following the SFC child order of rotation `p_rot`.
///
/// Counting pass, then an in-place cycle-leader rotation: the first item of
/// every bucket is evicted into a constant-size buffer, freeing its slot as
/// a valid destination; each placement frees the next slot of the
/// destination bucket until all cycles close.
pub(crate) fn bucket_by<P: Copy>(
    items: &mut [P],
    tables: &HilbertTables,
    p_rot: u32,
    mut key: impl FnMut(&P) -> Option<usize>,
) -> BucketSplitters {
    let nc = tables.num_children();

    let mut counts = [0usize; MAX_CHILDREN];
    let mut count_ancestors = 0usize;
    for it in items.iter() {
        match key(it) {
            None => count_ancestors += 1,
            Some(c) => counts[c] += 1,
        }
    }

    // Bucket offsets in permuted SFC order. `offsets` and `bucket_ends`
    // are indexed by Morton child for direct lookup during the movement
    // phase; slot `nc` holds the ancestors.
    let mut offsets = [0usize; MAX_CHILDREN + 1];
    let mut bucket_ends = [0usize; MAX_CHILDREN + 1];
    offsets[nc] = 0;
    bucket_ends[nc] = count_ancestors;

    let mut splitters = [0usize; MAX_CHILDREN + 1];
    let mut accum = count_ancestors;
    for w in 0..nc {
        let child = tables.sfc_to_morton(p_rot, w);
        splitters[w] = accum;
        offsets[child] = accum;
        accum += counts[child];
        bucket_ends[child] = accum;
    }
    splitters[nc] = accum;
    splitters[0] = 0;
    debug_assert_eq!(accum, items.len());

    let mut buffer: [Option<P>; MAX_CHILDREN + 1] = [None; MAX_CHILDREN + 1];
    let mut buffer_size = 0usize;
    for b in 0..=nc {
        if offsets[b] < bucket_ends[b] {
            buffer[buffer_size] = Some(items[offsets[b]]);
            buffer_size += 1;
        }
    }

    // Invariant: any offsets[] pointee has been copied into the buffer.
    while buffer_size > 0 {
        let top = buffer[buffer_size - 1].unwrap();
        let dest = match key(&top) {
            None => nc,
            Some(c) => c,
        };
        items[offsets[dest]] = top;
        offsets[dest] += 1;
        if offsets[dest] < bucket_ends[dest] {
            buffer[buffer_size - 1] = Some(items[offsets[dest]]);
        } else {
            buffer_size -= 1;
        }
    }

    BucketSplitters {
        ancestor_end: count_ancestors,
        splitters,
    }
}

/// Reorder the octants of a slice into the children of the level-`lev`
/// cell containing them, in SFC order, and yield the bucket boundaries.
/// Octants at level `lev` or coarser count as ancestors.
pub fn sfc_bucketing<const D: usize>(
    points: &mut [TreeNode<D>],
    lev: u32,
    p_rot: u32,
) -> BucketSplitters {
    let tables = hcurve_tables(D);
    bucket_by(points, tables, p_rot, |tn| {
        if tn.level() <= lev {
            None
        } else {
            Some(tn.morton_index(lev + 1))
        }
    })
}

/// Reorder nodal points into the children of the level-`lev` cell by the
/// coordinate digit alone; the level field does not influence the bucket.
pub(crate) fn sfc_bucketing_points<const D: usize>(
    points: &mut [TNPoint<D>],
    lev: u32,
    p_rot: u32,
) -> BucketSplitters {
    let tables = hcurve_tables(D);
    bucket_by(points, tables, p_rot, |p| Some(p.morton_digit(lev + 1)))
}

fn loc_tree_sort_range<const D: usize>(
    points: &mut [TreeNode<D>],
    s_lev: u32,
    e_lev: u32,
    p_rot: u32,
) {
    if points.is_empty() {
        return;
    }
    let tables = hcurve_tables(D);
    let nc = tables.num_children();

    let buckets = sfc_bucketing(points, s_lev, p_rot);

    if s_lev < e_lev {
        for w in 0..nc {
            let child = tables.sfc_to_morton(p_rot, w);
            let c_rot = tables.child_rotation(p_rot, child);
            // The ancestors at the head of the first bucket are final.
            let begin = if w == 0 {
                buckets.ancestor_end
            } else {
                buckets.splitters[w]
            };
            let end = buckets.splitters[w + 1];
            if end - begin > 1 {
                loc_tree_sort_range(&mut points[begin..end], s_lev + 1, e_lev, c_rot);
            }
        }
    }
}

/// In-place local SFC sort of octants. Within any subtree, ancestors come
/// before descendants.
pub fn loc_tree_sort<const D: usize>(points: &mut [TreeNode<D>]) {
    loc_tree_sort_range(points, 0, MAX_DEPTH, 0);
}

fn loc_tree_sort_points_range<const D: usize>(points: &mut [TNPoint<D>], s_lev: u32, p_rot: u32) {
    if points.len() <= 1 {
        return;
    }

    // Once the clamped digits tie completely, the remaining order is
    // lexicographic coordinates and then the level of the generating
    // element, coarser first. The level partition is what keeps
    // coincident nodes of 2:1 neighbors in ancestor-before-descendant
    // order.
    let first = points[0].coords();
    if points.iter().all(|p| p.coords() == first) || s_lev == MAX_DEPTH {
        points.sort_by(|a, b| {
            a.coords()
                .cmp(&b.coords())
                .then_with(|| a.level().cmp(&b.level()))
        });
        return;
    }

    let tables = hcurve_tables(D);
    let nc = tables.num_children();
    let buckets = sfc_bucketing_points(points, s_lev, p_rot);

    for w in 0..nc {
        let child = tables.sfc_to_morton(p_rot, w);
        let c_rot = tables.child_rotation(p_rot, child);
        let begin = buckets.splitters[w];
        let end = buckets.splitters[w + 1];
        if end - begin > 1 {
            loc_tree_sort_points_range(&mut points[begin..end], s_lev + 1, c_rot);
        }
    }
}

/// In-place local SFC sort of nodal points, keyed on `(coords, level)`.
pub fn loc_tree_sort_points<const D: usize>(points: &mut [TNPoint<D>]) {
    loc_tree_sort_points_range(points, 0, 0);
}

/// Replace every bucket at the front level of the queue by its SFC-ordered
/// children one level deeper, bucketing the corresponding slices in place.
fn tree_bft_next_level<const D: usize>(
    points: &mut [TreeNode<D>],
    queue: &mut VecDeque<BucketInfo>,
) {
    if queue.is_empty() {
        return;
    }
    let tables = hcurve_tables(D);
    let nc = tables.num_children();
    let start_lev = queue.front().unwrap().lev;

    while queue.front().map_or(false, |b| b.lev == start_lev) {
        let front = queue.pop_front().unwrap();

        let buckets = if front.begin < front.end {
            sfc_bucketing(&mut points[front.begin..front.end], front.lev, front.rot)
        } else {
            BucketSplitters {
                ancestor_end: 0,
                splitters: [0; MAX_CHILDREN + 1],
            }
        };

        for w in 0..nc {
            let child = tables.sfc_to_morton(front.rot, w);
            let c_rot = tables.child_rotation(front.rot, child);
            queue.push_back(BucketInfo {
                rot: c_rot,
                lev: front.lev + 1,
                begin: front.begin + buckets.splitters[w],
                end: front.begin + buckets.splitters[w + 1],
            });
        }
    }
}

/// Globally sort and partition octants so that every process ends up with
/// a contiguous SFC range of roughly `N / nProc` octants, within a
/// relative tolerance of `load_flexibility`.
///
/// Splitter positions are refined bucket by bucket: a pending splitter is
/// accepted once the end of its bracketing bucket is within tolerance of
/// the ideal position, otherwise the bucket is queued for refinement one
/// level deeper. If the refinement reaches `MAX_DEPTH` the current bucket
/// ends are accepted regardless of the tolerance.
pub fn dist_tree_sort<const D: usize, C: CommunicatorCollectives>(
    points: &mut Vec<TreeNode<D>>,
    load_flexibility: f64,
    comm: &C,
) {
    assert!(load_flexibility > 0.0 && load_flexibility <= 1.0);

    let nproc = comm.size() as usize;

    if nproc == 1 {
        loc_tree_sort(points);
        return;
    }

    let nc = num_children(D);

    // Phase 1: descend until there are enough buckets to test the load
    // balancing criterion against. The level guard keeps us from running
    // away when there are fewer points than processes.
    let mut queue = VecDeque::new();
    queue.push_back(BucketInfo {
        rot: 0,
        lev: 0,
        begin: 0,
        end: points.len(),
    });
    while queue.len() < nproc && queue.front().unwrap().lev < MAX_DEPTH {
        tree_bft_next_level(points, &mut queue);
    }

    // Phase 2: count bucket sizes globally, accept splitters that are
    // close enough, refine the buckets of the pending ones, repeat.
    let size_local = points.len() as u64;
    let mut size_global = 0u64;
    comm.all_reduce_into(&size_local, &mut size_global, SystemOperation::sum());

    let mut splitters = vec![points.len(); nproc];
    let mut pending: VecDeque<usize> = (0..nproc).collect();

    // Buckets are walked in blocks of contiguous siblings; each block
    // remembers the global rank of its first element across rounds.
    let mut blk_begin_g: VecDeque<u64> = VecDeque::from([0u64]);
    let mut blk_num_bkt = queue.len();

    while !pending.is_empty() {
        let counts_local: Vec<u64> = queue.iter().map(|b| (b.end - b.begin) as u64).collect();
        let mut counts_global = vec![0u64; counts_local.len()];
        comm.all_reduce_into(
            &counts_local[..],
            &mut counts_global[..],
            SystemOperation::sum(),
        );

        let mut selected = VecDeque::new();
        let mut selected_begin_g = VecDeque::new();
        let mut counts_iter = counts_global.into_iter();

        // Splitters re-enqueued during this round must not be tested again
        // before their buckets have been refined.
        let mut round_pending = std::mem::take(&mut pending);

        while let Some(mut bkt_begin_g) = blk_begin_g.pop_front() {
            for _ in 0..blk_num_bkt {
                let bkt_count_g = counts_iter.next().unwrap();
                let bkt_end_g = bkt_begin_g + bkt_count_g;
                let bucket = queue.pop_front().unwrap();
                let can_refine = bucket.lev < MAX_DEPTH;
                let mut select_bucket = false;

                // Test the splitter indices that fall into this bucket.
                while let Some(&r) = round_pending.front() {
                    let ideal_g = ((r as u64 + 1) * size_global) / nproc as u64;
                    if ideal_g > bkt_end_g {
                        break;
                    }
                    round_pending.pop_front();
                    let chunk = ideal_g - (r as u64 * size_global) / nproc as u64;
                    let abs_tolerance = (chunk as f64 * load_flexibility) as u64;
                    if can_refine && bkt_end_g - ideal_g > abs_tolerance {
                        // Too far off. Mark the bucket for refinement and
                        // send the splitter back to the queue.
                        select_bucket = true;
                        pending.push_back(r);
                    }
                    splitters[r] = bucket.end;
                }

                if select_bucket {
                    selected.push_back(bucket);
                    selected_begin_g.push_back(bkt_begin_g);
                }

                bkt_begin_g = bkt_end_g;
            }
        }
        debug_assert!(round_pending.is_empty());

        queue = selected;
        blk_begin_g = selected_begin_g;

        if pending.is_empty() {
            break;
        }

        tree_bft_next_level(points, &mut queue);
        blk_num_bkt = nc;
    }

    // Phase 3: all-to-all exchange of the octants, then a local sort to
    // restore strict SFC order within the received slice.
    let send_counts = std::iter::once(0)
        .chain(splitters.iter().copied())
        .tuple_windows()
        .map(|(prev, s)| {
            debug_assert!(s >= prev);
            (s - prev) as i32
        })
        .collect_vec();
    debug_assert_eq!(*splitters.last().unwrap(), points.len());

    *points = redistribute(points, &send_counts, comm);

    loc_tree_sort(points);
}

/// The first octant of every rank's partition. This is the splitter array
/// that locates a key's owning process.
pub fn tree_part_fronts<const D: usize, C: CommunicatorCollectives>(
    tree_part: &[TreeNode<D>],
    comm: &C,
) -> Vec<TreeNode<D>> {
    assert!(!tree_part.is_empty());
    gather_to_all(std::slice::from_ref(tree_part.first().unwrap()), comm)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::treenode::{sfc_compare_nodes, TreeNode};
    use crate::tnpoint::sfc_compare_points;
    use crate::element::Element;
    use crate::constants::level_len;
    use rand::prelude::*;
    use std::cmp::Ordering;

    fn random_octants<const D: usize>(n: usize, max_level: u32, rng: &mut StdRng) -> Vec<TreeNode<D>> {
        (0..n)
            .map(|_| {
                let level = rng.gen_range(1..=max_level);
                let len = level_len(level);
                let mut coords = [0u32; D];
                for x in coords.iter_mut() {
                    *x = rng.gen_range(0..(1u32 << level)) * len;
                }
                TreeNode::new(coords, level)
            })
            .collect()
    }

    #[test]
    fn test_loc_tree_sort_matches_comparator() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut octants = random_octants::<3>(500, 6, &mut rng);
        let mut expected = octants.clone();

        loc_tree_sort(&mut octants);
        expected.sort_by(sfc_compare_nodes);

        assert_eq!(octants.len(), expected.len());
        for (a, b) in octants.iter().zip(expected.iter()) {
            assert_eq!(sfc_compare_nodes(a, b), Ordering::Equal);
        }
    }

    #[test]
    fn test_ancestors_precede_descendants() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut octants = random_octants::<2>(200, 5, &mut rng);
        // Sprinkle in ancestors of some of the octants.
        let extra: Vec<_> = octants
            .iter()
            .step_by(7)
            .map(|o| o.ancestor(o.level() / 2))
            .collect();
        octants.extend(extra);

        loc_tree_sort(&mut octants);

        for (i, a) in octants.iter().enumerate() {
            for b in &octants[i + 1..] {
                assert!(
                    !b.is_ancestor(a) || b == a,
                    "ancestor {} follows descendant {}",
                    b,
                    a
                );
            }
        }
    }

    #[test]
    fn test_bucketing_splitters() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut octants = random_octants::<2>(300, 6, &mut rng);
        let tables = hcurve_tables(2);

        let buckets = sfc_bucketing(&mut octants, 0, 0);

        assert_eq!(buckets.splitters[0], 0);
        assert_eq!(buckets.splitters[4], octants.len());
        for w in 0..4 {
            let child = tables.sfc_to_morton(0, w);
            let begin = if w == 0 {
                buckets.ancestor_end
            } else {
                buckets.splitters[w]
            };
            for tn in &octants[begin..buckets.splitters[w + 1]] {
                assert_eq!(tn.morton_index(1), child);
            }
        }
    }

    #[test]
    fn test_point_sort_matches_comparator() {
        // Points emitted by a handful of elements at mixed levels,
        // including coincident ones on shared faces.
        let root = TreeNode::<2>::root();
        let mut points = Vec::new();
        for child in 0..4 {
            if child == 2 {
                for grandchild in 0..4 {
                    let elem = Element::new(root.child_morton(child).child_morton(grandchild));
                    elem.append_nodes(3, &mut points);
                }
            } else {
                Element::new(root.child_morton(child)).append_nodes(3, &mut points);
            }
        }
        let mut rng = StdRng::seed_from_u64(3);
        points.shuffle(&mut rng);

        let mut expected = points.clone();
        expected.sort_by(sfc_compare_points);
        loc_tree_sort_points(&mut points);

        for (a, b) in points.iter().zip(expected.iter()) {
            assert_eq!(
                sfc_compare_points(a, b),
                Ordering::Equal,
                "mismatch: {} vs {}",
                a,
                b
            );
        }
    }

    #[test]
    fn test_point_sort_groups_coincident_locations() {
        let root = TreeNode::<2>::root();
        let mut points = Vec::new();
        Element::new(root.child_morton(0)).append_nodes(2, &mut points);
        Element::new(root.child_morton(1)).append_nodes(2, &mut points);
        loc_tree_sort_points(&mut points);

        // Every run of equal coordinates is contiguous.
        for i in 0..points.len() {
            for j in i + 2..points.len() {
                if points[i].coords() == points[j].coords() {
                    assert_eq!(points[i].coords(), points[i + 1].coords());
                }
            }
        }
    }
}
