//! Octree construction helpers for tests and demo drivers.

use mpi::traits::Communicator;
use rand::Rng;

use crate::treenode::TreeNode;
use crate::tsort::loc_tree_sort;

/// The leaves of the uniform level-`level` grid in SFC order,
/// block-partitioned across the ranks of `comm`. Returns this rank's
/// contiguous block.
pub fn create_regular_octree<const D: usize, C: Communicator>(
    level: u32,
    comm: &C,
) -> Vec<TreeNode<D>> {
    let mut leaves = vec![TreeNode::<D>::root()];
    for _ in 0..level {
        leaves = leaves
            .iter()
            .flat_map(|&c| (0..TreeNode::<D>::NUM_CHILDREN).map(move |k| c.child_morton(k)))
            .collect();
    }
    loc_tree_sort(&mut leaves);

    let nproc = comm.size() as usize;
    let rank = comm.rank() as usize;
    let n = leaves.len();
    let begin = (rank * n) / nproc;
    let end = ((rank + 1) * n) / nproc;
    leaves[begin..end].to_vec()
}

/// Generate at least `n` leaves by repeatedly refining a random leaf, up
/// to `max_level`. The result is a complete partition of the domain in
/// SFC order.
pub fn generate_random_leaves<const D: usize, R: Rng + ?Sized>(
    n: usize,
    max_level: u32,
    rng: &mut R,
) -> Vec<TreeNode<D>> {
    let mut leaves = vec![TreeNode::<D>::root()];
    while leaves.len() < n {
        let i = rng.gen_range(0..leaves.len());
        if leaves[i].level() >= max_level {
            if leaves.iter().all(|l| l.level() >= max_level) {
                break;
            }
            continue;
        }
        let cell = leaves.swap_remove(i);
        for k in 0..TreeNode::<D>::NUM_CHILDREN {
            leaves.push(cell.child_morton(k));
        }
    }
    loc_tree_sort(&mut leaves);
    leaves
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn test_random_leaves_partition_the_domain() {
        let mut rng = StdRng::seed_from_u64(7);
        let leaves = generate_random_leaves::<2, _>(40, 6, &mut rng);
        assert!(leaves.len() >= 40);

        // The leaf volumes sum to the domain volume.
        let total: u128 = leaves
            .iter()
            .map(|l| (l.len() as u128).pow(2))
            .sum();
        assert_eq!(total, (crate::constants::DOMAIN_SPAN as u128).pow(2));

        // No leaf is an ancestor of another.
        for (i, a) in leaves.iter().enumerate() {
            for b in &leaves[i + 1..] {
                assert!(!a.is_ancestor(b) && !b.is_ancestor(a));
            }
        }
    }
}
