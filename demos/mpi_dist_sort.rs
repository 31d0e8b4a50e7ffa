//! Test the distributed SFC sort: random leaf sets per rank end up
//! globally sorted and well balanced.

use hyperoctree::hilbert::init_hcurve;
use hyperoctree::octutils::generate_random_leaves;
use hyperoctree::tools::{gather_to_root, global_size};
use hyperoctree::treenode::sfc_compare_nodes;
use hyperoctree::tsort::dist_tree_sort;
use itertools::Itertools;
use mpi::traits::Communicator;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();

    const DIM: usize = 3;
    init_hcurve(DIM);

    // Every rank contributes its own random refinement.
    let mut rng = ChaCha8Rng::seed_from_u64(comm.rank() as u64);
    let mut leaves = generate_random_leaves::<DIM, _>(2000, 10, &mut rng);

    let global_before = global_size(&leaves, &comm);

    dist_tree_sort(&mut leaves, 0.1, &comm);

    let global_after = global_size(&leaves, &comm);
    assert_eq!(global_before, global_after);

    // Within the tolerance corner cases aside, the load should be close
    // to even.
    let ideal = global_after as f64 / comm.size() as f64;
    assert!(
        (leaves.len() as f64) < 2.0 * ideal + 1.0,
        "rank {} holds {} of {}",
        comm.rank(),
        leaves.len(),
        global_after
    );

    // Gather everything to root and verify the global SFC order.
    if let Some(all) = gather_to_root(&leaves, &comm) {
        assert_eq!(all.len(), global_after);
        for (a, b) in all.iter().tuple_windows() {
            assert_ne!(
                sfc_compare_nodes(a, b),
                std::cmp::Ordering::Greater,
                "out of order: {} before {}",
                a,
                b
            );
        }
        println!(
            "Globally sorted {} leaves over {} ranks.",
            all.len(),
            comm.size()
        );
    }
}
