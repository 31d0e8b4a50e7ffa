//! Local and global node counts for a 4D regular octree at depth 1.

use hyperoctree::octutils::create_regular_octree;
use hyperoctree::Da;
use mpi::traits::Communicator;

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();

    const DIM: usize = 4;
    let level = 1u32;
    let order = 1u32;

    let tree_part = create_regular_octree::<DIM, _>(level, &comm);
    let da = Da::new(&tree_part, order, comm);

    println!(
        "[{}] Local size = {}, global size = {}",
        rank,
        da.local_nodal_sz(),
        da.global_node_sz()
    );

    // 3^4 vertices of the depth-1 grid.
    assert_eq!(da.global_node_sz(), 81);
}
