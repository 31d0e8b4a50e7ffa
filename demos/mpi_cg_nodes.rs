//! Test distributed CG node discovery on a regular grid: the closed-form
//! node count and the consistency of the ghost exchange.

use hyperoctree::octutils::create_regular_octree;
use hyperoctree::Da;
use mpi::traits::Communicator;

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();

    const DIM: usize = 3;
    let level = 2u32;
    let order = 2u32;

    let tree_part = create_regular_octree::<DIM, _>(level, &comm);
    let da = Da::new(&tree_part, order, comm);

    // The closed form for a regular grid.
    let expected = ((order as u64 * (1 << level)) + 1).pow(DIM as u32);
    assert_eq!(da.global_node_sz(), expected);

    // Fill the owned segment with a function of the node coordinates and
    // read the ghosts. Afterwards every slot of the ghosted vector must
    // match its own key, which exercises the scatter map, the gather map,
    // and their reciprocity at once.
    let key_value = |coords: [u32; DIM]| -> f64 {
        coords
            .iter()
            .fold(0.0f64, |acc, &x| acc * 1e-5 + x as f64 * 1e-9)
    };

    let mut vec = da.create_vector(true);
    let begin = da.local_node_begin();
    for (i, p) in da.owned_nodes().iter().enumerate() {
        vec[begin + i] = key_value(p.coords());
    }
    da.read_from_ghosts(&mut vec);

    let ghosts = da.ghost_nodes();
    for (g, p) in ghosts[..begin].iter().enumerate() {
        assert!(
            (vec[g] - key_value(p.coords())).abs() < 1e-14,
            "rank {} pre-ghost {}",
            rank,
            g
        );
    }
    let owned_end = begin + da.local_nodal_sz();
    for (g, p) in ghosts[begin..].iter().enumerate() {
        assert!(
            (vec[owned_end + g] - key_value(p.coords())).abs() < 1e-14,
            "rank {} post-ghost {}",
            rank,
            g
        );
    }

    if rank == 0 {
        println!(
            "Global CG nodes: {} (expected {}).",
            da.global_node_sz(),
            expected
        );
    }
}
