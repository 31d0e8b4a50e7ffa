//! An N-dimensional adaptive hyperoctree library with continuous-Galerkin
//! node discovery along the Hilbert space-filling curve.
//!
//! The library takes a distributed set of hyperoctants (the leaves of an
//! adaptive 2:1-balanced tree in 2, 3, or 4 dimensions) and produces a
//! globally consistent finite-element node layout: every nodal location
//! emitted by the element grids is deduplicated, classified as hanging or
//! non-hanging, assigned a single owning process, and wired into a
//! scatter map for ghost exchange during matrix-free operator
//! application.
//!
//! The pieces, bottom up:
//!
//! - [`hilbert`] holds the rotation tables that steer every recursive
//!   descent along the space-filling curve.
//! - [`treenode`] and [`tnpoint`] are the octant key and the nodal point
//!   carried through the pipeline.
//! - [`tsort`] sorts octants and points along the curve, locally
//!   ([`tsort::loc_tree_sort`]) and across processes
//!   ([`tsort::dist_tree_sort`]).
//! - [`nsort`] is the node-sort engine: local classification
//!   ([`nsort::count_cg_nodes`]) and the distributed pipeline
//!   ([`nsort::dist_count_cg_nodes`]) including ownership resolution and
//!   the scatter map.
//! - [`sfc_loop`] is a stateful pre/post-order traversal used for
//!   element iteration.
//! - [`da`] bundles everything into the mesh object the operator layer
//!   consumes.
//!
//! Distributed operation uses MPI throughout. A minimal session:
//!
//! ```no_run
//! use hyperoctree::{octutils::create_regular_octree, Da};
//! use mpi::traits::Communicator;
//!
//! let universe = mpi::initialize().unwrap();
//! let comm = universe.world();
//!
//! let tree_part = create_regular_octree::<3, _>(2, &comm);
//! let da = Da::new(&tree_part, 2, comm);
//!
//! println!(
//!     "local nodes: {}, global nodes: {}",
//!     da.local_nodal_sz(),
//!     da.global_node_sz()
//! );
//! ```
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod bits;
pub mod constants;
pub mod da;
pub mod element;
pub mod hilbert;
pub mod nsort;
pub mod octutils;
pub mod refel;
pub mod sfc_loop;
pub mod tnpoint;
pub mod tools;
pub mod treenode;
pub mod tsort;

pub use crate::da::{Da, ElementalOps};
pub use crate::hilbert::init_hcurve;
pub use crate::tnpoint::TNPoint;
pub use crate::treenode::TreeNode;
