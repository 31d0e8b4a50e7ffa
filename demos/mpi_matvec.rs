//! Apply a Poisson stiffness operator matrix-free through the DA.
//!
//! The elemental kernel takes derivatives along every axis with the 1D
//! differentiation table, scales by the quadrature weights and the
//! Jacobian quotient, and accumulates the transposed sweeps over the
//! axes. Applying it to the constant field must give zero everywhere: the
//! stiffness matrix annihilates constants.

use hyperoctree::octutils::create_regular_octree;
use hyperoctree::refel::{kronecker_apply, RefElement};
use hyperoctree::{Da, ElementalOps};
use mpi::traits::Communicator;

const DIM: usize = 3;

struct PoissonMat<'a> {
    ref_el: &'a RefElement<DIM>,
    qx: Vec<Vec<f64>>,
    tmp: Vec<f64>,
}

impl<'a> PoissonMat<'a> {
    fn new(ref_el: &'a RefElement<DIM>) -> Self {
        let npe = ref_el.nodes_per_element();
        Self {
            ref_el,
            qx: (0..DIM).map(|_| vec![0.0; npe]).collect(),
            tmp: vec![0.0; npe],
        }
    }
}

impl<'a> ElementalOps<DIM> for PoissonMat<'a> {
    fn elemental_mat_vec(&mut self, input: &[f64], output: &mut [f64], coords: &[f64], scale: f64) {
        let re = self.ref_el;
        let n = re.nrp();
        let npe = re.nodes_per_element();
        let w = re.wgq();

        // Physical element size from the first and last node coordinates.
        let sz = coords[(npe - 1) * DIM] - coords[0];
        let jac = sz / re.element_sz();

        // Take the derivative along each axis in turn.
        for d in 0..DIM {
            let mats: Vec<&[f64]> = (0..DIM)
                .map(|dd| if dd == d { re.dg1d() } else { re.q1d() })
                .collect();
            kronecker_apply::<DIM>(n, &mats, input, &mut self.qx[d]);

            // Quadrature weights and the Jacobian quotient
            // prod_{dd != d} J_dd / J_d for an isotropic element.
            let j_quotient = jac.powi(DIM as i32 - 2);
            let mut k = 0;
            let mut g = [0usize; DIM];
            loop {
                let mut weight = j_quotient * scale;
                for gd in &g {
                    weight *= w[*gd];
                }
                self.qx[d][k] *= weight;
                k += 1;

                let mut dd = 0;
                loop {
                    if dd == DIM {
                        break;
                    }
                    g[dd] += 1;
                    if g[dd] < n {
                        break;
                    }
                    g[dd] = 0;
                    dd += 1;
                }
                if dd == DIM {
                    break;
                }
            }
        }

        // Transposed sweeps, accumulated over the axes.
        output.fill(0.0);
        for d in 0..DIM {
            let mats: Vec<&[f64]> = (0..DIM)
                .map(|dd| if dd == d { re.dgt1d() } else { re.qt1d() })
                .collect();
            kronecker_apply::<DIM>(n, &mats, &self.qx[d], &mut self.tmp);
            for (o, t) in output.iter_mut().zip(&self.tmp) {
                *o += *t;
            }
        }
    }
}

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();

    let level = 2u32;
    let order = 2u32;

    let tree_part = create_regular_octree::<DIM, _>(level, &comm);
    let da = Da::new(&tree_part, order, comm);

    let input = vec![1.0; da.local_nodal_sz()];
    let mut output = vec![0.0; da.local_nodal_sz()];

    let ref_el = RefElement::<DIM>::new(order);
    let mut op = PoissonMat::new(&ref_el);
    let ok = da.mat_vec(&mut op, &input, &mut output, 1.0);
    assert!(ok);

    // The stiffness operator annihilates the constant field.
    let max_abs = output.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    assert!(max_abs < 1e-10, "rank {}: |A 1|_inf = {}", rank, max_abs);

    if rank == 0 {
        println!("Poisson matvec on {} global nodes: |A 1|_inf = {:.3e}.", da.global_node_sz(), max_abs);
    }
}
