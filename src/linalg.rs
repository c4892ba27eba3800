/// Sparse 3x3 block mapping operator with binary export
pub mod block_matrix;
/// Direct solvers behind the `SparseSolver` service, keyed by matrix class
pub mod solver;
/// Sparsely Packed Matrices (symmetric and rectangular)
pub mod sparse_matrix;

pub use block_matrix::MappingMatrix;
pub use solver::{MatrixClass, SolverRegistry, SparseSolver};
pub use sparse_matrix::{CouplingMatrix, SparseMatrix};

use rayon::prelude::*;
use std::sync::mpsc::channel;

/// Linear system split into free and constrained unknowns
///
/// Dff x_f = -Dfc x_c
#[derive(Clone, Debug)]
pub struct SplitSystem {
    /// Free/free block (symmetric)
    pub dff: SparseMatrix,
    /// Free/constrained coupling
    pub dfc: CouplingMatrix,
}

/// Entries contributed by one element, already split by unknown class
#[derive(Clone, Debug, Default)]
pub struct ElementContribution {
    pub ff: Vec<([usize; 2], f64)>,
    pub fc: Vec<([usize; 2], f64)>,
}

impl SplitSystem {
    pub fn new(num_free: usize, num_constrained: usize) -> Self {
        Self {
            dff: SparseMatrix::new(num_free),
            dfc: CouplingMatrix::new(num_free, num_constrained),
        }
    }

    pub fn num_free(&self) -> usize {
        self.dff.dimension
    }

    pub fn num_constrained(&self) -> usize {
        self.dfc.cols
    }
}

impl ParallelExtend<ElementContribution> for SplitSystem {
    fn par_extend<I>(&mut self, elem_contributions: I)
    where
        I: IntoParallelIterator<Item = ElementContribution>,
    {
        let (sender, receiver) = channel();

        elem_contributions
            .into_par_iter()
            .for_each_with(sender, |s, contribution| {
                s.send(contribution).expect(
                    "Failed to send element contributions over MSPC channel; cannot construct Matrices!",
                )
            });

        receiver.iter().for_each(|contribution| {
            // Dff is stored symmetric; only the upper triangle needs inserting
            self.dff.insert_group(
                contribution
                    .ff
                    .into_iter()
                    .filter(|([r, c], _)| r <= c)
                    .collect(),
            );
            for (rc, v) in contribution.fc {
                self.dfc.insert(rc, v);
            }
        });
    }
}
