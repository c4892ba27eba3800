use super::sparse_matrix::SparseMatrix;
use crate::error::{MapError, MapResult};

use nalgebra::DMatrix;
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::CscMatrix;
use std::collections::BTreeMap;
use std::fmt;

/// Dense fallbacks refuse systems larger than this
const MAX_DENSE_SIZE: usize = 2000;

/// Structural class of a linear system; selects the registered solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatrixClass {
    SymmetricPositiveDefinite,
    SymmetricIndefinite,
    General,
}

/// Direct solver for `A X = B` with a sparse symmetric `A` and dense right-hand sides
pub trait SparseSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Solve for every column of `rhs` at once
    fn solve(&self, a: &SparseMatrix, rhs: &DMatrix<f64>) -> MapResult<DMatrix<f64>>;
}

/// Sparse Cholesky factorization (nalgebra-sparse)
#[derive(Debug, Default, Clone, Copy)]
pub struct CholeskySolver;

impl SparseSolver for CholeskySolver {
    fn name(&self) -> &'static str {
        "sparse cholesky"
    }

    fn solve(&self, a: &SparseMatrix, rhs: &DMatrix<f64>) -> MapResult<DMatrix<f64>> {
        check_rhs(a, rhs)?;
        let csc = CscMatrix::from(a);
        let factor = CscCholesky::factor(&csc)
            .map_err(|e| MapError::SolverFailed(format!("cholesky factorization: {:?}", e)))?;
        Ok(factor.solve(rhs))
    }
}

/// Dense LU decomposition; only for small systems
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseLuSolver;

impl SparseSolver for DenseLuSolver {
    fn name(&self) -> &'static str {
        "dense lu"
    }

    fn solve(&self, a: &SparseMatrix, rhs: &DMatrix<f64>) -> MapResult<DMatrix<f64>> {
        check_rhs(a, rhs)?;
        if a.dimension > MAX_DENSE_SIZE {
            return Err(MapError::SolverFailed(format!(
                "Matrices Exceeded Maximum Size ({}x{}); Cannot Solve!",
                MAX_DENSE_SIZE, MAX_DENSE_SIZE
            )));
        }
        DMatrix::from(a)
            .lu()
            .solve(rhs)
            .ok_or_else(|| MapError::SolverFailed("matrix is singular".into()))
    }
}

fn check_rhs(a: &SparseMatrix, rhs: &DMatrix<f64>) -> MapResult<()> {
    if a.dimension != rhs.nrows() {
        Err(MapError::SizeMismatch {
            context: "right-hand side rows",
            expected: a.dimension,
            found: rhs.nrows(),
        })
    } else {
        Ok(())
    }
}

/// Solvers available to the smoothing engine, keyed by matrix class
pub struct SolverRegistry {
    solvers: BTreeMap<MatrixClass, Box<dyn SparseSolver>>,
}

impl SolverRegistry {
    /// A registry with nothing in it
    pub fn empty() -> Self {
        Self {
            solvers: BTreeMap::new(),
        }
    }

    /// Cholesky for positive definite systems, dense LU for the others
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(MatrixClass::SymmetricPositiveDefinite, Box::new(CholeskySolver))
            .with(MatrixClass::SymmetricIndefinite, Box::new(DenseLuSolver))
            .with(MatrixClass::General, Box::new(DenseLuSolver))
    }

    pub fn with(mut self, class: MatrixClass, solver: Box<dyn SparseSolver>) -> Self {
        self.register(class, solver);
        self
    }

    pub fn register(&mut self, class: MatrixClass, solver: Box<dyn SparseSolver>) {
        self.solvers.insert(class, solver);
    }

    pub fn get(&self, class: MatrixClass) -> MapResult<&dyn SparseSolver> {
        self.solvers
            .get(&class)
            .map(|s| s.as_ref())
            .ok_or(MapError::SolverUnavailable(class))
    }

    pub fn solve(
        &self,
        class: MatrixClass,
        a: &SparseMatrix,
        rhs: &DMatrix<f64>,
    ) -> MapResult<DMatrix<f64>> {
        let solver = self.get(class)?;
        tracing::debug!(solver = solver.name(), dimension = a.dimension, columns = rhs.ncols(), "direct solve");
        solver.solve(a, rhs)
    }
}

impl Default for SolverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.solvers.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn laplacian_1d(n: usize) -> SparseMatrix {
        let mut sm = SparseMatrix::new(n);
        for i in 0..n {
            sm.insert([i, i], 2.0);
            if i + 1 < n {
                sm.insert([i, i + 1], -1.0);
            }
        }
        sm
    }

    #[test]
    fn cholesky_and_lu_agree() {
        let a = laplacian_1d(6);
        let b = DMatrix::from_fn(6, 2, |r, c| (r + c) as f64);
        let x1 = CholeskySolver.solve(&a, &b).unwrap();
        let x2 = DenseLuSolver.solve(&a, &b).unwrap();
        assert_relative_eq!(x1, x2, epsilon = 1e-12);
        assert_relative_eq!(DMatrix::from(&a) * x1, b, epsilon = 1e-12);
    }

    #[test]
    fn missing_solver_is_reported() {
        let registry = SolverRegistry::empty().with(MatrixClass::General, Box::new(DenseLuSolver));
        let err = registry
            .solve(
                MatrixClass::SymmetricPositiveDefinite,
                &laplacian_1d(2),
                &DMatrix::zeros(2, 1),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::SolverUnavailable(MatrixClass::SymmetricPositiveDefinite)
        ));
    }

    #[test]
    fn indefinite_system_fails_cholesky() {
        let mut a = SparseMatrix::new(2);
        a.insert([0, 0], 1.0);
        a.insert([1, 1], -1.0);
        let b = DMatrix::from_element(2, 1, 1.0);
        assert!(matches!(CholeskySolver.solve(&a, &b), Err(MapError::SolverFailed(_))));
        let x = SolverRegistry::default()
            .solve(MatrixClass::SymmetricIndefinite, &a, &b)
            .unwrap();
        assert_relative_eq!(x[(1, 0)], -1.0, epsilon = 1e-14);
    }

    #[test]
    fn rhs_size_is_checked() {
        assert!(matches!(
            DenseLuSolver.solve(&laplacian_1d(3), &DMatrix::zeros(2, 1)),
            Err(MapError::SolverFailed(_)) | Err(MapError::SizeMismatch { .. })
        ));
    }
}
