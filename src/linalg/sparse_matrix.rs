use std::collections::BTreeMap;

use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};

/// Wrapper around a BTreeMap to store square-symmetric matrices in a sparse data structure
#[derive(Clone, Debug, Default)]
pub struct SparseMatrix {
    /// Size of the square matrix
    pub dimension: usize,
    /// Upper triangle entries
    entries: BTreeMap<[u32; 2], f64>,
}

impl SparseMatrix {
    pub fn new(dimension: usize) -> Self {
        assert!(
            dimension <= (u32::MAX as usize),
            "Matrix Dimension cannot exceed the size of a u32!"
        );

        Self {
            dimension,
            entries: BTreeMap::new(),
        }
    }

    /// Number of non-zero entries in the full (upper and lower) matrix
    pub fn num_entries(&self) -> usize {
        let num_diag = self.entries.keys().filter(|[i, j]| i == j).count();
        2 * self.entries.len() - num_diag
    }

    fn upper_coordinates(&self, [row_idx, col_idx]: [usize; 2]) -> [u32; 2] {
        assert!(
            row_idx < self.dimension,
            "row_idx exceeded matrix dimension; cannot insert value!"
        );
        assert!(
            col_idx < self.dimension,
            "col_idx exceeded matrix dimension; cannot insert value!"
        );
        if row_idx <= col_idx {
            [row_idx as u32, col_idx as u32]
        } else {
            [col_idx as u32, row_idx as u32]
        }
    }

    /// Insert a value into the matrix. Assumes symmetry: row/col order does not matter.
    pub fn insert(&mut self, rc: [usize; 2], value: f64) {
        let coordinates = self.upper_coordinates(rc);
        self.entries
            .entry(coordinates)
            .and_modify(|current| *current += value)
            .or_insert(value);
    }

    /// Insert a group of entries
    pub fn insert_group(&mut self, mut entry_group: Vec<([usize; 2], f64)>) {
        for (rc, value) in entry_group.drain(0..) {
            self.insert(rc, value);
        }
    }

    // Remove the entries from the matrix, replacing them with an empty BTreeMap.
    fn take_entries(&mut self) -> BTreeMap<[u32; 2], f64> {
        std::mem::take(&mut self.entries)
    }

    /// Consume the entries from another sparse matrix leaving it empty.
    pub fn consume_matrix(&mut self, other: &mut Self) {
        assert!(
            self.dimension == other.dimension,
            "Sparse Matrices have different dimensions; cannot consume matrix!"
        );
        for (coordinates, value) in other.take_entries() {
            self.entries
                .entry(coordinates)
                .and_modify(|current| *current += value)
                .or_insert(value);
        }
    }

    /// Iterate over the upper triangle of the matrix.
    pub fn iter_upper_tri(&self) -> impl Iterator<Item = ([usize; 2], f64)> + '_ {
        self.entries
            .iter()
            .map(|(coords, value)| ([coords[0] as usize, coords[1] as usize], *value))
    }

    /// Diagonal entry (zero if never inserted)
    pub fn diagonal(&self, i: usize) -> f64 {
        self.entries
            .get(&[i as u32, i as u32])
            .copied()
            .unwrap_or(0.0)
    }

    /// Rows that have no entry at all
    pub fn empty_rows(&self) -> Vec<usize> {
        let mut touched = vec![false; self.dimension];
        for [r, c] in self.entries.keys() {
            touched[*r as usize] = true;
            touched[*c as usize] = true;
        }
        touched
            .iter()
            .enumerate()
            .filter(|(_, t)| !**t)
            .map(|(i, _)| i)
            .collect()
    }

    /// Matrix-vector product with the full symmetric matrix
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.dimension, "vector length does not match matrix dimension");
        let mut y = vec![0.0; self.dimension];
        for ([r, c], v) in self.iter_upper_tri() {
            y[r] += v * x[c];
            if r != c {
                y[c] += v * x[r];
            }
        }
        y
    }

    /// Triplets of the full matrix, as consumed by sparse factorizations
    pub fn to_coo(&self) -> CooMatrix<f64> {
        let mut coo = CooMatrix::new(self.dimension, self.dimension);
        for ([r, c], v) in self.iter_upper_tri() {
            coo.push(r, c, v);
            if r != c {
                coo.push(c, r, v);
            }
        }
        coo
    }
}

impl From<&SparseMatrix> for CscMatrix<f64> {
    fn from(sm: &SparseMatrix) -> Self {
        CscMatrix::from(&sm.to_coo())
    }
}

impl From<&SparseMatrix> for DMatrix<f64> {
    fn from(sm: &SparseMatrix) -> Self {
        let mut dense = DMatrix::zeros(sm.dimension, sm.dimension);
        for ([r, c], v) in sm.iter_upper_tri() {
            dense[(r, c)] = v;
            dense[(c, r)] = v;
        }
        dense
    }
}

/// Rectangular sparse matrix (no symmetry assumed), e.g. the coupling of free to fixed unknowns
#[derive(Clone, Debug, Default)]
pub struct CouplingMatrix {
    pub rows: usize,
    pub cols: usize,
    entries: BTreeMap<[u32; 2], f64>,
}

impl CouplingMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        assert!(
            rows <= (u32::MAX as usize) && cols <= (u32::MAX as usize),
            "Matrix Dimensions cannot exceed the size of a u32!"
        );
        Self {
            rows,
            cols,
            entries: BTreeMap::new(),
        }
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, [r, c]: [usize; 2], value: f64) {
        assert!(r < self.rows, "row_idx exceeded matrix dimension; cannot insert value!");
        assert!(c < self.cols, "col_idx exceeded matrix dimension; cannot insert value!");
        self.entries
            .entry([r as u32, c as u32])
            .and_modify(|current| *current += value)
            .or_insert(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = ([usize; 2], f64)> + '_ {
        self.entries
            .iter()
            .map(|(coords, value)| ([coords[0] as usize, coords[1] as usize], *value))
    }

    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.cols, "vector length does not match matrix columns");
        let mut y = vec![0.0; self.rows];
        for ([r, c], v) in self.iter() {
            y[r] += v * x[c];
        }
        y
    }

    /// Product with every column of a dense matrix (`cols x k`)
    pub fn mul_dense(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        assert_eq!(x.nrows(), self.cols, "dense operand does not match matrix columns");
        let mut y = DMatrix::zeros(self.rows, x.ncols());
        for ([r, c], v) in self.iter() {
            for k in 0..x.ncols() {
                y[(r, k)] += v * x[(c, k)];
            }
        }
        y
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        for ([r, c], v) in self.iter() {
            dense[(r, c)] = v;
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_insertion() {
        let mut sm = SparseMatrix::new(10);

        sm.insert([0, 0], 1.0);
        sm.insert([0, 0], 1.0);
        sm.insert([9, 9], 10.0);
        sm.insert([4, 3], 0.25);
        sm.insert([0, 8], 0.125);
        sm.insert([8, 0], 0.125);

        let raw_entries = sm.take_entries();

        assert!((raw_entries.get(&[0, 0]).unwrap() - 2.0).abs() < 1e-15);
        assert!((raw_entries.get(&[9, 9]).unwrap() - 10.0).abs() < 1e-15);
        assert!((raw_entries.get(&[3, 4]).unwrap() - 0.25).abs() < 1e-15);
        assert!((raw_entries.get(&[0, 8]).unwrap() - 0.25).abs() < 1e-15);

        assert!(raw_entries.get(&[4, 3]).is_none());
        assert!(raw_entries.get(&[8, 0]).is_none());
    }

    #[test]
    fn consume_another_matrix() {
        let mut sm_a = SparseMatrix::new(5);
        let mut sm_b = SparseMatrix::new(5);

        sm_a.insert([1, 1], 2.0);
        sm_b.insert([1, 1], 3.0);
        sm_b.insert([2, 4], -1.0);

        sm_a.consume_matrix(&mut sm_b);
        assert_eq!(sm_b.num_entries(), 0);
        assert_eq!(sm_a.num_entries(), 3);
        assert!((sm_a.diagonal(1) - 5.0).abs() < 1e-15);
        assert_eq!(sm_a.empty_rows(), vec![0, 3]);
    }

    #[test]
    fn symmetric_product_and_conversions() {
        let mut sm = SparseMatrix::new(3);
        sm.insert([0, 0], 2.0);
        sm.insert([1, 0], -1.0);
        sm.insert([1, 1], 2.0);
        sm.insert([2, 2], 1.0);

        let x = [1.0, 2.0, 3.0];
        assert_eq!(sm.mul_vec(&x), vec![0.0, 3.0, 3.0]);

        let dense = DMatrix::from(&sm);
        assert_eq!(dense[(0, 1)], -1.0);
        assert_eq!(dense[(1, 0)], -1.0);

        let csc = CscMatrix::from(&sm);
        assert_eq!(csc.nnz(), sm.num_entries());
    }

    #[test]
    fn coupling_products() {
        let mut cm = CouplingMatrix::new(2, 3);
        cm.insert([0, 2], 1.5);
        cm.insert([1, 0], -2.0);
        cm.insert([1, 0], 1.0);
        assert_eq!(cm.mul_vec(&[1.0, 0.0, 2.0]), vec![3.0, -1.0]);

        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 0.0, 2.0, 1.0]);
        let y = cm.mul_dense(&x);
        assert_eq!(y[(0, 0)], 3.0);
        assert_eq!(y[(0, 1)], 1.5);
        assert_eq!(y[(1, 0)], -1.0);
    }
}
