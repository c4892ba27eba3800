use crate::error::{check_size, MapError, MapResult};

use bytes::{Buf, BufMut, BytesMut};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};

const MAGIC: &[u8; 4] = b"MMAP";
const VERSION: u32 = 1;

/// Sparse block matrix from structural node displacements to target node displacements
///
/// Row `i` belongs to target node `targets[i]` and holds 3x3 blocks for the structural nodes
/// it depends on, sorted by structural node id. Rows without blocks (unmapped targets) map to
/// zero.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingMatrix {
    targets: Vec<u32>,
    source_count: usize,
    offsets: Vec<usize>,
    columns: Vec<u32>,
    blocks: Vec<Matrix3<f64>>,
}

impl MappingMatrix {
    /// An empty matrix over `source_count` structural nodes
    pub fn new(source_count: usize) -> Self {
        Self {
            targets: Vec::new(),
            source_count,
            offsets: vec![0],
            columns: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Build from one block list per row; blocks of the same column are summed
    pub fn from_rows<I>(source_count: usize, targets: Vec<u32>, rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<(u32, Matrix3<f64>)>>,
    {
        let mut m = Self::new(source_count);
        let mut pending = targets.into_iter();
        for row in rows {
            let target = pending.next().unwrap_or(u32::MAX);
            m.push_row(target, row);
        }
        m
    }

    /// Append a row for target node `target`
    pub fn push_row(&mut self, target: u32, row: Vec<(u32, Matrix3<f64>)>) {
        let mut merged: BTreeMap<u32, Matrix3<f64>> = BTreeMap::new();
        for (col, block) in row {
            assert!(
                (col as usize) < self.source_count,
                "block column exceeded the number of source nodes!"
            );
            *merged.entry(col).or_insert_with(Matrix3::zeros) += block;
        }
        self.targets.push(target);
        for (col, block) in merged {
            self.columns.push(col);
            self.blocks.push(block);
        }
        self.offsets.push(self.columns.len());
    }

    pub fn row_count(&self) -> usize {
        self.targets.len()
    }

    pub fn source_count(&self) -> usize {
        self.source_count
    }

    /// Target node id of every row
    pub fn targets(&self) -> &[u32] {
        &self.targets
    }

    pub fn nnz_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Columns and blocks of one row
    pub fn row(&self, i: usize) -> (&[u32], &[Matrix3<f64>]) {
        let r = self.offsets[i]..self.offsets[i + 1];
        (&self.columns[r.clone()], &self.blocks[r])
    }

    pub fn row_is_empty(&self, i: usize) -> bool {
        self.offsets[i] == self.offsets[i + 1]
    }

    /// Sum of the blocks of one row; the identity for a partition of unity
    pub fn row_weight_sum(&self, i: usize) -> Matrix3<f64> {
        self.row(i).1.iter().sum()
    }

    /// Map structural displacements (indexed by structural node id) to one vector per row
    pub fn apply(&self, u: &[Vector3<f64>]) -> MapResult<Vec<Vector3<f64>>> {
        check_size("source displacements", self.source_count, u.len())?;
        Ok((0..self.row_count())
            .into_par_iter()
            .map(|i| {
                let (cols, blocks) = self.row(i);
                cols.iter()
                    .zip(blocks.iter())
                    .map(|(&c, b)| b * u[c as usize])
                    .sum()
            })
            .collect())
    }

    /// New matrix whose row `i` is `Σ c · row j` over `(j, c)` in `combos[i]`
    ///
    /// Row targets are kept; `combos` must have one entry per row.
    pub fn combine_rows(&self, combos: &[Vec<(usize, f64)>]) -> MapResult<Self> {
        check_size("row combinations", self.row_count(), combos.len())?;
        let rows: Vec<Vec<(u32, Matrix3<f64>)>> = combos
            .par_iter()
            .map(|combo| {
                let mut row = Vec::new();
                for &(j, c) in combo.iter() {
                    let (cols, blocks) = self.row(j);
                    row.extend(cols.iter().zip(blocks.iter()).map(|(&col, b)| (col, b * c)));
                }
                row
            })
            .collect();
        Ok(Self::from_rows(self.source_count, self.targets.clone(), rows))
    }

    /// Replace every block `B` of row `i` with `P B`
    pub fn premultiply_row(&mut self, i: usize, p: &Matrix3<f64>) {
        let r = self.offsets[i]..self.offsets[i + 1];
        for b in self.blocks[r].iter_mut() {
            *b = p * *b;
        }
    }

    /// Write the matrix to a binary file (big-endian, 1-based node ids)
    ///
    /// Layout: magic `MMAP`, version, row count, source node count, block count; then the
    /// target node id of every row, the block count of every row, the source node id of every
    /// block and finally nine row-major values per block.
    pub fn write_binary(&self, path: impl AsRef<str>) -> MapResult<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);

        // header
        let mut header_buf = BytesMut::with_capacity(24);
        header_buf.put(&MAGIC[..]);
        header_buf.put_u32(VERSION);
        header_buf.put_u32(self.row_count() as u32);
        header_buf.put_u32(self.source_count as u32);
        header_buf.put_u64(self.nnz_blocks() as u64);
        writer.write_all(header_buf.as_ref())?;

        // target node of each row
        let mut rows_buf = BytesMut::with_capacity(self.row_count() * 8);
        for &t in self.targets.iter() {
            rows_buf.put_u32(t + 1);
        }
        // number of blocks on each row
        for w in self.offsets.windows(2) {
            rows_buf.put_u32((w[1] - w[0]) as u32);
        }
        writer.write_all(rows_buf.as_ref())?;

        // source node of each block
        let mut col_buf = BytesMut::with_capacity(self.columns.len() * 4);
        for &c in self.columns.iter() {
            col_buf.put_u32(c + 1);
        }
        writer.write_all(col_buf.as_ref())?;

        // block values
        let mut val_buf = BytesMut::with_capacity(self.blocks.len() * 72);
        for b in self.blocks.iter() {
            for r in 0..3 {
                for c in 0..3 {
                    val_buf.put_f64(b[(r, c)]);
                }
            }
        }
        writer.write_all(val_buf.as_ref())?;
        writer.flush()?;

        Ok(())
    }

    /// Read a matrix written by [`MappingMatrix::write_binary`]
    pub fn read_binary(path: impl AsRef<str>) -> MapResult<Self> {
        let mut raw = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut raw)?;
        let mut buf = &raw[..];

        let need = |buf: &[u8], n: usize, what: &str| -> MapResult<()> {
            if buf.remaining() < n {
                Err(MapError::Parse(format!("mapping matrix file truncated in {}", what)))
            } else {
                Ok(())
            }
        };

        need(buf, 24, "header")?;
        let mut magic = [0_u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(MapError::Parse("not a mapping matrix file".into()));
        }
        let version = buf.get_u32();
        if version != VERSION {
            return Err(MapError::Parse(format!(
                "unsupported mapping matrix version {}",
                version
            )));
        }
        let row_count = buf.get_u32() as usize;
        let source_count = buf.get_u32() as usize;
        let nnz = buf.get_u64() as usize;

        need(buf, row_count * 8, "row data")?;
        let targets: Vec<u32> = (0..row_count)
            .map(|_| one_based(buf.get_u32(), "target node"))
            .collect::<MapResult<_>>()?;
        let counts: Vec<usize> = (0..row_count).map(|_| buf.get_u32() as usize).collect();
        if counts.iter().sum::<usize>() != nnz {
            return Err(MapError::Parse("row block counts do not add up".into()));
        }

        need(buf, nnz * 4, "column data")?;
        let columns: Vec<u32> = (0..nnz)
            .map(|_| {
                let c = one_based(buf.get_u32(), "source node")?;
                if (c as usize) < source_count {
                    Ok(c)
                } else {
                    Err(MapError::InvalidIndex {
                        kind: "source node",
                        index: c as usize,
                        count: source_count,
                    })
                }
            })
            .collect::<MapResult<_>>()?;

        need(buf, nnz * 72, "block values")?;
        let blocks: Vec<Matrix3<f64>> = (0..nnz)
            .map(|_| {
                let mut b = Matrix3::zeros();
                for r in 0..3 {
                    for c in 0..3 {
                        b[(r, c)] = buf.get_f64();
                    }
                }
                b
            })
            .collect();

        let mut offsets = Vec::with_capacity(row_count + 1);
        offsets.push(0);
        for c in counts {
            offsets.push(offsets[offsets.len() - 1] + c);
        }

        Ok(Self {
            targets,
            source_count,
            offsets,
            columns,
            blocks,
        })
    }
}

fn one_based(id: u32, what: &str) -> MapResult<u32> {
    id.checked_sub(1)
        .ok_or_else(|| MapError::Parse(format!("{} id 0 in a 1-based list", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> MappingMatrix {
        let mut m = MappingMatrix::new(4);
        m.push_row(
            10,
            vec![
                (2, Matrix3::identity() * 0.25),
                (0, Matrix3::identity() * 0.5),
                (2, Matrix3::identity() * 0.25),
            ],
        );
        m.push_row(11, vec![]);
        m.push_row(12, vec![(3, Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.5, 0.0, 0.0, 1.0))]);
        m
    }

    #[test]
    fn rows_merge_duplicate_columns() {
        let m = sample();
        assert_eq!(m.row_count(), 3);
        assert_eq!(m.nnz_blocks(), 3);
        assert_eq!(m.row(0).0, &[0, 2]);
        assert_relative_eq!(m.row_weight_sum(0), Matrix3::identity());
        assert!(m.row_is_empty(1));
    }

    #[test]
    fn apply_and_combine() {
        let m = sample();
        let u = vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, 2.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let v = m.apply(&u).unwrap();
        assert_relative_eq!(v[0], Vector3::new(0.5, 0.0, 1.0));
        assert_eq!(v[1], Vector3::zeros());
        assert_relative_eq!(v[2], Vector3::new(0.0, 0.5, 1.0));
        assert!(m.apply(&u[..3]).is_err());

        let c = m
            .combine_rows(&[vec![(0, 1.0)], vec![(0, 0.5), (2, 0.5)], vec![(2, 1.0)]])
            .unwrap();
        let w = c.apply(&u).unwrap();
        assert_relative_eq!(w[1], (v[0] + v[2]) * 0.5);
        assert_eq!(c.targets(), m.targets());
    }

    #[test]
    fn binary_round_trip() {
        let m = sample();
        std::fs::create_dir_all("./test_output").unwrap();
        m.write_binary("./test_output/mapping.bin").unwrap();
        let back = MappingMatrix::read_binary("./test_output/mapping.bin").unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn truncated_file_is_rejected() {
        std::fs::create_dir_all("./test_output").unwrap();
        std::fs::write("./test_output/truncated.bin", b"MMAP\0\0\0\x01").unwrap();
        assert!(matches!(
            MappingMatrix::read_binary("./test_output/truncated.bin"),
            Err(MapError::Parse(_))
        ));
    }
}
