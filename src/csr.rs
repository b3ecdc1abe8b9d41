//! Compressed sparse row adjacency matrix. Rows are appended in order while
//! building; after `finalize()` the matrix is read-only.

use crate::{ReduceError, ReduceResult};
use bincode::{Decode, Encode};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CsrAdjacencyMatrix {
    size: usize,
    row_offsets: Vec<usize>,
    cols: Vec<usize>,
    weights: Vec<f64>,
    finalized: bool,
}

impl CsrAdjacencyMatrix {
    pub fn new(size: usize) -> Self {
        let mut row_offsets = Vec::with_capacity(size + 1);
        row_offsets.push(0);
        Self {
            size,
            row_offsets,
            cols: Vec::new(),
            weights: Vec::new(),
            finalized: false,
        }
    }

    pub fn from_dense(size: usize, dense: &[f64]) -> ReduceResult<Self> {
        if dense.len() != size * size {
            return Err(ReduceError::Matrix(format!(
                "Dense matrix has {} entries, expected {}",
                dense.len(),
                size * size
            )));
        }
        let mut matrix = Self::new(size);
        for row in 0..size {
            matrix.add_row(row, &dense[row * size..(row + 1) * size])?;
        }
        matrix.finalize();
        Ok(matrix)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nnz(&self) -> usize {
        self.weights.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Rows appended so far.
    pub fn rows(&self) -> usize {
        self.row_offsets.len() - 1
    }

    /// Append a dense row, keeping its nonzero entries. Rows may be skipped
    /// (they stay empty) but never revisited.
    pub fn add_row(&mut self, row: usize, dense: &[f64]) -> ReduceResult<()> {
        if dense.len() != self.size {
            return Err(ReduceError::Matrix(format!(
                "Row {} has {} entries, expected {}",
                row,
                dense.len(),
                self.size
            )));
        }
        self.check_append(row)?;
        for (col, &weight) in dense.iter().enumerate() {
            check_weight(row, col, weight)?;
        }
        self.pad_to(row);
        for (col, &weight) in dense.iter().enumerate() {
            if weight != 0.0 {
                self.cols.push(col);
                self.weights.push(weight);
            }
        }
        self.row_offsets.push(self.cols.len());
        Ok(())
    }

    /// Append a row given as `(column, weight)` pairs with strictly ascending
    /// columns. Zero weights are dropped.
    pub fn add_sparse_row(&mut self, row: usize, entries: &[(usize, f64)]) -> ReduceResult<()> {
        self.check_append(row)?;
        let mut previous: Option<usize> = None;
        for &(col, weight) in entries {
            if col >= self.size {
                return Err(ReduceError::Matrix(format!(
                    "Column {} out of range for size {}",
                    col, self.size
                )));
            }
            if previous.is_some_and(|p| col <= p) {
                return Err(ReduceError::Matrix(format!(
                    "Columns of row {} are not strictly ascending at {}",
                    row, col
                )));
            }
            check_weight(row, col, weight)?;
            previous = Some(col);
        }
        self.pad_to(row);
        for &(col, weight) in entries {
            if weight != 0.0 {
                self.cols.push(col);
                self.weights.push(weight);
            }
        }
        self.row_offsets.push(self.cols.len());
        Ok(())
    }

    /// Pad the remaining rows and freeze the matrix.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        let end = self.cols.len();
        while self.row_offsets.len() < self.size + 1 {
            self.row_offsets.push(end);
        }
        self.finalized = true;
    }

    /// `(column, weight)` pairs of a row, columns ascending.
    pub fn neighbours(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (start, end) = self.row_range(row);
        self.cols[start..end]
            .iter()
            .copied()
            .zip(self.weights[start..end].iter().copied())
    }

    pub fn at(&self, from: usize, to: usize) -> f64 {
        let (start, end) = self.row_range(from);
        match self.cols[start..end].binary_search(&to) {
            Ok(i) => self.weights[start + i],
            Err(_) => 0.0,
        }
    }

    pub fn to_dense(&self) -> Vec<f64> {
        let mut dense = vec![0.0; self.size * self.size];
        for row in 0..self.size {
            for (col, weight) in self.neighbours(row) {
                dense[row * self.size + col] = weight;
            }
        }
        dense
    }

    fn row_range(&self, row: usize) -> (usize, usize) {
        if row + 1 < self.row_offsets.len() {
            (self.row_offsets[row], self.row_offsets[row + 1])
        } else {
            (0, 0)
        }
    }

    fn check_append(&self, row: usize) -> ReduceResult<()> {
        if self.finalized {
            return Err(ReduceError::Matrix("Matrix is finalized".to_string()));
        }
        if row >= self.size {
            return Err(ReduceError::Matrix(format!(
                "Row {} out of range for size {}",
                row, self.size
            )));
        }
        if row < self.rows() {
            return Err(ReduceError::Matrix(format!(
                "Row {} appended after row {}",
                row,
                self.rows() - 1
            )));
        }
        Ok(())
    }

    fn pad_to(&mut self, row: usize) {
        let end = self.cols.len();
        while self.rows() < row {
            self.row_offsets.push(end);
        }
    }
}

fn check_weight(row: usize, col: usize, weight: f64) -> ReduceResult<()> {
    if weight.is_nan() || weight < 0.0 {
        return Err(ReduceError::Matrix(format!(
            "Invalid weight {} at ({}, {})",
            weight, row, col
        )));
    }
    Ok(())
}
