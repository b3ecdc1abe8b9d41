//! Sequential binary array files used to hand numeric state across worker
//! boundaries by path instead of pushing it through a pipe.
//!
//! A file starts with an 8-byte magic followed by bincode-encoded
//! [`StoredArray`] records. Records are read back in write order.

use crate::{ReduceError, ReduceResult};
use bincode::{Decode, Encode};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"KRARRAY1";

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ArrayData {
    F64(Vec<f64>),
    Index(Vec<u64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::F64(values) => values.len(),
            ArrayData::Index(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ArrayData::F64(_) => "f64",
            ArrayData::Index(_) => "index",
        }
    }
}

/// One array record: a shape and row-major data.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredArray {
    shape: Vec<u64>,
    data: ArrayData,
}

impl StoredArray {
    pub fn new(shape: Vec<usize>, data: ArrayData) -> ReduceResult<Self> {
        let expected = shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
        if expected != Some(data.len()) {
            return Err(ReduceError::Other(format!(
                "Array shape {:?} does not match {} stored values",
                shape,
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.into_iter().map(|d| d as u64).collect(),
            data,
        })
    }

    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len() as u64],
            data: ArrayData::F64(values),
        }
    }

    pub fn from_matrix(rows: usize, cols: usize, values: Vec<f64>) -> ReduceResult<Self> {
        Self::new(vec![rows, cols], ArrayData::F64(values))
    }

    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        let values: Vec<u64> = indices.into_iter().map(|i| i as u64).collect();
        Self {
            shape: vec![values.len() as u64],
            data: ArrayData::Index(values),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shape.iter().map(|&d| d as usize).collect()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn as_f64(&self) -> ReduceResult<&[f64]> {
        match &self.data {
            ArrayData::F64(values) => Ok(values),
            other => Err(ReduceError::Other(format!(
                "Expected f64 array, found {} array",
                other.kind()
            ))),
        }
    }

    pub fn into_f64(self) -> ReduceResult<Vec<f64>> {
        match self.data {
            ArrayData::F64(values) => Ok(values),
            other => Err(ReduceError::Other(format!(
                "Expected f64 array, found {} array",
                other.kind()
            ))),
        }
    }

    pub fn to_indices(&self) -> ReduceResult<Vec<usize>> {
        match &self.data {
            ArrayData::Index(values) => Ok(values.iter().map(|&v| v as usize).collect()),
            other => Err(ReduceError::Other(format!(
                "Expected index array, found {} array",
                other.kind()
            ))),
        }
    }

    fn check_shape(&self) -> ReduceResult<()> {
        let expected = self
            .shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                ReduceError::Other(format!("Corrupted array record: shape {:?} overflows", self.shape))
            })?;
        if usize::try_from(expected).map_or(true, |n| n != self.data.len()) {
            return Err(ReduceError::Other(format!(
                "Corrupted array record: shape {:?} with {} values",
                self.shape,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Create an empty file with a unique name in `dir` and keep it on disk.
pub fn create_unique_file(dir: &Path, prefix: &str, suffix: &str) -> ReduceResult<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;
    let (_, path) = file.keep().map_err(|e| ReduceError::Io(e.error))?;
    Ok(path)
}

pub struct ArrayWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl ArrayWriter {
    /// Create (or truncate) `path` and write the file header.
    pub fn create(path: &Path) -> ReduceResult<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            written: 0,
        })
    }

    pub fn create_unique(dir: &Path, prefix: &str) -> ReduceResult<Self> {
        let path = create_unique_file(dir, prefix, ".bin")?;
        Self::create(&path)
    }

    pub fn write(&mut self, array: &StoredArray) -> ReduceResult<()> {
        bincode::encode_into_std_write(array, &mut self.writer, bincode::config::standard())?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and return the path together with the number of arrays written.
    pub fn finish(mut self) -> ReduceResult<(PathBuf, usize)> {
        self.writer.flush()?;
        Ok((self.path, self.written))
    }
}

pub struct ArrayReader {
    reader: BufReader<File>,
}

impl ArrayReader {
    pub fn open(path: &Path) -> ReduceResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(|e| {
            ReduceError::Other(format!("{} is not an array file: {}", path.display(), e))
        })?;
        if &magic != MAGIC {
            return Err(ReduceError::Other(format!(
                "{} is not an array file",
                path.display()
            )));
        }
        Ok(Self { reader })
    }

    /// Next array in write order, `None` at end of file.
    pub fn read_next(&mut self) -> ReduceResult<Option<StoredArray>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let array: StoredArray =
            bincode::decode_from_std_read(&mut self.reader, bincode::config::standard())?;
        array.check_shape()?;
        Ok(Some(array))
    }
}

impl Iterator for ArrayReader {
    type Item = ReduceResult<StoredArray>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

pub fn read_all(path: &Path) -> ReduceResult<Vec<StoredArray>> {
    ArrayReader::open(path)?.collect()
}

pub fn write_all(path: &Path, arrays: &[StoredArray]) -> ReduceResult<usize> {
    let mut writer = ArrayWriter::create(path)?;
    for array in arrays {
        writer.write(array)?;
    }
    let (_, written) = writer.finish()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrays_come_back_in_write_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("arrays.bin");

        let first = StoredArray::from_f64(vec![1000.0, 101325.0, 0.5, 0.5]);
        let second = StoredArray::from_indices(vec![0, 3, 7]);
        let third = StoredArray::from_matrix(2, 2, vec![0.0, 1.0, 2.0, 0.0]).unwrap();

        let written = write_all(&path, &[first.clone(), second.clone(), third.clone()]).unwrap();
        assert_eq!(written, 3);

        let arrays = read_all(&path).unwrap();
        assert_eq!(arrays, vec![first, second, third]);
        assert_eq!(arrays[2].shape(), vec![2, 2]);
        assert_eq!(arrays[1].to_indices().unwrap(), vec![0, 3, 7]);
    }

    #[test]
    fn test_empty_file_has_no_arrays() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("empty.bin");
        ArrayWriter::create(&path).unwrap().finish().unwrap();

        let mut reader = ArrayReader::open(&path).unwrap();
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn test_rejects_foreign_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("foreign.bin");
        std::fs::write(&path, b"not an array file at all").unwrap();
        assert!(ArrayReader::open(&path).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(StoredArray::new(vec![2, 3], ArrayData::F64(vec![0.0; 5])).is_err());
        assert!(StoredArray::from_matrix(3, 1, vec![1.0, 2.0, 3.0]).is_ok());
    }

    #[test]
    fn test_overflowing_shape_in_file_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("corrupted.bin");
        let corrupted = StoredArray { shape: vec![u64::MAX, 4], data: ArrayData::F64(Vec::new()) };
        write_all(&path, &[corrupted]).unwrap();

        let error = read_all(&path).unwrap_err();
        assert!(matches!(error, ReduceError::Other(ref msg) if msg.contains("overflows")));
        assert!(StoredArray::new(vec![usize::MAX, 2], ArrayData::F64(Vec::new())).is_err());
    }

    #[test]
    fn test_kind_mismatch_reported() {
        let indices = StoredArray::from_indices(vec![1, 2]);
        assert!(indices.as_f64().is_err());
        let values = StoredArray::from_f64(vec![1.0]);
        assert!(values.to_indices().is_err());
    }

    #[test]
    fn test_unique_files_do_not_collide() {
        let temp_dir = tempfile::tempdir().unwrap();
        let a = create_unique_file(temp_dir.path(), "state_for_0_", ".bin").unwrap();
        let b = create_unique_file(temp_dir.path(), "state_for_0_", ".bin").unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("state_for_0_"));
    }
}
