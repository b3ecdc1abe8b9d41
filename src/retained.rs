use crate::{ReduceError, ReduceResult};
use fixedbitset::FixedBitSet;
use std::fmt;

/// Set of species indices kept by a reduction, sized to the model.
#[derive(Clone, PartialEq, Eq)]
pub struct RetainedSpecies {
    bits: FixedBitSet,
}

impl RetainedSpecies {
    pub fn new(n_species: usize) -> Self {
        Self { bits: FixedBitSet::with_capacity(n_species) }
    }

    pub fn from_indices<I>(n_species: usize, indices: I) -> ReduceResult<Self>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut retained = Self::new(n_species);
        for index in indices {
            if index >= n_species {
                return Err(ReduceError::InvalidSource { source: index, species: n_species });
            }
            retained.bits.insert(index);
        }
        Ok(retained)
    }

    pub fn insert(&mut self, index: usize) -> ReduceResult<()> {
        if index >= self.n_species() {
            return Err(ReduceError::InvalidSource { source: index, species: self.n_species() });
        }
        self.bits.insert(index);
        Ok(())
    }

    pub fn contains(&self, index: usize) -> bool {
        self.bits.contains(index)
    }

    /// Number of retained species.
    pub fn len(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_all(&self) -> bool {
        self.len() == self.n_species()
    }

    pub fn n_species(&self) -> usize {
        self.bits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.ones()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    pub fn union_with(&mut self, other: &RetainedSpecies) -> ReduceResult<()> {
        if other.n_species() != self.n_species() {
            return Err(ReduceError::Other(format!(
                "Cannot merge retained sets over {} and {} species",
                self.n_species(),
                other.n_species()
            )));
        }
        self.bits.union_with(&other.bits);
        Ok(())
    }

    pub fn is_subset(&self, other: &RetainedSpecies) -> bool {
        self.bits.is_subset(&other.bits)
    }

    pub(crate) fn from_bits(bits: FixedBitSet) -> Self {
        Self { bits }
    }
}

impl fmt::Debug for RetainedSpecies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_indices_rejects_out_of_range() {
        assert!(matches!(
            RetainedSpecies::from_indices(3, [0, 3]),
            Err(ReduceError::InvalidSource { source: 3, species: 3 })
        ));
    }

    #[test]
    fn test_union_and_subset() {
        let mut a = RetainedSpecies::from_indices(5, [0, 2]).unwrap();
        let b = RetainedSpecies::from_indices(5, [2, 4]).unwrap();
        assert!(!b.is_subset(&a));
        a.union_with(&b).unwrap();
        assert_eq!(a.to_vec(), vec![0, 2, 4]);
        assert!(b.is_subset(&a));
        assert_eq!(a.len(), 3);
        assert!(!a.is_all());
    }

    #[test]
    fn test_union_size_mismatch() {
        let mut a = RetainedSpecies::new(3);
        assert!(a.union_with(&RetainedSpecies::new(4)).is_err());
        assert!(a.is_empty());
    }
}
