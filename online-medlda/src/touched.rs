//! Sparse sets of touched `(topic, word)` cells.
//!
//! A mini-batch only touches the cells of the words it contains, so
//! merging it into (or removing it from) the K×T topic-word table costs
//! O(touched) instead of O(K·T). The same structure records the prior
//! values of those cells so a merge can be rolled back exactly.

use crate::error::MedLdaError;
use std::collections::BTreeMap;

/// Values keyed by `(topic, word)`, iterated in key order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TouchedCells {
    cells: BTreeMap<(usize, usize), f64>,
    capacity: Option<usize>,
}

impl TouchedCells {
    /// Empty set holding at most `capacity` distinct cells.
    pub fn new(capacity: Option<usize>) -> Self {
        TouchedCells {
            cells: BTreeMap::new(),
            capacity,
        }
    }

    fn check_room(&self, key: &(usize, usize)) -> anyhow::Result<()> {
        if let Some(limit) = self.capacity {
            if self.cells.len() >= limit && !self.cells.contains_key(key) {
                return Err(MedLdaError::Capacity { limit }.into());
            }
        }
        Ok(())
    }

    /// `cells[(k, t)] += value`; touching a new cell past capacity fails.
    pub fn add(&mut self, k: usize, t: usize, value: f64) -> anyhow::Result<()> {
        let key = (k, t);
        self.check_room(&key)?;
        *self.cells.entry(key).or_insert(0.0) += value;
        Ok(())
    }

    /// Record `value` for `(k, t)` unless the cell is already present.
    pub fn insert_if_absent(&mut self, k: usize, t: usize, value: f64) -> anyhow::Result<()> {
        let key = (k, t);
        if self.cells.contains_key(&key) {
            return Ok(());
        }
        self.check_room(&key)?;
        self.cells.insert(key, value);
        Ok(())
    }

    /// Value at `(k, t)`, zero if untouched.
    #[inline]
    pub fn get(&self, k: usize, t: usize) -> f64 {
        self.cells.get(&(k, t)).copied().unwrap_or(0.0)
    }

    /// Touched cells in `(topic, word)` order.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), f64)> + '_ {
        self.cells.iter().map(|(&key, &v)| (key, v))
    }

    /// Number of touched cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if nothing was touched.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Multiply every value by `s`.
    pub fn scale(&mut self, s: f64) {
        for v in self.cells.values_mut() {
            *v *= s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    #[test]
    fn test_add_accumulates() {
        let mut cells = TouchedCells::new(None);
        cells.add(0, 3, 2.0).unwrap();
        cells.add(1, 0, 1.0).unwrap();
        cells.add(0, 3, 1.0).unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells.get(0, 3), 3.0);
        assert_eq!(cells.get(1, 1), 0.0);
    }

    #[test]
    fn test_capacity_is_an_error_not_truncation() {
        let mut cells = TouchedCells::new(Some(2));
        cells.add(0, 0, 1.0).unwrap();
        cells.add(0, 1, 1.0).unwrap();
        // existing cell still updatable
        cells.add(0, 1, 1.0).unwrap();
        let err = cells.add(1, 1, 1.0).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(MedLdaError::Capacity { limit: 2 })
        ));
        assert_eq!(cells.len(), 2);
    }

    #[test]
    fn test_insert_if_absent_keeps_first_value() {
        let mut prev = TouchedCells::new(None);
        prev.insert_if_absent(2, 2, 5.0).unwrap();
        prev.insert_if_absent(2, 2, 7.0).unwrap();
        assert_eq!(prev.get(2, 2), 5.0);
        assert_eq!(prev.len(), 1);
    }

    #[test]
    fn test_iteration_order_is_stable() {
        let mut cells = TouchedCells::new(None);
        cells.add(1, 0, 1.0).unwrap();
        cells.add(0, 5, 1.0).unwrap();
        cells.add(0, 2, 1.0).unwrap();
        let keys: Vec<_> = cells.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![(0, 2), (0, 5), (1, 0)]);
    }
}
