//! # History Ring
//!
//! Fixed-capacity FIFO used for the "last N movements" history kept on each
//! aggregate item-type node. Pushing into a full ring evicts the oldest item,
//! so the cap is an invariant of the type rather than a truncation every
//! writer has to remember.
//!
//! Serializes as a plain JSON array (oldest first). Deserializing an array
//! longer than the capacity keeps only the newest items.

use std::collections::VecDeque;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::HISTORY_CAPACITY;

/// Bounded FIFO with push-evict-oldest semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRing<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> HistoryRing<T> {
    /// Creates an empty ring holding at most `capacity` items.
    ///
    /// A capacity of zero is bumped to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        HistoryRing {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Builds a ring from items ordered oldest first, keeping the newest
    /// `capacity` of them.
    pub fn from_vec(capacity: usize, items: Vec<T>) -> Self {
        let mut ring = Self::with_capacity(capacity);
        for item in items {
            ring.push(item);
        }
        ring
    }

    /// Appends an item, returning the evicted oldest item if the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Most recently pushed item.
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterates oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> HistoryRing<T> {
    /// Copies the items out, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T> Default for HistoryRing<T> {
    fn default() -> Self {
        HistoryRing::with_capacity(HISTORY_CAPACITY)
    }
}

impl<T: Serialize> Serialize for HistoryRing<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for HistoryRing<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<T>::deserialize(deserializer)?;
        Ok(HistoryRing::from_vec(HISTORY_CAPACITY, items))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest_when_full() {
        let mut ring = HistoryRing::with_capacity(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
        assert_eq!(ring.latest(), Some(&4));
    }

    #[test]
    fn test_from_vec_keeps_newest() {
        let ring = HistoryRing::from_vec(2, vec!["a", "b", "c"]);
        assert_eq!(ring.to_vec(), vec!["b", "c"]);
        assert_eq!(ring.capacity(), 2);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut ring = HistoryRing::with_capacity(0);
        ring.push('x');
        ring.push('y');
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.latest(), Some(&'y'));
    }

    #[test]
    fn test_deserialize_caps_long_history() {
        let raw: Vec<u32> = (0..15).collect();
        let json = serde_json::to_string(&raw).unwrap();
        let ring: HistoryRing<u32> = serde_json::from_str(&json).unwrap();

        assert_eq!(ring.len(), HISTORY_CAPACITY);
        assert_eq!(ring.iter().next(), Some(&5));
        assert_eq!(serde_json::to_value(&ring).unwrap()[9], 14);
    }
}
