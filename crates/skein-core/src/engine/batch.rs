//! The reusable token-entry buffer handed to [`ModelBackend::decode`].
//!
//! [`ModelBackend::decode`]: crate::engine::backend::ModelBackend::decode

use crate::engine::backend::{BackendError, Pos, SlotId, Token};

/// One token entry in a decode batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: Pos,
    pub slot: SlotId,
    /// Whether logits should be computed for this entry.
    pub logits: bool,
}

/// A packed list of `(token, position, slot, logits-flag)` entries decoded
/// together in one model call.
///
/// Created once at scheduler construction, filled each tick and cleared after
/// every decode.
#[derive(Debug)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    /// Create a batch with the given maximum entry capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free entry slots remaining before the batch is full.
    pub fn room(&self) -> usize {
        self.capacity - self.entries.len()
    }

    /// Append one entry, returning its index within the batch.
    pub fn add(
        &mut self,
        token: Token,
        pos: Pos,
        slot: SlotId,
        logits: bool,
    ) -> Result<usize, BackendError> {
        if self.entries.len() >= self.capacity {
            return Err(BackendError::BatchCapacity {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            slot,
            logits,
        });
        Ok(self.entries.len() - 1)
    }

    /// Clear all entries, allowing the batch to be reused.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_returns_sequential_indices() {
        let mut batch = Batch::new(4);
        assert_eq!(batch.add(10, 0, 0, false).unwrap(), 0);
        assert_eq!(batch.add(11, 1, 0, true).unwrap(), 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.room(), 2);
    }

    #[test]
    fn add_rejects_beyond_capacity() {
        let mut batch = Batch::new(1);
        batch.add(1, 0, 0, true).unwrap();
        assert!(matches!(
            batch.add(2, 1, 0, true),
            Err(BackendError::BatchCapacity { capacity: 1 })
        ));
    }

    #[test]
    fn clear_resets_for_reuse() {
        let mut batch = Batch::new(2);
        batch.add(1, 0, 0, true).unwrap();
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.room(), 2);
        assert_eq!(batch.add(2, 0, 1, true).unwrap(), 0);
    }
}
