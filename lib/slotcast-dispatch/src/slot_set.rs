use std::fmt;

use smallvec::SmallVec;

use crate::bitmap::{word_mask, INLINE_WORDS, WORD_BITS};

/// A snapshot of dirty slot indices.
///
/// This is what listeners receive when a channel is flushed: every slot that was marked since the previous flush,
/// exactly once. Iteration always yields indices in ascending order.
///
/// Snapshots of up to [`INLINE_SLOTS`][crate::INLINE_SLOTS] slots are stored inline and do not allocate.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SlotSet {
    words: SmallVec<[u64; INLINE_WORDS]>,
    capacity: usize,
}

impl SlotSet {
    /// Creates a snapshot from raw bitmap words.
    ///
    /// Words past `capacity` are dropped, and bits at or beyond `capacity` are masked out.
    pub(crate) fn from_words(mut words: SmallVec<[u64; INLINE_WORDS]>, capacity: usize) -> Self {
        words.truncate(capacity.div_ceil(WORD_BITS));
        for (word_idx, word) in words.iter_mut().enumerate() {
            *word &= word_mask(word_idx, capacity);
        }

        Self { words, capacity }
    }

    /// Creates a snapshot with the given capacity holding the given indices.
    ///
    /// Indices at or beyond `capacity` are ignored.
    pub fn from_indices<I>(capacity: usize, indices: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut words = SmallVec::from_elem(0u64, capacity.div_ceil(WORD_BITS));
        for index in indices.into_iter().filter(|index| *index < capacity) {
            words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
        }

        Self { words, capacity }
    }

    /// Returns the number of addressable slots at the time the snapshot was taken.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of dirty slots.
    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Returns `true` if no slot is dirty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Returns `true` if the given slot is dirty.
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| word & (1u64 << (index % WORD_BITS)) != 0)
    }

    /// Returns an iterator over the dirty slot indices, in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }
}

impl fmt::Debug for SlotSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a SlotSet {
    type Item = usize;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the dirty slots of a [`SlotSet`].
pub struct Iter<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * WORD_BITS + bit);
            }

            self.word_idx += 1;
            self.current = *self.words.get(self.word_idx)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_iteration() {
        let set = SlotSet::from_indices(200, [150, 3, 64, 0, 63, 199]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3, 63, 64, 150, 199]);
        assert_eq!(set.len(), 6);
        assert_eq!(set.capacity(), 200);
    }

    #[test]
    fn ignores_out_of_range() {
        let set = SlotSet::from_indices(4, [1, 4, 9]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1]);
        assert!(!set.contains(4));
        assert!(!set.contains(1000));
    }

    #[test]
    fn raw_words_masked_to_capacity() {
        let words = SmallVec::from_slice(&[0b100010, 1u64 << 6]);
        let set = SlotSet::from_words(words, 5);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(set.len(), 1);
        assert!(!set.contains(5));
        assert!(!set.contains(70));
        assert_eq!(set, SlotSet::from_indices(5, [1]));

        let set = SlotSet::from_words(SmallVec::from_slice(&[0, 1u64 << 6]), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn empty() {
        let set = SlotSet::from_indices(16, []);
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
        assert_eq!(set.iter().next(), None);

        let default = SlotSet::default();
        assert!(default.is_empty());
        assert_eq!(default.iter().next(), None);
    }

    #[test]
    fn debug_lists_indices() {
        let set = SlotSet::from_indices(8, [5, 2]);
        assert_eq!(format!("{:?}", set), "{2, 5}");
    }
}
