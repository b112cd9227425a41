use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use smallvec::SmallVec;

use crate::sync::AtomicU64;
use crate::SlotSet;

pub(crate) const WORD_BITS: usize = u64::BITS as usize;
pub(crate) const INLINE_WORDS: usize = 2;

/// Number of slots a bitmap can track without allocating.
pub const INLINE_SLOTS: usize = INLINE_WORDS * WORD_BITS;

/// Result of marking a slot as dirty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkOutcome {
    /// The slot was clean and is now dirty.
    Marked,

    /// The slot was already dirty, and has not been drained since.
    AlreadyPending,

    /// The slot index is not addressable with the current slot count. Nothing was marked.
    OutOfRange,
}

/// Returns the mask of addressable bits in the word at `word_idx`, for a bitmap of `num_slots` slots.
pub(crate) fn word_mask(word_idx: usize, num_slots: usize) -> u64 {
    let first_slot = word_idx * WORD_BITS;
    match num_slots.saturating_sub(first_slot) {
        0 => 0,
        valid if valid >= WORD_BITS => u64::MAX,
        valid => (1u64 << valid) - 1,
    }
}

enum Storage {
    Inline([AtomicU64; INLINE_WORDS]),
    Heap(Box<[AtomicU64]>),
}

impl Storage {
    fn with_words(num_words: usize) -> Self {
        if num_words <= INLINE_WORDS {
            Storage::Inline(std::array::from_fn(|_| AtomicU64::new(0)))
        } else {
            Storage::Heap((0..num_words).map(|_| AtomicU64::new(0)).collect())
        }
    }

    #[inline]
    fn words(&self) -> &[AtomicU64] {
        match self {
            Storage::Inline(words) => &words[..],
            Storage::Heap(words) => words,
        }
    }
}

/// A set of dirty slots for a single notification channel.
///
/// Slots are marked from the producer side and drained from the consumer side, concurrently, with each 64-slot word
/// being a single atomic. Marking is a single `fetch_or`, and draining swaps every word with zero, so a mark is always
/// observed either by the drain it races with or by the next one.
///
/// Up to [`INLINE_SLOTS`] slots are stored inline. Only [`resize`][Self::resize] ever allocates, and only when growing
/// past that threshold.
pub struct SlotBitmap {
    storage: Storage,
    num_slots: usize,
}

impl SlotBitmap {
    /// Creates an empty bitmap with no addressable slots.
    pub fn new() -> Self {
        Self::with_num_slots(0)
    }

    /// Creates an empty bitmap with the given number of addressable slots.
    pub fn with_num_slots(num_slots: usize) -> Self {
        Self {
            storage: Storage::with_words(num_slots.div_ceil(WORD_BITS)),
            num_slots,
        }
    }

    /// Returns the number of addressable slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Returns `true` if the bitmap is currently stored inline.
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, Storage::Inline(_))
    }

    /// Marks the given slot as dirty.
    ///
    /// Never blocks and never allocates.
    #[inline]
    pub fn mark(&self, index: usize) -> MarkOutcome {
        if index >= self.num_slots {
            return MarkOutcome::OutOfRange;
        }

        let bit = 1u64 << (index % WORD_BITS);
        let previous = self.storage.words()[index / WORD_BITS].fetch_or(bit, AcqRel);
        if previous & bit == 0 {
            MarkOutcome::Marked
        } else {
            MarkOutcome::AlreadyPending
        }
    }

    /// Returns `true` if any slot is dirty.
    pub fn any_set(&self) -> bool {
        self.storage.words().iter().any(|word| word.load(Acquire) != 0)
    }

    /// Drains the bitmap, returning every slot that was dirty and leaving all of them clean.
    ///
    /// Only one caller may drain a given bitmap at a time, but marks may happen concurrently.
    pub fn consume_and_clear(&self) -> SlotSet {
        let words = self
            .storage
            .words()
            .iter()
            .map(|word| word.swap(0, AcqRel))
            .collect::<SmallVec<[u64; INLINE_WORDS]>>();

        SlotSet::from_words(words, self.num_slots)
    }

    /// Clears every slot without reporting them.
    pub fn clear(&self) {
        for word in self.storage.words() {
            word.store(0, Release);
        }
    }

    /// Changes the number of addressable slots.
    ///
    /// Dirty slots below the new count are kept. Dirty slots at or beyond it are dropped, and will not reappear if the
    /// bitmap is later grown again.
    pub fn resize(&mut self, num_slots: usize) {
        let num_words = num_slots.div_ceil(WORD_BITS);
        let storage = Storage::with_words(num_words);

        // Inline storage always has `INLINE_WORDS` words, so only the words backing addressable slots are copied. The
        // rest stay zero. We have exclusive access, so nothing can be marking while we copy.
        let old_words = self.storage.words();
        for (index, new_word) in storage.words().iter().take(num_words).enumerate() {
            let value = old_words.get(index).map_or(0, |old_word| old_word.load(Relaxed));
            new_word.store(value & word_mask(index, num_slots), Relaxed);
        }

        self.storage = storage;
        self.num_slots = num_slots;
    }
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}
