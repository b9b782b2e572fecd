// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity bitmap with per-word atomic updates.
//!
//! Backs both the tag pools and the per-hardware-queue pending map.  No
//! operation takes a lock: allocation is a test-and-set on a single word, and
//! scans read each word once.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const WORD_BITS: usize = u64::BITS as usize;

pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}
impl AtomicBitmap {
    pub fn new(bits: usize) -> Self {
        let nwords = ((bits + WORD_BITS - 1) / WORD_BITS).max(1);
        let words = (0..nwords).map(|_| AtomicU64::new(0)).collect();
        Self { words, bits }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn nwords(&self) -> usize {
        self.words.len()
    }

    #[inline]
    fn locate(&self, idx: usize) -> (&AtomicU64, u64) {
        assert!(idx < self.bits, "bit {idx} out of range {}", self.bits);
        (&self.words[idx / WORD_BITS], 1u64 << (idx % WORD_BITS))
    }

    /// Set bit `idx`, returning its prior value
    pub fn set(&self, idx: usize) -> bool {
        let (word, mask) = self.locate(idx);
        word.fetch_or(mask, Ordering::SeqCst) & mask != 0
    }

    /// Clear bit `idx`, returning its prior value
    pub fn clear(&self, idx: usize) -> bool {
        let (word, mask) = self.locate(idx);
        word.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    pub fn test(&self, idx: usize) -> bool {
        let (word, mask) = self.locate(idx);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Find a clear bit within `range`, set it, and return its index.
    ///
    /// The scan begins at `hint` (when it falls inside `range`) and wraps
    /// around to the start of the range, so callers rotating the hint spread
    /// their contention across words.
    pub fn find_and_set(
        &self,
        range: Range<usize>,
        hint: usize,
    ) -> Option<usize> {
        let range = range.start..range.end.min(self.bits);
        if range.is_empty() {
            return None;
        }
        let hint = if range.contains(&hint) { hint } else { range.start };
        self.scan_and_set(hint, range.end)
            .or_else(|| self.scan_and_set(range.start, hint))
    }

    fn scan_and_set(&self, lo: usize, hi: usize) -> Option<usize> {
        let mut pos = lo;
        while pos < hi {
            let widx = pos / WORD_BITS;
            let base = widx * WORD_BITS;
            let end = hi.min(base + WORD_BITS);
            let mask = span_mask(pos - base, end - base);
            let word = &self.words[widx];

            // Ordered against waiter registration in the tag pool
            let mut cur = word.load(Ordering::SeqCst);
            loop {
                let free = !cur & mask;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                let bmask = 1u64 << bit;
                let prev = word.fetch_or(bmask, Ordering::SeqCst);
                if prev & bmask == 0 {
                    return Some(base + bit);
                }
                // Lost the race for that bit; retry against the fresh value
                cur = prev;
            }
            pos = end;
        }
        None
    }

    /// Is any bit within `range` set?
    pub fn any_in(&self, range: Range<usize>) -> bool {
        self.count_in(range) != 0
    }

    pub fn count_in(&self, range: Range<usize>) -> usize {
        let range = range.start..range.end.min(self.bits);
        let mut pos = range.start;
        let mut count = 0;
        while pos < range.end {
            let widx = pos / WORD_BITS;
            let base = widx * WORD_BITS;
            let end = range.end.min(base + WORD_BITS);
            let mask = span_mask(pos - base, end - base);
            count +=
                (self.words[widx].load(Ordering::Acquire) & mask).count_ones()
                    as usize;
            pos = end;
        }
        count
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
    }

    /// Iterate over set bits.
    ///
    /// Each word is sampled once; bits set or cleared concurrently with the
    /// iteration may or may not be observed.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter_set_from(0)
    }

    /// Iterate over set bits starting at `start`, wrapping around once.
    pub fn iter_set_from(
        &self,
        start: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        let start = if start < self.bits { start } else { 0 };
        let nwords = self.words.len();
        let first = start / WORD_BITS;
        // The starting word is visited twice: its upper part first, its
        // lower part on the wrap.
        (0..=nwords).flat_map(move |n| {
            let widx = (first + n) % nwords;
            let base = widx * WORD_BITS;
            let mut val = self.words[widx].load(Ordering::Acquire);
            if n == 0 {
                val &= !0u64 << (start - base);
            } else if n == nwords {
                val &= span_mask(0, start - base);
            }
            let bits = self.bits;
            BitIter(val).map(move |b| base + b).filter(move |&b| b < bits)
        })
    }
}

/// Mask with bits `lo..hi` set (within a single word)
#[inline]
fn span_mask(lo: usize, hi: usize) -> u64 {
    debug_assert!(lo <= hi && hi <= WORD_BITS);
    if lo == hi {
        return 0;
    }
    let upper = if hi == WORD_BITS { !0u64 } else { (1u64 << hi) - 1 };
    upper & (!0u64 << lo)
}

struct BitIter(u64);
impl Iterator for BitIter {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros() as usize;
        self.0 &= !(1u64 << bit);
        Some(bit)
    }
}
