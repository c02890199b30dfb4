// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! `Edit`, `PageEdits`, and `WalPage`: the in-memory shape of one page's accumulated writes
//! within a single transaction.

use crate::storage::PAGE_SIZE;

/// A contiguous byte range written within a page, plus the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub offset: u32,
    pub length: u32,
    pub bytes: Vec<u8>,
}

impl Edit {
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    fn overlaps_or_touches(&self, other_offset: u32, other_length: u32) -> bool {
        let other_end = other_offset + other_length;
        self.offset <= other_end && other_offset <= self.end()
    }
}

/// An ordered, gap-separated, non-overlapping set of `Edit`s within one page.
#[derive(Debug, Clone, Default)]
pub struct PageEdits {
    edits: Vec<Edit>,
}

impl PageEdits {
    pub fn new() -> Self {
        Self { edits: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edit> {
        self.edits.iter()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Insert `[offset, offset+bytes.len())`, merging with any edit it overlaps or touches and
    /// re-coalescing the run so the gap invariant (`edits[i].end() < edits[i+1].offset`) holds.
    pub fn add_edit(&mut self, offset: u32, bytes: &[u8]) {
        let mut merged_offset = offset;
        let mut merged_bytes = bytes.to_vec();

        let mut i = 0;
        while i < self.edits.len() {
            if self.edits[i].overlaps_or_touches(merged_offset, merged_bytes.len() as u32) {
                let existing = self.edits.remove(i);
                let new_offset = merged_offset.min(existing.offset);
                let new_end = (merged_offset + merged_bytes.len() as u32).max(existing.end());
                let mut combined = vec![0u8; (new_end - new_offset) as usize];
                let existing_start = (existing.offset - new_offset) as usize;
                combined[existing_start..existing_start + existing.bytes.len()]
                    .copy_from_slice(&existing.bytes);
                let new_start = (merged_offset - new_offset) as usize;
                combined[new_start..new_start + merged_bytes.len()].copy_from_slice(&merged_bytes);
                merged_offset = new_offset;
                merged_bytes = combined;
                // Restart the scan: the merged range may now touch a neighbor on either side.
                i = 0;
                continue;
            }
            i += 1;
        }
        let insert_at = self
            .edits
            .iter()
            .position(|e| e.offset > merged_offset)
            .unwrap_or(self.edits.len());
        self.edits.insert(
            insert_at,
            Edit {
                offset: merged_offset,
                length: merged_bytes.len() as u32,
                bytes: merged_bytes,
            },
        );
    }

    /// True iff any edit in `self` overlaps any edit in `other`.
    pub fn intersects(&self, other: &PageEdits) -> bool {
        let mut i = 0;
        let mut j = 0;
        while i < self.edits.len() && j < other.edits.len() {
            let a = &self.edits[i];
            let b = &other.edits[j];
            if a.end() <= b.offset {
                i += 1;
            } else if b.end() <= a.offset {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for pair in self.edits.windows(2) {
            assert!(pair[0].end() < pair[1].offset, "gap invariant violated");
        }
        for e in &self.edits {
            assert_eq!(e.length as usize, e.bytes.len());
            assert!(e.end() as u64 <= PAGE_SIZE);
        }
    }
}

/// A cached page view plus its accumulated `PageEdits`, owned by a single transaction for the
/// transaction's lifetime.
pub struct WalPage {
    pub location: u64,
    pub buffer: Vec<u8>,
    pub edits: PageEdits,
    pub dirty: bool,
}

impl WalPage {
    pub fn new(location: u64) -> Self {
        Self {
            location,
            buffer: vec![0u8; PAGE_SIZE as usize],
            edits: PageEdits::new(),
            dirty: false,
        }
    }

    pub fn reset_for(&mut self, location: u64) {
        self.location = location;
        self.buffer.fill(0);
        self.edits = PageEdits::new();
        self.dirty = false;
    }

    /// Overwrite `[offset, offset+data.len())` in the page buffer and record the edit.
    pub fn write(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.edits.add_edit(offset, data);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_edit_merges_overlap_and_keeps_gap_invariant() {
        let mut edits = PageEdits::new();
        edits.add_edit(0, &[1, 2, 3, 4]);
        edits.add_edit(2, &[9, 9, 9, 9]);
        edits.assert_invariants();
        assert_eq!(edits.len(), 1);
        let only = edits.iter().next().unwrap();
        assert_eq!(only.offset, 0);
        assert_eq!(only.bytes, vec![1, 2, 9, 9, 9, 9]);
    }

    #[test]
    fn add_edit_merges_adjacent_runs() {
        let mut edits = PageEdits::new();
        edits.add_edit(0, &[1, 2]);
        edits.add_edit(2, &[3, 4]);
        edits.assert_invariants();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits.iter().next().unwrap().bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn add_edit_keeps_separate_edits_with_a_gap() {
        let mut edits = PageEdits::new();
        edits.add_edit(0, &[1]);
        edits.add_edit(10, &[2]);
        edits.assert_invariants();
        assert_eq!(edits.len(), 2);
    }

    #[test]
    fn bridging_edit_merges_three_into_one() {
        let mut edits = PageEdits::new();
        edits.add_edit(0, &[1]);
        edits.add_edit(10, &[2]);
        edits.add_edit(1, &vec![0u8; 9]);
        edits.assert_invariants();
        assert_eq!(edits.len(), 1);
    }

    #[test]
    fn intersects_is_symmetric_and_detects_overlap() {
        let mut a = PageEdits::new();
        a.add_edit(0, &[1, 2, 3, 4]);
        let mut b = PageEdits::new();
        b.add_edit(2, &[5, 6]);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));

        let mut c = PageEdits::new();
        c.add_edit(100, &[7]);
        assert!(!a.intersects(&c));
        assert!(!c.intersects(&a));
    }

    #[test]
    fn fuzz_add_edit_preserves_invariants() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let mut edits = PageEdits::new();
            for _ in 0..30 {
                let offset = rng.gen_range(0u32..PAGE_SIZE as u32 - 8);
                let len = rng.gen_range(1u32..8);
                let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                edits.add_edit(offset, &bytes);
                edits.assert_invariants();
            }
        }
    }
}
