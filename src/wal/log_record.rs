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

//! The on-log record shape for one transaction's committed edits, and the fixed log header.
//! Encoding follows §6 of the design exactly: everything big-endian, offsets absolute within
//! the log file.

use std::sync::Arc;

use crate::access::Access;
use crate::error::{Result, WalError};
use crate::storage::Storage;
use crate::wal::page::PageEdits;

pub const MAGIC: u64 = 0x0063_656E_2D77_616C;
pub const HEADER_SIZE: u64 = 32;

pub struct LogHeader {
    pub magic: u64,
    pub last_checkpoint_timestamp_ms: i64,
    pub indexed_transaction_count: u64,
    pub first_transaction_log_offset: u64,
}

impl LogHeader {
    pub fn empty(now_ms: i64) -> Self {
        Self {
            magic: MAGIC,
            last_checkpoint_timestamp_ms: now_ms,
            indexed_transaction_count: 0,
            first_transaction_log_offset: 0,
        }
    }

    pub fn write(&self, log: &Arc<dyn Storage>) -> Result<()> {
        let mut access = Access::new(log.clone(), 0, HEADER_SIZE, true);
        access.write_t::<u64>(self.magic)?;
        access.write_t::<i64>(self.last_checkpoint_timestamp_ms)?;
        access.write_t::<u64>(self.indexed_transaction_count)?;
        access.write_t::<u64>(self.first_transaction_log_offset)?;
        access.close();
        Ok(())
    }

    pub fn read(log: &Arc<dyn Storage>) -> Result<Self> {
        let mut access = Access::new(log.clone(), 0, HEADER_SIZE, false);
        let magic = access.read_t::<u64>()?;
        if magic != MAGIC {
            return Err(WalError::CorruptLog(format!(
                "bad magic: expected {MAGIC:#x}, found {magic:#x}"
            )));
        }
        let last_checkpoint_timestamp_ms = access.read_t::<i64>()?;
        let indexed_transaction_count = access.read_t::<u64>()?;
        let first_transaction_log_offset = access.read_t::<u64>()?;
        access.close();
        Ok(Self {
            magic,
            last_checkpoint_timestamp_ms,
            indexed_transaction_count,
            first_transaction_log_offset,
        })
    }
}

/// One touched page for one transaction: its location plus the edits recorded against it.
#[derive(Debug, Clone)]
pub struct LogPageData {
    pub location: u64,
    pub edits: PageEdits,
}

impl LogPageData {
    /// Byte length of this record's `PageRecord` encoding.
    pub fn encoded_len(&self) -> u64 {
        // location(8) + editCount(4) + per-edit (offset 4 + length 4 + bytes)
        8 + 4
            + self
                .edits
                .iter()
                .map(|e| 4 + 4 + e.bytes.len() as u64)
                .sum::<u64>()
    }
}

/// One committed transaction's full set of page edits, as it will be (or was) written to the
/// log. `log_location` is set once the record has actually been placed in the log file.
#[derive(Debug, Clone)]
pub struct LogTransactionData {
    pub sequence_number: u64,
    pub timestamp_ms: i64,
    pub pages: Vec<LogPageData>,
    pub log_location: Option<u64>,
}

impl LogTransactionData {
    pub fn new(sequence_number: u64, timestamp_ms: i64, pages: Vec<LogPageData>) -> Self {
        let mut pages = pages;
        pages.sort_by_key(|p| p.location);
        Self {
            sequence_number,
            timestamp_ms,
            pages,
            log_location: None,
        }
    }

    pub fn encoded_len(&self) -> u64 {
        8 + 8 + 4 + self.pages.iter().map(LogPageData::encoded_len).sum::<u64>()
    }

    pub fn get_page(&self, location: u64) -> Option<&LogPageData> {
        self.pages
            .binary_search_by_key(&location, |p| p.location)
            .ok()
            .map(|idx| &self.pages[idx])
    }

    /// True iff `self` and `other` share a touched page whose edits overlap.
    pub fn intersects(&self, other: &LogTransactionData) -> bool {
        let mut i = 0;
        let mut j = 0;
        while i < self.pages.len() && j < other.pages.len() {
            let a = &self.pages[i];
            let b = &other.pages[j];
            match a.location.cmp(&b.location) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    if a.edits.intersects(&b.edits) {
                        return true;
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        false
    }

    /// Serialize at `log_location` (which must already be reserved in the log's address space)
    /// and record it on `self`.
    pub fn write_at(&mut self, log: &Arc<dyn Storage>, log_location: u64) -> Result<()> {
        let len = self.encoded_len();
        let mut access = Access::new(log.clone(), log_location, len, true);
        access.write_t::<u64>(self.sequence_number)?;
        access.write_t::<i64>(self.timestamp_ms)?;
        access.write_t::<u32>(self.pages.len() as u32)?;
        for page in &self.pages {
            access.write_t::<u64>(page.location)?;
            access.write_t::<u32>(page.edits.len() as u32)?;
            for edit in page.edits.iter() {
                access.write_t::<u32>(edit.offset)?;
                access.write_t::<u32>(edit.length)?;
                access.write_bytes(&edit.bytes)?;
            }
        }
        access.close();
        self.log_location = Some(log_location);
        Ok(())
    }

    /// Decode one record starting at `at`. Returns `None` (instead of an error) if the record
    /// would read past `log.size()` or contains an incoherent count -- the caller interprets
    /// that as a partial tail left by a crash, not a hard failure.
    pub fn try_read_at(log: &Arc<dyn Storage>, at: u64) -> Result<Option<Self>> {
        const MAX_REASONABLE_COUNT: u32 = 1 << 20;
        let size = log.size();
        if at + 8 + 8 + 4 > size {
            return Ok(None);
        }
        let mut access = Access::new(log.clone(), at, size - at, false);
        let sequence_number = access.read_t::<u64>()?;
        let timestamp_ms = access.read_t::<i64>()?;
        let page_count = access.read_t::<u32>()?;
        if page_count > MAX_REASONABLE_COUNT {
            return Ok(None);
        }
        let mut pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            if access.position() + 8 + 4 > size {
                return Ok(None);
            }
            let location = match access.read_t::<u64>() {
                Ok(v) => v,
                Err(_) => return Ok(None),
            };
            let edit_count = match access.read_t::<u32>() {
                Ok(v) => v,
                Err(_) => return Ok(None),
            };
            if edit_count > MAX_REASONABLE_COUNT {
                return Ok(None);
            }
            let mut edits = PageEdits::new();
            for _ in 0..edit_count {
                if access.position() + 4 + 4 > size {
                    return Ok(None);
                }
                let offset = match access.read_t::<u32>() {
                    Ok(v) => v,
                    Err(_) => return Ok(None),
                };
                let length = match access.read_t::<u32>() {
                    Ok(v) => v,
                    Err(_) => return Ok(None),
                };
                if length > crate::storage::PAGE_SIZE as u32 || access.position() + length as u64 > size {
                    return Ok(None);
                }
                let mut bytes = vec![0u8; length as usize];
                if access.read_bytes(&mut bytes).is_err() {
                    return Ok(None);
                }
                edits.add_edit(offset, &bytes);
            }
            pages.push(LogPageData { location, edits });
        }
        access.close();
        Ok(Some(LogTransactionData {
            sequence_number,
            timestamp_ms,
            pages,
            log_location: Some(at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;

    fn log() -> Arc<dyn Storage> {
        Arc::new(InMemoryStore::new(true))
    }

    fn sample() -> LogTransactionData {
        let mut edits_a = PageEdits::new();
        edits_a.add_edit(0, &[1, 2, 3, 4]);
        let mut edits_b = PageEdits::new();
        edits_b.add_edit(10, &[9, 9]);
        LogTransactionData::new(
            7,
            123456,
            vec![
                LogPageData { location: 8192, edits: edits_b },
                LogPageData { location: 0, edits: edits_a },
            ],
        )
    }

    #[test]
    fn header_round_trips() {
        let l = log();
        let header = LogHeader {
            magic: MAGIC,
            last_checkpoint_timestamp_ms: 42,
            indexed_transaction_count: 3,
            first_transaction_log_offset: HEADER_SIZE,
        };
        header.write(&l).unwrap();
        let read_back = LogHeader::read(&l).unwrap();
        assert_eq!(read_back.last_checkpoint_timestamp_ms, 42);
        assert_eq!(read_back.indexed_transaction_count, 3);
        assert_eq!(read_back.first_transaction_log_offset, HEADER_SIZE);
    }

    #[test]
    fn bad_magic_is_corrupt_log() {
        let l = log();
        {
            let mut a = Access::new(l.clone(), 0, 8, true);
            a.write_t::<u64>(0xBAD).unwrap();
        }
        assert!(matches!(LogHeader::read(&l), Err(WalError::CorruptLog(_))));
    }

    #[test]
    fn transaction_record_round_trips() {
        let l = log();
        let mut record = sample();
        let len = record.encoded_len();
        record.write_at(&l, HEADER_SIZE).unwrap();
        assert_eq!(l.size(), HEADER_SIZE + len);
        let decoded = LogTransactionData::try_read_at(&l, HEADER_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.sequence_number, 7);
        assert_eq!(decoded.timestamp_ms, 123456);
        assert_eq!(decoded.pages.len(), 2);
        assert_eq!(decoded.pages[0].location, 0);
        assert_eq!(decoded.pages[1].location, 8192);
    }

    #[test]
    fn truncated_tail_decodes_to_none() {
        let l = log();
        let mut record = sample();
        record.write_at(&l, HEADER_SIZE).unwrap();
        l.cut(l.size() - 5, l.size()).unwrap();
        assert!(LogTransactionData::try_read_at(&l, HEADER_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn intersects_detects_shared_overlapping_page() {
        let a = sample();
        let mut edits = PageEdits::new();
        edits.add_edit(2, &[0xAA]);
        let b = LogTransactionData::new(8, 1, vec![LogPageData { location: 0, edits }]);
        assert!(a.intersects(&b));

        let mut edits_far = PageEdits::new();
        edits_far.add_edit(4000, &[0xBB]);
        let c = LogTransactionData::new(9, 1, vec![LogPageData { location: 0, edits: edits_far }]);
        assert!(!a.intersects(&c));
    }
}
