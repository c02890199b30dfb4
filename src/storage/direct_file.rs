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

//! Storage backed by a single OS file, serialized per primitive call through a shared file
//! handle. No paging or caching -- used for the log file and for small stores where a page
//! cache would be overkill.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::endpoint::{Endpoint, EndpointExt, FileEndpoint};
use crate::error::{Result, WalError};
use crate::storage::Storage;

pub struct DirectFileStore {
    file: Arc<Mutex<File>>,
    size: Arc<AtomicU64>,
    closed: AtomicBool,
    writable: bool,
}

impl DirectFileStore {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            size: Arc::new(AtomicU64::new(size)),
            closed: AtomicBool::new(false),
            writable,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::BadState("storage is closed".into()));
        }
        Ok(())
    }
}

/// Tracks the high-water mark for the underlying file, sharing the store's own `size` counter
/// (mirrors `TrackedEndpoint` in `storage::memory`, which shares `high_water` the same way).
struct TrackedFileEndpoint {
    inner: FileEndpoint,
    size: Arc<AtomicU64>,
}

impl Endpoint for TrackedFileEndpoint {
    fn lower_bound(&self) -> u64 {
        self.inner.lower_bound()
    }
    fn upper_bound(&self) -> u64 {
        self.inner.upper_bound()
    }
    fn writable(&self) -> bool {
        self.inner.writable()
    }
    fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()> {
        self.inner.read_bytes(index, out)
    }
    fn write_bytes(&mut self, index: u64, data: &[u8]) -> Result<()> {
        self.inner.write_bytes(index, data)?;
        let end = index + data.len() as u64;
        loop {
            let current = self.size.load(Ordering::SeqCst);
            if end <= current {
                break;
            }
            if self
                .size
                .compare_exchange(current, end, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        Ok(())
    }
}

impl Storage for DirectFileStore {
    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }

    fn cut(&self, from: u64, to: u64) -> Result<bool> {
        self.check_open()?;
        if from > to {
            return Err(WalError::OutOfRange(format!("cut: from {from} > to {to}")));
        }
        if from == to {
            return Ok(false);
        }
        let size = self.size();
        let mut f = self.file.lock().unwrap();
        if to >= size {
            if from >= size {
                return Ok(false);
            }
            f.set_len(from)?;
            drop(f);
            self.size.store(from, Ordering::SeqCst);
            return Ok(true);
        }
        let zero_len = (to - from) as usize;
        let zeros = vec![0u8; zero_len];
        f.seek(SeekFrom::Start(from))?;
        f.write_all(&zeros)?;
        Ok(true)
    }

    fn acquire_endpoint_at(&self, index: u64) -> Result<Box<dyn Endpoint>> {
        self.check_open()?;
        // The whole file is one unbounded (practically) endpoint; `upper_bound` is a generous
        // sentinel since DirectFileStore does not page its address space.
        let inner = FileEndpoint::new(self.file.clone(), u64::MAX / 2, self.writable);
        let _ = index;
        Ok(Box::new(TrackedFileEndpoint {
            inner,
            size: self.size.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn fresh_file_is_empty() {
        let tmp = NamedTempFile::new().unwrap();
        let store = DirectFileStore::open(tmp.path(), true).unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn write_then_flush_then_reopen_reads_back() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = DirectFileStore::open(tmp.path(), true).unwrap();
            let mut ep = store.acquire_endpoint_at(0).unwrap();
            ep.write::<u64>(0, 0xDEAD_BEEF_CAFE_F00D).unwrap();
            store.release_endpoint(ep);
            store.flush().unwrap();
        }
        let store = DirectFileStore::open(tmp.path(), true).unwrap();
        let ep = store.acquire_endpoint_at(0).unwrap();
        assert_eq!(ep.read::<u64>(0).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
    }
}
