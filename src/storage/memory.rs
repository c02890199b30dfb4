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

//! Storage backed by an indefinitely growing array of in-memory page buffers. Used for
//! transient/test WALs and as the default backing store for `SnapshotStorage`'s own page
//! buffers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::endpoint::{Endpoint, EndpointExt, MemEndpoint, PageBuf};
use crate::error::{Result, WalError};
use crate::storage::{page_location, Storage, PAGE_SIZE};

pub struct InMemoryStore {
    pages: Mutex<Vec<Option<PageBuf>>>,
    high_water: Arc<AtomicU64>,
    closed: AtomicBool,
    writable: bool,
}

impl InMemoryStore {
    pub fn new(writable: bool) -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            high_water: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            writable,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::BadState("storage is closed".into()));
        }
        Ok(())
    }
}

/// CAS-loop raise of `mark` to `candidate`, never lowering it. Shared by every writer path that
/// needs to extend the store's logical length.
fn bump_high_water(mark: &AtomicU64, candidate: u64) {
    loop {
        let current = mark.load(Ordering::SeqCst);
        if candidate <= current {
            return;
        }
        if mark
            .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

/// Wraps `MemEndpoint` to additionally bump the storage's high-water mark on every write; this
/// is the only back-reference a page has to its owning storage.
struct TrackedEndpoint {
    inner: MemEndpoint,
    store: Arc<AtomicU64>,
}

impl Endpoint for TrackedEndpoint {
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
        bump_high_water(&self.store, index + data.len() as u64);
        Ok(())
    }

    fn on_release(&mut self) {
        self.inner.on_release();
    }
}

impl Storage for InMemoryStore {
    fn size(&self) -> u64 {
        self.high_water.load(Ordering::SeqCst)
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> Result<()> {
        self.check_open()
    }

    fn cut(&self, from: u64, to: u64) -> Result<bool> {
        self.check_open()?;
        if from > to {
            return Err(WalError::OutOfRange(format!(
                "cut: from {from} > to {to}"
            )));
        }
        if from == to {
            return Ok(false);
        }
        let mut changed = false;
        let mut pages = self.pages.lock().unwrap();
        let first_page = (from / PAGE_SIZE) as usize;
        let size = self.size();
        let last_index = to.min(size).saturating_sub(1);
        let last_page = if to <= from { first_page } else { (last_index / PAGE_SIZE) as usize };
        for page_idx in first_page..=last_page.max(first_page) {
            if page_idx >= pages.len() {
                break;
            }
            let Some(buf) = pages[page_idx].as_ref() else {
                continue;
            };
            let page_base = page_idx as u64 * PAGE_SIZE;
            let zero_from = from.max(page_base) - page_base;
            let zero_to = to.min(page_base + PAGE_SIZE).min(size) - page_base;
            if zero_from < zero_to {
                let mut guard = buf.lock().unwrap();
                for b in &mut guard[zero_from as usize..zero_to as usize] {
                    *b = 0;
                }
                changed = true;
            }
        }
        if to >= size {
            self.high_water.store(from, Ordering::SeqCst);
            changed = changed || from < size;
        }
        Ok(changed)
    }

    fn acquire_endpoint_at(&self, index: u64) -> Result<Box<dyn Endpoint>> {
        self.check_open()?;
        let location = page_location(index);
        let page_idx = (location / PAGE_SIZE) as usize;
        let mut pages = self.pages.lock().unwrap();
        if pages.len() <= page_idx {
            let mut new_len = pages.len().max(1);
            while new_len <= page_idx {
                new_len *= 2;
            }
            pages.resize_with(new_len, || None);
        }
        let buf = pages[page_idx]
            .get_or_insert_with(|| Arc::new(Mutex::new(vec![0u8; PAGE_SIZE as usize])))
            .clone();
        drop(pages);
        let inner = MemEndpoint::new(location, buf, self.writable);
        Ok(Box::new(TrackedEndpoint {
            inner,
            store: self.high_water.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
