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

//! Storage backed by a single file through a bounded, concurrent page cache.
//!
//! Each cache slot (`Slot`) advances through `Free -> Reserved -> Ready -> InUse(n) -> Ready`,
//! with `Reclaiming` as the exclusive state used to repurpose a `Ready` slot for a new location.
//! All transitions are CAS loops on a per-slot `AtomicU32`; there is no global lock on the hot
//! path, only a process-wide busy flag that serialises the full-cache eviction scan.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::yield_now;

use tracing::{debug, trace};

use crate::endpoint::{Endpoint, EndpointExt, MemEndpoint, PageBuf};
use crate::error::{Result, WalError};
use crate::storage::{page_location, Storage, PAGE_SIZE};

pub const MAX_LOADED_PAGES: usize = 1024;

const FREE: u32 = 0;
const RESERVED: u32 = 1;
const READY: u32 = 2;
const RECLAIMING: u32 = 3;
const IN_USE_BASE: u32 = 4;

const GLOBAL_READY: u8 = 0;
const GLOBAL_BUSY: u8 = 1;
const GLOBAL_CLOSED: u8 = 2;

const UNASSIGNED: u64 = u64::MAX;

struct Slot {
    state: AtomicU32,
    location: AtomicU64,
    last_hit: AtomicU64,
    dirty: AtomicBool,
    // Shared (not cloned) with every `SlotEndpoint` currently checked out against this slot, so
    // writes through an endpoint land directly in the cache rather than a disposable copy.
    buf: PageBuf,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(FREE),
            location: AtomicU64::new(UNASSIGNED),
            last_hit: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            buf: Arc::new(Mutex::new(vec![0u8; PAGE_SIZE as usize])),
        }
    }

    /// Free -> Reserved for `loc`. Returns true on success; also succeeds (no-op) if this slot
    /// is already Reserved/Ready for the same location.
    fn try_reserve(&self, loc: u64) -> bool {
        if self
            .state
            .compare_exchange(FREE, RESERVED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.location.store(loc, Ordering::SeqCst);
            return true;
        }
        let state = self.state.load(Ordering::SeqCst);
        (state == RESERVED || state == READY) && self.location.load(Ordering::SeqCst) == loc
    }

    fn finish_reserve(&self, hit_clock: u64) {
        self.last_hit.store(hit_clock, Ordering::SeqCst);
        self.state.store(READY, Ordering::SeqCst);
    }

    /// Ready -> InUse(1), or InUse(n) -> InUse(n+1), for the given location.
    fn try_use(&self, loc: u64, hit_clock: u64) -> bool {
        loop {
            let state = self.state.load(Ordering::SeqCst);
            if self.location.load(Ordering::SeqCst) != loc {
                return false;
            }
            let next = match state {
                READY => IN_USE_BASE,
                s if s >= IN_USE_BASE => s + 1,
                _ => return false,
            };
            if self
                .state
                .compare_exchange(state, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.last_hit.store(hit_clock, Ordering::SeqCst);
                return true;
            }
        }
    }

    /// InUse(1) -> Ready, InUse(n>1) -> InUse(n-1).
    fn release(&self) {
        loop {
            let state = self.state.load(Ordering::SeqCst);
            assert!(state >= IN_USE_BASE, "release on a non-InUse slot");
            let next = if state == IN_USE_BASE { READY } else { state - 1 };
            if self
                .state
                .compare_exchange(state, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Ready -> Reclaiming. Fails if not Ready.
    fn try_begin_reclaim(&self) -> bool {
        self.state
            .compare_exchange(READY, RECLAIMING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub struct BufferedFileStore {
    file: Arc<Mutex<File>>,
    slots: Vec<Slot>,
    block_count: std::sync::atomic::AtomicUsize,
    size: AtomicU64,
    hit_clock: AtomicU64,
    global_state: AtomicU8,
    writable: bool,
}

impl BufferedFileStore {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;
        let size = file.metadata()?.len();
        let mut slots = Vec::with_capacity(MAX_LOADED_PAGES);
        slots.resize_with(MAX_LOADED_PAGES, Slot::new);
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            slots,
            block_count: std::sync::atomic::AtomicUsize::new(0),
            size: AtomicU64::new(size),
            hit_clock: AtomicU64::new(0),
            global_state: AtomicU8::new(GLOBAL_READY),
            writable,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.global_state.load(Ordering::SeqCst) == GLOBAL_CLOSED {
            return Err(WalError::BadState("storage is closed".into()));
        }
        Ok(())
    }

    fn next_hit(&self) -> u64 {
        self.hit_clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Read bytes for `loc` from the backing file into `buf`, zero-filling the tail past EOF.
    fn load_base(&self, loc: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.size.load(Ordering::SeqCst);
        buf.fill(0);
        if loc >= size {
            return Ok(());
        }
        let readable = ((size - loc).min(PAGE_SIZE)) as usize;
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(loc))?;
        match f.read_exact(&mut buf[..readable]) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize a dirty slot's buffer to the backing file.
    fn flush_slot(&self, slot: &Slot) -> Result<()> {
        if !slot.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let loc = slot.location.load(Ordering::SeqCst);
        let guard = slot.buf.lock().unwrap();
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(loc))?;
        f.write_all(&guard)?;
        Ok(())
    }

    fn try_use_existing(&self, loc: u64) -> Option<usize> {
        let count = self.block_count.load(Ordering::SeqCst);
        let hit = self.next_hit();
        for i in 0..count {
            if self.slots[i].location.load(Ordering::SeqCst) == loc
                && self.slots[i].try_use(loc, hit)
            {
                return Some(i);
            }
        }
        None
    }

    fn try_reserve_new(&self, loc: u64) -> Option<usize> {
        let count = self.block_count.load(Ordering::SeqCst);
        if count >= MAX_LOADED_PAGES {
            return None;
        }
        let idx = count;
        if !self.slots[idx].try_reserve(loc) {
            return None;
        }
        // Only one reserver can win a slot at FREE, but multiple threads may race to bump
        // block_count for the same index; whichever wins first publishes it.
        let _ = self.block_count.compare_exchange(
            count,
            count + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let mut buf = self.slots[idx].buf.lock().unwrap();
        if self.load_base(loc, &mut buf).is_err() {
            // Best-effort: leave the slot Reserved; a later caller will retry the whole loop.
            return None;
        }
        drop(buf);
        let hit = self.next_hit();
        self.slots[idx].finish_reserve(hit);
        if self.slots[idx].try_use(loc, hit) {
            Some(idx)
        } else {
            None
        }
    }

    fn try_reclaim(&self, loc: u64) -> Option<usize> {
        if self
            .global_state
            .compare_exchange(GLOBAL_READY, GLOBAL_BUSY, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let result = (|| {
            let count = self.block_count.load(Ordering::SeqCst);
            let mut oldest: Option<(usize, u64, u64)> = None;
            for i in 0..count {
                let hit = self.slots[i].last_hit.load(Ordering::SeqCst);
                let slot_loc = self.slots[i].location.load(Ordering::SeqCst);
                if self.slots[i].state.load(Ordering::SeqCst) != READY {
                    continue;
                }
                if oldest.map(|(_, h, _)| hit < h).unwrap_or(true) {
                    oldest = Some((i, hit, slot_loc));
                }
            }
            let (idx, hit, slot_loc) = oldest?;
            // Double-check the slot didn't change under us during the scan.
            if self.slots[idx].last_hit.load(Ordering::SeqCst) != hit
                || self.slots[idx].location.load(Ordering::SeqCst) != slot_loc
            {
                return None;
            }
            if !self.slots[idx].try_begin_reclaim() {
                return None;
            }
            if self.flush_slot(&self.slots[idx]).is_err() {
                self.slots[idx].state.store(READY, Ordering::SeqCst);
                return None;
            }
            self.slots[idx].location.store(loc, Ordering::SeqCst);
            let mut buf = self.slots[idx].buf.lock().unwrap();
            if self.load_base(loc, &mut buf).is_err() {
                return None;
            }
            drop(buf);
            let new_hit = self.next_hit();
            self.slots[idx].finish_reserve(new_hit);
            if self.slots[idx].try_use(loc, new_hit) {
                Some(idx)
            } else {
                None
            }
        })();
        self.global_state.store(GLOBAL_READY, Ordering::SeqCst);
        result
    }

    fn get_block_for(&self, index: u64) -> Result<usize> {
        let loc = page_location(index);
        let mut spins = 0u32;
        loop {
            self.check_open()?;
            if let Some(idx) = self.try_use_existing(loc) {
                trace!(location = loc, slot = idx, "cache hit");
                return Ok(idx);
            }
            if let Some(idx) = self.try_reserve_new(loc) {
                trace!(location = loc, slot = idx, "cache fill");
                return Ok(idx);
            }
            if let Some(idx) = self.try_reclaim(loc) {
                debug!(location = loc, slot = idx, "cache reclaim");
                return Ok(idx);
            }
            spins += 1;
            if spins % 64 == 0 {
                yield_now();
            }
        }
    }
}

/// Endpoint over one cached slot's buffer; on release it decrements the slot's sharer count
/// instead of dropping the underlying page.
struct SlotEndpoint {
    inner: MemEndpoint,
    store: Arc<SlotHandle>,
}

struct SlotHandle {
    store: *const BufferedFileStore,
    slot: usize,
}
// Safety: callers must keep the `BufferedFileStore` pinned in place (not moved, not dropped)
// for as long as any endpoint acquired from it is outstanding -- the same requirement
// `acquire_endpoint_at`'s `&self` borrow would enforce if `Endpoint` weren't `'static`.
unsafe impl Send for SlotHandle {}
unsafe impl Sync for SlotHandle {}

impl Endpoint for SlotEndpoint {
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
        let store = unsafe { &*self.store.store };
        let slot = &store.slots[self.store.slot];
        slot.dirty.store(true, Ordering::SeqCst);
        let end = index + data.len() as u64;
        loop {
            let current = store.size.load(Ordering::SeqCst);
            if end <= current {
                break;
            }
            if store
                .size
                .compare_exchange(current, end, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        Ok(())
    }
    fn on_release(&mut self) {
        let store = unsafe { &*self.store.store };
        store.slots[self.store.slot].release();
    }
}

impl Storage for BufferedFileStore {
    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        let count = self.block_count.load(Ordering::SeqCst);
        for i in 0..count {
            if self.slots[i].state.load(Ordering::SeqCst) == READY
                && self.slots[i].try_begin_reclaim()
            {
                self.flush_slot(&self.slots[i])?;
                self.slots[i].state.store(READY, Ordering::SeqCst);
            }
        }
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
        let count = self.block_count.load(Ordering::SeqCst);
        let mut changed = false;
        for i in 0..count {
            let loc = self.slots[i].location.load(Ordering::SeqCst);
            if loc == UNASSIGNED || loc >= to || loc + PAGE_SIZE <= from {
                continue;
            }
            let zero_from = from.max(loc) - loc;
            let zero_to = to.min(loc + PAGE_SIZE).min(size) - loc;
            if zero_from < zero_to {
                let mut guard = self.slots[i].buf.lock().unwrap();
                for b in &mut guard[zero_from as usize..zero_to as usize] {
                    *b = 0;
                }
                self.slots[i].dirty.store(true, Ordering::SeqCst);
                changed = true;
            }
        }
        let mut f = self.file.lock().unwrap();
        if to >= size {
            if from < size {
                f.set_len(from)?;
                self.size.store(from, Ordering::SeqCst);
                changed = true;
            }
        } else {
            let zero_len = (to - from) as usize;
            let zeros = vec![0u8; zero_len];
            f.seek(SeekFrom::Start(from))?;
            f.write_all(&zeros)?;
            changed = true;
        }
        Ok(changed)
    }

    fn acquire_endpoint_at(&self, index: u64) -> Result<Box<dyn Endpoint>> {
        self.check_open()?;
        let loc = page_location(index);
        let slot_idx = self.get_block_for(index)?;
        let buf = self.slots[slot_idx].buf.clone();
        let inner = MemEndpoint::new(loc, buf, self.writable);
        Ok(Box::new(SlotEndpoint {
            inner,
            store: Arc::new(SlotHandle {
                store: self as *const BufferedFileStore,
                slot: slot_idx,
            }),
        }))
    }

    fn close(&self) -> Result<()> {
        self.global_state.store(GLOBAL_CLOSED, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_flush_reload_round_trips_a_page() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = BufferedFileStore::open(tmp.path(), true).unwrap();
            for i in 0..2048i32 {
                let mut ep = store.acquire_endpoint_at((i as u64) * 4).unwrap();
                ep.write::<i32>((i as u64) * 4, i).unwrap();
                store.release_endpoint(ep);
            }
            store.flush().unwrap();
            assert_eq!(store.size(), PAGE_SIZE);
        }
        let store = BufferedFileStore::open(tmp.path(), true).unwrap();
        let ep = store.acquire_endpoint_at(4092).unwrap();
        assert_eq!(ep.read::<i32>(4092).unwrap(), 1023);
    }

    #[test]
    fn cache_reclaims_under_pressure() {
        let tmp = NamedTempFile::new().unwrap();
        let store = BufferedFileStore::open(tmp.path(), true).unwrap();
        // Touch more pages than MAX_LOADED_PAGES to force at least one reclaim.
        for i in 0..(MAX_LOADED_PAGES as u64 + 4) {
            let index = i * PAGE_SIZE;
            let mut ep = store.acquire_endpoint_at(index).unwrap();
            ep.write::<u8>(index, 7).unwrap();
            store.release_endpoint(ep);
        }
        store.flush().unwrap();
    }
}
