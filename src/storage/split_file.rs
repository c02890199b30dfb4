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

//! Storage spanning a directory of fixed-max-size part files, `prefix + NNNN + suffix`. Each
//! part is itself a `DirectFileStore`; this type only routes indices to the owning part and
//! clamps endpoint bounds at the part boundary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::endpoint::Endpoint;
use crate::error::{Result, WalError};
use crate::storage::direct_file::DirectFileStore;
use crate::storage::Storage;

const MAX_MISSING: u32 = 15;

pub struct SplitFileStore {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    max_part_length: u64,
    parts: RwLock<Vec<Option<Arc<dyn Storage>>>>,
    factory: Arc<dyn PartFactory>,
    closed: AtomicBool,
    writable: bool,
}

fn part_name(prefix: &str, index: usize, suffix: &str) -> String {
    format!("{prefix}{index:04}{suffix}")
}

impl SplitFileStore {
    /// Probe `dir` for existing parts named `prefix + NNNN + suffix`, stopping after
    /// `MAX_MISSING` consecutive gaps. Opens no files eagerly beyond that probe. Parts are
    /// opened as plain `DirectFileStore`s; use `open_with_factory` to plug in another substrate.
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        max_part_length: u64,
        writable: bool,
    ) -> Result<Self> {
        Self::open_with_factory(
            dir,
            prefix,
            suffix,
            max_part_length,
            writable,
            Arc::new(DirectFilePartFactory),
        )
    }

    /// As `open`, but parts are opened through `factory` instead of always being a
    /// `DirectFileStore` -- embedders can substitute an in-memory or otherwise instrumented
    /// part implementation.
    pub fn open_with_factory(
        dir: impl AsRef<Path>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        max_part_length: u64,
        writable: bool,
        factory: Arc<dyn PartFactory>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let prefix = prefix.into();
        let suffix = suffix.into();
        let mut part_count = 0usize;
        let mut missing = 0u32;
        let mut probe = 0usize;
        loop {
            let path = dir.join(part_name(&prefix, probe, &suffix));
            if path.exists() {
                part_count = probe + 1;
                missing = 0;
            } else {
                missing += 1;
                if missing > MAX_MISSING {
                    break;
                }
            }
            probe += 1;
            if probe > 9999 {
                break;
            }
        }
        let mut parts = Vec::with_capacity(part_count);
        parts.resize_with(part_count, || None);
        Ok(Self {
            dir,
            prefix,
            suffix,
            max_part_length,
            parts: RwLock::new(parts),
            factory,
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

    fn part_path(&self, index: usize) -> PathBuf {
        self.dir.join(part_name(&self.prefix, index, &self.suffix))
    }

    /// Lazily open (or create, if writable) the part file for `part_index`.
    fn part(&self, part_index: usize) -> Result<Arc<dyn Storage>> {
        {
            let parts = self.parts.read().unwrap();
            if let Some(Some(p)) = parts.get(part_index) {
                return Ok(p.clone());
            }
        }
        let mut parts = self.parts.write().unwrap();
        if parts.len() <= part_index {
            parts.resize_with(part_index + 1, || None);
        }
        if let Some(p) = parts[part_index].as_ref() {
            return Ok(p.clone());
        }
        let store = self
            .factory
            .open_part(&self.part_path(part_index), self.writable)?;
        parts[part_index] = Some(store.clone());
        Ok(store)
    }

    fn part_count(&self) -> usize {
        self.parts.read().unwrap().len()
    }

    fn part_index_for(&self, index: u64) -> usize {
        (index / self.max_part_length) as usize
    }

    /// Total logical size: every full part contributes `max_part_length`, the last part
    /// contributes its own (possibly short) size.
    fn compute_size(&self) -> Result<u64> {
        let count = self.part_count();
        if count == 0 {
            return Ok(0);
        }
        let last = self.part(count - 1)?;
        Ok((count as u64 - 1) * self.max_part_length + last.size())
    }
}

/// Proxy endpoint translating a part-relative window back into the split store's global
/// address space.
struct SplitEndpoint {
    inner: Box<dyn Endpoint>,
    base: u64,
    upper_bound: u64,
}

impl Endpoint for SplitEndpoint {
    fn lower_bound(&self) -> u64 {
        self.base
    }

    fn upper_bound(&self) -> u64 {
        self.upper_bound
    }

    fn writable(&self) -> bool {
        self.inner.writable()
    }

    fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(index, out.len() as u64)?;
        self.inner.read_bytes(index - self.base, out)
    }

    fn write_bytes(&mut self, index: u64, data: &[u8]) -> Result<()> {
        self.check_range(index, data.len() as u64)?;
        self.inner.write_bytes(index - self.base, data)
    }

    fn on_release(&mut self) {
        self.inner.on_release();
    }
}

impl Storage for SplitFileStore {
    fn size(&self) -> u64 {
        self.compute_size().unwrap_or(0)
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        let parts = self.parts.read().unwrap();
        for part in parts.iter().flatten() {
            part.flush()?;
        }
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
        let mut changed = false;
        let first_part = self.part_index_for(from);
        let last_part = self.part_index_for(to.saturating_sub(1).max(from));
        for idx in first_part..=last_part {
            let part_base = idx as u64 * self.max_part_length;
            let part_end = part_base + self.max_part_length;
            let local_from = from.max(part_base) - part_base;
            let local_to = to.min(part_end) - part_base;
            if local_from >= local_to {
                continue;
            }
            if local_from == 0 && to >= part_end {
                // Whole part cut: truncate the part to zero and drop the path if it's the tail.
                let path = self.part_path(idx);
                let mut parts = self.parts.write().unwrap();
                if idx < parts.len() {
                    parts[idx] = None;
                }
                drop(parts);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    changed = true;
                }
                continue;
            }
            let part = self.part(idx)?;
            if part.cut(local_from, local_to)? {
                changed = true;
            }
        }
        if to >= self.size() {
            let mut parts = self.parts.write().unwrap();
            while parts.last().map(|p| p.is_none()).unwrap_or(false)
                && parts.len() > first_part
            {
                parts.pop();
            }
        }
        Ok(changed)
    }

    fn acquire_endpoint_at(&self, index: u64) -> Result<Box<dyn Endpoint>> {
        self.check_open()?;
        let part_index = self.part_index_for(index);
        let part_base = part_index as u64 * self.max_part_length;
        let local_index = index - part_base;
        let part = self.part(part_index)?;
        let inner = part.acquire_endpoint_at(local_index)?;
        let upper_bound = part_base + self.max_part_length;
        Ok(Box::new(SplitEndpoint {
            inner,
            base: part_base,
            upper_bound,
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let parts = self.parts.read().unwrap();
        for part in parts.iter().flatten() {
            part.close()?;
        }
        Ok(())
    }
}

/// Opens a single part. `open` uses `DirectFilePartFactory`; `open_with_factory` lets an
/// embedder substitute another `Storage` for the parts (e.g. an in-memory test double).
pub trait PartFactory: Send + Sync {
    fn open_part(&self, path: &Path, writable: bool) -> Result<Arc<dyn Storage>>;
}

struct DirectFilePartFactory;

impl PartFactory for DirectFilePartFactory {
    fn open_part(&self, path: &Path, writable: bool) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(DirectFileStore::open(path, writable)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointExt;
    use tempfile::tempdir;

    #[test]
    fn fresh_dir_has_no_parts() {
        let dir = tempdir().unwrap();
        let store = SplitFileStore::open(dir.path(), "part-", ".dat", 64, true).unwrap();
        assert_eq!(store.size(), 0);
    }

    struct InMemoryPartFactory;

    impl PartFactory for InMemoryPartFactory {
        fn open_part(&self, _path: &Path, writable: bool) -> Result<Arc<dyn Storage>> {
            Ok(Arc::new(crate::storage::memory::InMemoryStore::new(writable)))
        }
    }

    #[test]
    fn open_with_factory_routes_parts_through_it() {
        let dir = tempdir().unwrap();
        let store = SplitFileStore::open_with_factory(
            dir.path(),
            "part-",
            ".dat",
            64,
            true,
            Arc::new(InMemoryPartFactory),
        )
        .unwrap();
        let mut ep = store.acquire_endpoint_at(0).unwrap();
        ep.write::<u8>(0, 0x7A).unwrap();
        store.release_endpoint(ep);
        // The in-memory factory never touches the filesystem.
        assert!(!dir.path().join("part-0000.dat").exists());
        let ep = store.acquire_endpoint_at(0).unwrap();
        assert_eq!(ep.read::<u8>(0).unwrap(), 0x7A);
    }

    #[test]
    fn write_crossing_part_boundary_round_trips() {
        let dir = tempdir().unwrap();
        let store = SplitFileStore::open(dir.path(), "part-", ".dat", 64, true).unwrap();
        let mut ep = store.acquire_endpoint_at(60).unwrap();
        ep.write::<u8>(60, 0xAB).unwrap();
        store.release_endpoint(ep);
        let mut ep2 = store.acquire_endpoint_at(64).unwrap();
        ep2.write::<u8>(64, 0xCD).unwrap();
        store.release_endpoint(ep2);
        assert!(dir.path().join("part-0000.dat").exists());
        assert!(dir.path().join("part-0001.dat").exists());
        let ep = store.acquire_endpoint_at(60).unwrap();
        assert_eq!(ep.read::<u8>(60).unwrap(), 0xAB);
        let ep2 = store.acquire_endpoint_at(64).unwrap();
        assert_eq!(ep2.read::<u8>(64).unwrap(), 0xCD);
    }

    #[test]
    fn endpoint_does_not_cross_part_boundary() {
        let dir = tempdir().unwrap();
        let store = SplitFileStore::open(dir.path(), "part-", ".dat", 64, true).unwrap();
        let ep = store.acquire_endpoint_at(0).unwrap();
        assert_eq!(ep.upper_bound(), 64);
    }

    #[test]
    fn reopen_discovers_existing_parts() {
        let dir = tempdir().unwrap();
        {
            let store = SplitFileStore::open(dir.path(), "part-", ".dat", 64, true).unwrap();
            let mut ep = store.acquire_endpoint_at(200).unwrap();
            ep.write::<u8>(200, 1).unwrap();
            store.release_endpoint(ep);
        }
        let store = SplitFileStore::open(dir.path(), "part-", ".dat", 64, true).unwrap();
        assert!(store.size() >= 201);
    }
}
