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

//! A bounded, random-access view onto a `Storage`: a page, or a whole file for the direct
//! store. All indices are absolute within the storage's address space.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crate::codec::ByteCodec;
use crate::error::{Result, WalError};

/// A page-sized (or whole-file) shared buffer. Pages held by `InMemoryStore` and the
/// `BufferedFileStore` cache are `PageBuf`s; the WAL's own page pool wraps one per `WalPage`.
pub type PageBuf = Arc<Mutex<Vec<u8>>>;

/// A random-access read/write window over `[lower_bound, upper_bound)` of a Storage's address
/// space. Every typed accessor takes an absolute index and fails fast if it (or the primitive's
/// width) would cross `upper_bound`. `Endpoint`s are handed out as trait objects by `Storage`
/// and returned via `Storage::release_endpoint`.
pub trait Endpoint: Send {
    fn lower_bound(&self) -> u64;
    fn upper_bound(&self) -> u64;
    fn writable(&self) -> bool;

    fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()>;
    fn write_bytes(&mut self, index: u64, data: &[u8]) -> Result<()>;

    /// Hook invoked by `Storage::release_endpoint`. Most substrates are no-ops here; the
    /// buffered file store's endpoint decrements the cache slot's sharer count.
    fn on_release(&mut self) {}

    fn covers(&self, index: u64) -> bool {
        index >= self.lower_bound() && index < self.upper_bound()
    }

    fn check_range(&self, index: u64, len: u64) -> Result<()> {
        let end = index.checked_add(len).ok_or_else(|| {
            WalError::OutOfRange(format!("index {index} + length {len} overflows"))
        })?;
        if index < self.lower_bound() || end > self.upper_bound() {
            return Err(WalError::OutOfRange(format!(
                "[{index}, {end}) outside endpoint bound [{lo}, {hi})",
                lo = self.lower_bound(),
                hi = self.upper_bound()
            )));
        }
        Ok(())
    }
}

/// Typed accessors split out from `Endpoint` itself: generic methods would make `dyn Endpoint`
/// non-object-safe, so this is a separate, blanket-implemented trait. Callers holding either a
/// concrete endpoint or a `Box<dyn Endpoint>` get the same `.read::<T>()` / `.write::<T>()` call
/// syntax either way.
pub trait EndpointExt: Endpoint {
    fn read<T: ByteCodec>(&self, index: u64) -> Result<T> {
        self.check_range(index, T::SIZE as u64)?;
        let mut buf = [0u8; 8];
        self.read_bytes(index, &mut buf[..T::SIZE])?;
        Ok(T::decode(&buf))
    }

    fn write<T: ByteCodec>(&mut self, index: u64, value: T) -> Result<()> {
        if !self.writable() {
            return Err(WalError::BadState("endpoint is not writable".into()));
        }
        self.check_range(index, T::SIZE as u64)?;
        let mut buf = [0u8; 8];
        value.encode(&mut buf[..T::SIZE]);
        self.write_bytes(index, &buf[..T::SIZE])
    }
}

impl<E: Endpoint + ?Sized> EndpointExt for E {}

/// Endpoint over a single page-sized (or otherwise fixed) in-memory buffer. Used directly by
/// `InMemoryStore`, and wrapped (with a release hook) by `BufferedFileStore`.
pub struct MemEndpoint {
    base: u64,
    len: u64,
    buf: PageBuf,
    writable: bool,
    on_release: Option<Box<dyn FnMut() + Send>>,
}

impl MemEndpoint {
    pub fn new(base: u64, buf: PageBuf, writable: bool) -> Self {
        let len = buf.lock().unwrap().len() as u64;
        Self {
            base,
            len,
            buf,
            writable,
            on_release: None,
        }
    }

    pub fn with_release_hook(mut self, hook: Box<dyn FnMut() + Send>) -> Self {
        self.on_release = Some(hook);
        self
    }
}

impl Endpoint for MemEndpoint {
    fn lower_bound(&self) -> u64 {
        self.base
    }

    fn upper_bound(&self) -> u64 {
        self.base + self.len
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(index, out.len() as u64)?;
        let start = (index - self.base) as usize;
        let guard = self.buf.lock().unwrap();
        out.copy_from_slice(&guard[start..start + out.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, index: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WalError::BadState("endpoint is not writable".into()));
        }
        self.check_range(index, data.len() as u64)?;
        let start = (index - self.base) as usize;
        let mut guard = self.buf.lock().unwrap();
        guard[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn on_release(&mut self) {
        if let Some(hook) = self.on_release.as_mut() {
            hook();
        }
    }
}

/// Endpoint over a whole OS file, serialized per primitive call via a shared file handle. Used
/// by `DirectFileStore`.
pub struct FileEndpoint {
    file: Arc<Mutex<File>>,
    upper_bound: u64,
    writable: bool,
}

impl FileEndpoint {
    pub fn new(file: Arc<Mutex<File>>, upper_bound: u64, writable: bool) -> Self {
        Self {
            file,
            upper_bound,
            writable,
        }
    }
}

impl Endpoint for FileEndpoint {
    fn lower_bound(&self) -> u64 {
        0
    }

    fn upper_bound(&self) -> u64 {
        self.upper_bound
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(index, out.len() as u64)?;
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(index))?;
        // Reads past the physical end of file (but inside our logical bound) are zero-filled.
        match f.read_exact(out) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                out.fill(0);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_bytes(&mut self, index: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WalError::BadState("endpoint is not writable".into()));
        }
        self.check_range(index, data.len() as u64)?;
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(index))?;
        f.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(len: usize) -> PageBuf {
        Arc::new(Mutex::new(vec![0u8; len]))
    }

    #[test]
    fn rejects_out_of_range_reads() {
        let ep = MemEndpoint::new(0, mem(8192), true);
        assert!(ep.read::<u32>(8190).is_err());
        assert!(ep.read::<u32>(8188).is_ok());
    }

    #[test]
    fn last_byte_of_page_readable_without_crossing() {
        let mut ep = MemEndpoint::new(0, mem(8192), true);
        ep.write::<u8>(8191, 0xAB).unwrap();
        assert_eq!(ep.read::<u8>(8191).unwrap(), 0xAB);
        assert!(ep.read::<u16>(8191).is_err());
    }

    #[test]
    fn write_requires_writable() {
        let mut ro = MemEndpoint::new(0, mem(16), false);
        assert!(ro.write::<u32>(0, 1).is_err());
    }

    #[test]
    fn release_hook_runs_once() {
        let released = Arc::new(Mutex::new(0));
        let r2 = released.clone();
        let mut ep =
            MemEndpoint::new(0, mem(16), true).with_release_hook(Box::new(move || {
                *r2.lock().unwrap() += 1;
            }));
        ep.on_release();
        assert_eq!(*released.lock().unwrap(), 1);
    }
}
