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

//! A cursor over a contiguous window `[location, location+length)` of a `Storage`. Holds at
//! most one `Endpoint` checked out at a time and releases it on `close` or when a seek moves
//! the cursor outside the endpoint's own range.

use std::sync::Arc;

use crate::codec::ByteCodec;
use crate::endpoint::{Endpoint, EndpointExt};
use crate::error::{Result, WalError};
use crate::storage::Storage;

pub struct Access {
    storage: Arc<dyn Storage>,
    location: u64,
    length: u64,
    writable: bool,
    index: u64,
    endpoint: Option<Box<dyn Endpoint>>,
}

impl Access {
    pub fn new(storage: Arc<dyn Storage>, location: u64, length: u64, writable: bool) -> Self {
        Self {
            storage,
            location,
            length,
            writable: writable && storage_writable(&storage),
            index: location,
            endpoint: None,
        }
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.index
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    fn window_end(&self) -> u64 {
        self.location + self.length
    }

    fn check_in_window(&self, at: u64, len: u64) -> Result<()> {
        let end = at.checked_add(len).ok_or_else(|| {
            WalError::OutOfRange(format!("index {at} + length {len} overflows"))
        })?;
        if at < self.location || end > self.window_end() {
            return Err(WalError::OutOfRange(format!(
                "[{at}, {end}) outside access window [{lo}, {hi})",
                lo = self.location,
                hi = self.window_end()
            )));
        }
        Ok(())
    }

    pub fn seek(&mut self, at: u64) -> Result<()> {
        self.check_in_window(at, 0)?;
        if let Some(ep) = &self.endpoint {
            if !ep.covers(at) {
                self.release_endpoint();
            }
        }
        self.index = at;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.seek(self.location)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.seek(self.index + n)
    }

    fn release_endpoint(&mut self) {
        if let Some(ep) = self.endpoint.take() {
            self.storage.release_endpoint(ep);
        }
    }

    /// Ensure the current endpoint covers `[at, at+len)`, acquiring a fresh one (releasing any
    /// stale one first) if needed.
    fn ensure_endpoint(&mut self, at: u64, len: u64) -> Result<()> {
        let needs_fresh = match &self.endpoint {
            Some(ep) => !(ep.covers(at) && at + len <= ep.upper_bound()),
            None => true,
        };
        if needs_fresh {
            self.release_endpoint();
            self.endpoint = Some(self.storage.acquire_endpoint_at(at)?);
        }
        Ok(())
    }

    pub fn disjoint(&self, other: &Access) -> bool {
        self.window_end() <= other.location || other.window_end() <= self.location
    }

    /// Typed read. If the primitive straddles an endpoint boundary, falls back to a
    /// byte-by-byte crossing read and recomposes big-endian, matching `read_bytes`.
    pub fn read_t<T: ByteCodec>(&mut self) -> Result<T> {
        self.check_in_window(self.index, T::SIZE as u64)?;
        self.ensure_endpoint(self.index, T::SIZE as u64)?;
        let ep = self.endpoint.as_ref().unwrap();
        if self.index + T::SIZE as u64 <= ep.upper_bound() {
            let value = ep.read::<T>(self.index)?;
            self.index += T::SIZE as u64;
            return Ok(value);
        }
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf[..T::SIZE])?;
        Ok(T::decode(&buf))
    }

    /// Typed write. If the primitive straddles an endpoint boundary, falls back to a
    /// byte-by-byte crossing write, matching `write_bytes`.
    pub fn write_t<T: ByteCodec>(&mut self, value: T) -> Result<()> {
        if !self.writable {
            return Err(WalError::BadState("access is not writable".into()));
        }
        self.check_in_window(self.index, T::SIZE as u64)?;
        self.ensure_endpoint(self.index, T::SIZE as u64)?;
        let ep = self.endpoint.as_ref().unwrap();
        if self.index + T::SIZE as u64 <= ep.upper_bound() {
            self.endpoint.as_mut().unwrap().write::<T>(self.index, value)?;
            self.index += T::SIZE as u64;
            return Ok(());
        }
        let mut buf = [0u8; 8];
        value.encode(&mut buf[..T::SIZE]);
        self.write_bytes(&buf[..T::SIZE])
    }

    /// Read `buf.len()` bytes, crossing endpoint (but not window) boundaries as needed.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_in_window(self.index, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            self.ensure_endpoint(self.index, 1)?;
            let ep = self.endpoint.as_ref().unwrap();
            let chunk = ((ep.upper_bound() - self.index) as usize).min(buf.len() - done);
            ep.read_bytes(self.index, &mut buf[done..done + chunk])?;
            self.index += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Write `buf`, crossing endpoint boundaries as needed.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WalError::BadState("access is not writable".into()));
        }
        self.check_in_window(self.index, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            self.ensure_endpoint(self.index, 1)?;
            let ep = self.endpoint.as_mut().unwrap();
            let chunk = ((ep.upper_bound() - self.index) as usize).min(buf.len() - done);
            ep.write_bytes(self.index, &buf[done..done + chunk])?;
            self.index += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.release_endpoint();
    }
}

impl Drop for Access {
    fn drop(&mut self) {
        self.close();
    }
}

fn storage_writable(storage: &Arc<dyn Storage>) -> bool {
    storage.writable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::PAGE_SIZE;

    fn mem() -> Arc<dyn Storage> {
        Arc::new(InMemoryStore::new(true))
    }

    #[test]
    fn typed_read_write_round_trips() {
        let s = mem();
        let mut a = Access::new(s, 0, PAGE_SIZE, true);
        a.write_t::<u32>(0xDEADBEEF).unwrap();
        a.reset().unwrap();
        assert_eq!(a.read_t::<u32>().unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn out_of_window_rejected() {
        let s = mem();
        let mut a = Access::new(s, 0, 16, true);
        a.seek(12).unwrap();
        assert!(a.write_t::<u64>(1).is_err());
    }

    #[test]
    fn byte_writes_cross_endpoint_boundary() {
        let s = mem();
        let mut a = Access::new(s, 0, PAGE_SIZE * 2, true);
        a.seek(PAGE_SIZE - 2).unwrap();
        a.write_bytes(&[1, 2, 3, 4]).unwrap();
        a.seek(PAGE_SIZE - 2).unwrap();
        let mut out = [0u8; 4];
        a.read_bytes(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn typed_write_straddling_page_boundary_round_trips() {
        let s = mem();
        let mut a = Access::new(s, 0, PAGE_SIZE * 2, true);
        a.seek(PAGE_SIZE - 3).unwrap();
        a.write_t::<u64>(0x0102030405060708).unwrap();
        a.seek(PAGE_SIZE - 3).unwrap();
        assert_eq!(a.read_t::<u64>().unwrap(), 0x0102030405060708);
    }

    #[test]
    fn disjoint_detects_overlap() {
        let s = mem();
        let a = Access::new(s.clone(), 0, 16, true);
        let b = Access::new(s.clone(), 8, 16, true);
        let c = Access::new(s, 16, 16, true);
        assert!(!a.disjoint(&b));
        assert!(a.disjoint(&c));
    }
}
