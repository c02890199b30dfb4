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

//! A write-ahead logged, snapshot-isolated paged storage core.
//!
//! The address space is a flat, growable byte space divided into fixed-size pages
//! ([`storage::PAGE_SIZE`]) behind a [`storage::Storage`] implementation of your choice
//! (in-memory, a single direct file, a cached buffered file, or a file split across parts).
//! [`wal::Wal`] sits in front of a data `Storage` and a log `Storage`, handing out
//! [`transaction::Transaction`]s that see a consistent snapshot of committed history and
//! conflict at commit time against anything committed since.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pagewal::storage::memory::InMemoryStore;
//! use pagewal::storage::Storage;
//! use pagewal::wal::{Wal, WalConfig};
//!
//! # fn main() -> pagewal::error::Result<()> {
//! let data: Arc<dyn Storage> = Arc::new(InMemoryStore::new(true));
//! let log: Arc<dyn Storage> = Arc::new(InMemoryStore::new(true));
//! let wal = Wal::open(data, log, WalConfig::default())?;
//!
//! let mut tx = wal.begin(true, false)?;
//! let mut access = tx.access(0, 8, true)?;
//! access.write_t::<u64>(42)?;
//! drop(access);
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod storage;
pub mod transaction;
pub mod wal;

pub use access::Access;
pub use codec::ByteCodec;
pub use endpoint::{Endpoint, EndpointExt};
pub use error::{Result, WalError};
pub use storage::Storage;
pub use transaction::{Transaction, TxState};
pub use wal::{Wal, WalConfig};
