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

//! Error taxonomy for the WAL core. Every fallible public entry point returns
//! `Result<T, WalError>` -- no boxed/dynamic error type crosses the public surface.

use thiserror::Error;

/// Errors produced by the paged storage substrate and the WAL core built on top of it.
#[derive(Debug, Error)]
pub enum WalError {
    /// An index or length fell outside a bound the caller is required to respect.
    #[error("index or length out of range: {0}")]
    OutOfRange(String),

    /// An argument failed a basic sanity check (negative index, zero length, ...).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The WAL, a transaction, or an access was used from the wrong place or in the wrong state.
    #[error("bad state: {0}")]
    BadState(String),

    /// A commit lost a page-intersection race against a transaction committed after our snapshot.
    #[error("concurrent write conflict with transaction {first_conflict_seq} committed at {timestamp_ms}ms")]
    ConcurrentWrite {
        /// Sequence number of the first transaction found to intersect ours.
        first_conflict_seq: u64,
        /// Its commit timestamp, milliseconds since the epoch.
        timestamp_ms: i64,
    },

    /// The log's header magic did not match on reload. Fatal: do not proceed with this log file.
    #[error("log file is corrupt: {0}")]
    CorruptLog(String),

    /// Propagated I/O failure from the backing storage or the log file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WalError>;
