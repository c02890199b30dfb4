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

//! The transaction lifecycle, independent of any particular backing WAL. "Inheritance" from an
//! abstract base collapses to composition here: `Transaction` holds a `Box<dyn TransactionOps>`
//! supplying `doCommit`/`access`/`onClose`, plus the shared state every transaction needs
//! regardless of backing store.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::access::Access;
use crate::error::{Result, WalError};
use crate::executor::{current, ExecutorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxState {
    Running = 0,
    Committing = 1,
    Committed = 2,
    Rejected = 3,
    Aborted = 4,
}

impl TxState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TxState::Running,
            1 => TxState::Committing,
            2 => TxState::Committed,
            3 => TxState::Rejected,
            _ => TxState::Aborted,
        }
    }
}

/// The backing-store-specific half of a transaction: committing, handing out accesses, and a
/// close hook. Implemented by the WAL core's transaction type.
pub trait TransactionOps: Send {
    fn do_commit(&mut self) -> Result<()>;
    fn do_access(&mut self, index: u64, length: u64, writable: bool) -> Result<Access>;
    fn on_close(&mut self);
}

pub struct Transaction {
    ops: Box<dyn TransactionOps>,
    state: Arc<AtomicU8>,
    writable: bool,
    autocommit: bool,
    executor: ExecutorHandle,
}

impl Transaction {
    pub fn new(ops: Box<dyn TransactionOps>, writable: bool, autocommit: bool) -> Self {
        Self {
            ops,
            state: Arc::new(AtomicU8::new(TxState::Running as u8)),
            writable,
            autocommit,
            executor: current(),
        }
    }

    /// Used by the WAL core, whose janitor needs to flip a live transaction's state to
    /// `Aborted` from another thread once its owning executor has died -- the shared `state`
    /// here is the same handle the janitor's bookkeeping holds.
    pub fn with_shared_state(
        ops: Box<dyn TransactionOps>,
        writable: bool,
        autocommit: bool,
        state: Arc<AtomicU8>,
        executor: ExecutorHandle,
    ) -> Self {
        Self {
            ops,
            state,
            writable,
            autocommit,
            executor,
        }
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: TxState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    fn check_same_executor(&self) -> Result<()> {
        let caller = current();
        if self.executor.is_alive() && caller.id() != self.executor.id() {
            return Err(WalError::BadState(
                "transaction accessed from a different executor".into(),
            ));
        }
        Ok(())
    }

    pub fn is_orphan(&self) -> bool {
        self.state() == TxState::Running && !self.executor.is_alive()
    }

    #[instrument(level = "debug", skip(self))]
    pub fn access(&mut self, index: u64, length: u64, writable: bool) -> Result<Access> {
        self.check_same_executor()?;
        if length == 0 {
            return Err(WalError::InvalidArg(format!(
                "length must be > 0, got {length}"
            )));
        }
        if self.state() != TxState::Running {
            return Err(WalError::BadState(format!(
                "access requires a Running transaction, got {:?}",
                self.state()
            )));
        }
        self.ops.do_access(index, length, self.writable && writable)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.check_same_executor()?;
        if self.state() != TxState::Running {
            return Err(WalError::BadState(format!(
                "commit requires a Running transaction, got {:?}",
                self.state()
            )));
        }
        self.set_state(TxState::Committing);
        match self.ops.do_commit() {
            Ok(()) => {
                self.set_state(TxState::Committed);
                Ok(())
            }
            Err(WalError::ConcurrentWrite {
                first_conflict_seq,
                timestamp_ms,
            }) => {
                self.set_state(TxState::Rejected);
                Err(WalError::ConcurrentWrite {
                    first_conflict_seq,
                    timestamp_ms,
                })
            }
            Err(other) => {
                self.set_state(TxState::Aborted);
                Err(other)
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub fn abort(&mut self) -> Result<()> {
        self.check_same_executor()?;
        if self.state() != TxState::Running {
            return Err(WalError::BadState(format!(
                "abort requires a Running transaction, got {:?}",
                self.state()
            )));
        }
        self.set_state(TxState::Aborted);
        Ok(())
    }

    /// Autocommits (if configured), else aborts, then always runs `onClose`. Idempotent: a
    /// second call on an already-terminal transaction is a no-op.
    pub fn close(&mut self) {
        if self.state() == TxState::Running {
            let result = if self.autocommit {
                self.commit()
            } else {
                self.abort()
            };
            if let Err(e) = result {
                warn!(error = %e, "transaction close failed to reach a terminal state cleanly");
            }
        }
        self.ops.on_close();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::PAGE_SIZE;
    use std::sync::Arc;

    struct NoopOps {
        storage: Arc<InMemoryStore>,
        committed: bool,
    }

    impl TransactionOps for NoopOps {
        fn do_commit(&mut self) -> Result<()> {
            self.committed = true;
            Ok(())
        }
        fn do_access(&mut self, index: u64, length: u64, writable: bool) -> Result<Access> {
            Ok(Access::new(self.storage.clone(), index, length, writable))
        }
        fn on_close(&mut self) {}
    }

    fn tx(writable: bool, autocommit: bool) -> Transaction {
        let ops = NoopOps {
            storage: Arc::new(InMemoryStore::new(true)),
            committed: false,
        };
        Transaction::new(Box::new(ops), writable, autocommit)
    }

    #[test]
    fn fresh_transaction_is_running() {
        let t = tx(true, false);
        assert_eq!(t.state(), TxState::Running);
    }

    #[test]
    fn commit_reaches_committed() {
        let mut t = tx(true, false);
        t.commit().unwrap();
        assert_eq!(t.state(), TxState::Committed);
    }

    #[test]
    fn double_commit_is_bad_state() {
        let mut t = tx(true, false);
        t.commit().unwrap();
        assert!(matches!(t.commit(), Err(WalError::BadState(_))));
    }

    #[test]
    fn access_narrows_writable_flag() {
        let mut t = tx(false, false);
        let a = t.access(0, PAGE_SIZE, true).unwrap();
        assert!(!a.writable());
    }

    #[test]
    fn access_rejects_zero_length() {
        let mut t = tx(true, false);
        assert!(matches!(t.access(0, 0, true), Err(WalError::InvalidArg(_))));
    }

    #[test]
    fn close_autocommits_when_configured() {
        let mut t = tx(true, true);
        t.close();
        assert_eq!(t.state(), TxState::Committed);
    }

    #[test]
    fn close_aborts_without_autocommit() {
        let mut t = tx(true, false);
        t.close();
        assert_eq!(t.state(), TxState::Aborted);
    }

    #[test]
    fn is_orphan_false_while_executor_alive() {
        let t = tx(true, false);
        assert!(!t.is_orphan());
    }
}
