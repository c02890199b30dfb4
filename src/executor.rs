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

//! The abstract "executor" identity a `Transaction` is bound to. In this crate an executor is
//! an OS thread: each thread lazily gets an id and an `Arc<AtomicBool>` liveness flag that the
//! thread-local destructor flips to false, which is how `Transaction::is_orphan` and the
//! janitor detect a caller that vanished without closing its transaction.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(u64);

/// A cloneable handle to the current thread's liveness flag. Cheap to clone and safe to store
/// in a `Transaction` or a `DashMap<ExecutorId, _>` beyond the thread's own lifetime.
#[derive(Clone)]
pub struct ExecutorHandle {
    id: ExecutorId,
    alive: Arc<AtomicBool>,
}

impl ExecutorHandle {
    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct ExecutorContext {
    handle: ExecutorHandle,
}

impl Drop for ExecutorContext {
    fn drop(&mut self) {
        self.handle.alive.store(false, Ordering::SeqCst);
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<ExecutorContext>> = const { RefCell::new(None) };
}

/// The handle for the calling thread, creating one on first use.
pub fn current() -> ExecutorHandle {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let id = ExecutorId(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::SeqCst));
            *slot = Some(ExecutorContext {
                handle: ExecutorHandle {
                    id,
                    alive: Arc::new(AtomicBool::new(true)),
                },
            });
        }
        slot.as_ref().unwrap().handle.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_thread_returns_same_id() {
        let a = current();
        let b = current();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn different_threads_get_different_ids() {
        let a = current();
        let id_b = std::thread::spawn(|| current().id()).join().unwrap();
        assert_ne!(a.id(), id_b);
    }

    #[test]
    fn handle_reports_dead_after_thread_exit() {
        let handle = std::thread::spawn(current).join().unwrap();
        assert!(!handle.is_alive());
    }

    #[test]
    fn handle_reports_alive_on_live_thread() {
        assert!(current().is_alive());
    }
}
