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

//! The write-ahead log core: snapshot isolation, commit-time conflict detection, checkpointing,
//! reload/recovery, and the orphan-transaction janitor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::access::Access;
use crate::endpoint::Endpoint;
use crate::error::{Result, WalError};
use crate::executor::{current, ExecutorHandle, ExecutorId};
use crate::storage::{page_location, Storage, PAGE_SIZE};
use crate::transaction::{Transaction, TransactionOps, TxState};
use crate::wal::log_record::{LogHeader, LogPageData, LogTransactionData, HEADER_SIZE};
use crate::wal::page::WalPage;

const CLOSING_LOCK: u32 = 1 << 0;
const TRANSACTIONS_LOCK: u32 = 1 << 1;
const INDEX_LOCK: u32 = 1 << 2;
const STORAGE_WRITE_LOCK: u32 = 1 << 3;
const CLOSED: u32 = 1 << 4;
const READER_SHIFT: u32 = 8;
const READER_UNIT: u32 = 1 << READER_SHIFT;
const READER_MASK: u32 = 0xFF00;

pub const MAX_LOADED_PAGES: usize = crate::storage::buffered_file::MAX_LOADED_PAGES;
pub const INDEX_TRIGGER: usize = 512;
pub const LOG_SIZE_TRIGGER: u64 = 1 << 30;
pub const JANITOR_PERIOD: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tunables bundled into one value and passed to `Wal::open`, in the teacher's
/// constructor-parameter style rather than ambient global configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub page_size: u64,
    pub max_loaded_pages: usize,
    pub index_trigger: usize,
    pub log_size_trigger: u64,
    pub janitor_period: Duration,
    pub split_max_part_length: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            max_loaded_pages: MAX_LOADED_PAGES,
            index_trigger: INDEX_TRIGGER,
            log_size_trigger: LOG_SIZE_TRIGGER,
            janitor_period: JANITOR_PERIOD,
            split_max_part_length: 64 * 1024 * 1024,
        }
    }
}

fn acquire_bit(state: &AtomicU32, bit: u32) {
    loop {
        let cur = state.load(Ordering::SeqCst);
        if cur & bit == 0
            && state
                .compare_exchange(cur, cur | bit, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return;
        }
        std::thread::yield_now();
    }
}

fn release_bit(state: &AtomicU32, bit: u32) {
    state.fetch_and(!bit, Ordering::SeqCst);
}

struct BitGuard<'a> {
    state: &'a AtomicU32,
    bit: u32,
}

impl<'a> BitGuard<'a> {
    fn acquire(state: &'a AtomicU32, bit: u32) -> Self {
        acquire_bit(state, bit);
        Self { state, bit }
    }
}

impl Drop for BitGuard<'_> {
    fn drop(&mut self) {
        release_bit(self.state, self.bit);
    }
}

/// Lightweight, globally visible metadata for a running transaction: enough for the janitor to
/// detect orphans and for checkpoint to compute `minEndMark`, without needing the transaction's
/// full page cache.
struct TxRecord {
    end_mark: i64,
    state: Arc<AtomicU8>,
    executor: ExecutorHandle,
}

struct TxInner {
    record: Arc<TxRecord>,
    pages: HashMap<u64, WalPage>,
}

pub struct Wal {
    data: Arc<dyn Storage>,
    log: Arc<dyn Storage>,
    config: WalConfig,
    state: AtomicU32,
    index: Mutex<Vec<LogTransactionData>>,
    index_last_committed: AtomicI64,
    sequencer: AtomicU64,
    running: DashMap<ExecutorId, Arc<TxRecord>>,
    wake_tx: crossbeam_channel::Sender<()>,
    wake_rx: crossbeam_channel::Receiver<()>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Open a WAL over `data` and `log` storages, replaying (and truncating the partial tail
    /// of) any existing log content first.
    pub fn open(data: Arc<dyn Storage>, log: Arc<dyn Storage>, config: WalConfig) -> Result<Arc<Self>> {
        reload(&data, &log)?;
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let wal = Arc::new(Self {
            data,
            log,
            config,
            state: AtomicU32::new(0),
            index: Mutex::new(Vec::new()),
            index_last_committed: AtomicI64::new(-1),
            sequencer: AtomicU64::new(0),
            running: DashMap::new(),
            wake_tx,
            wake_rx,
            janitor: Mutex::new(None),
        });
        wal.spawn_janitor();
        Ok(wal)
    }

    fn check_not_closed(&self) -> Result<()> {
        let cur = self.state.load(Ordering::SeqCst);
        if cur & CLOSED != 0 || cur & CLOSING_LOCK != 0 {
            return Err(WalError::BadState("WAL is closed or closing".into()));
        }
        Ok(())
    }

    pub fn data_usage_bytes(&self) -> u64 {
        self.data.size()
    }

    pub fn log_usage_bytes(&self) -> u64 {
        self.log.size()
    }

    fn reset_janitor_wait(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let wal = self.clone();
        let handle = std::thread::Builder::new()
            .name("pagewal-janitor".into())
            .spawn(move || loop {
                match wal.wake_rx.recv_timeout(wal.config.janitor_period) {
                    Ok(()) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
                if wal.state.load(Ordering::SeqCst) & CLOSING_LOCK != 0 {
                    return;
                }
                if let Err(e) = wal.cleanup(false) {
                    warn!(error = %e, "janitor cleanup pass failed");
                }
            })
            .expect("failed to spawn janitor thread");
        *self.janitor.lock().unwrap() = Some(handle);
    }

    /// `begin(writable, autocommit)`: snapshot `endMark`, register the transaction, return it.
    #[instrument(level = "debug", skip(self))]
    pub fn begin(self: &Arc<Self>, writable: bool, autocommit: bool) -> Result<Transaction> {
        self.check_not_closed()?;
        let _guard = BitGuard::acquire(&self.state, TRANSACTIONS_LOCK);
        let end_mark = self.index_last_committed.load(Ordering::SeqCst);
        let executor = current();
        let shared_state = Arc::new(AtomicU8::new(TxState::Running as u8));
        let record = Arc::new(TxRecord {
            end_mark,
            state: shared_state.clone(),
            executor: executor.clone(),
        });
        self.running.insert(executor.id(), record.clone());
        drop(_guard);
        self.reset_janitor_wait();

        let tx_inner = Arc::new(Mutex::new(TxInner {
            record,
            pages: HashMap::new(),
        }));
        let ops = WalTxOps {
            wal: self.clone(),
            tx: tx_inner,
            executor: executor.clone(),
        };
        Ok(Transaction::with_shared_state(
            Box::new(ops),
            writable,
            autocommit,
            shared_state,
            executor,
        ))
    }

    /// `acquirePage`: the committed-history view of `location` as of `end_mark`, plus whatever
    /// indexed (not yet checked-pointed) edits apply.
    fn acquire_page(&self, location: u64, end_mark: i64) -> Result<WalPage> {
        let mut page = WalPage::new(location);
        // Hold the index lock across the base load and the index scan: checkpoint holds this
        // same lock for its entire write-back-then-drain, so this pairing is what keeps a page
        // snapshot atomic. Splitting these into two separately-locked steps would let a
        // checkpoint write a record's edits into storage and drain it from the index in between,
        // and we'd see neither copy of that edit.
        let index = self.index.lock().unwrap();
        self.load_base(location, &mut page.buffer)?;
        for record in index.iter() {
            if record.sequence_number as i64 > end_mark {
                continue;
            }
            if let Some(page_data) = record.get_page(location) {
                for edit in page_data.edits.iter() {
                    let start = edit.offset as usize;
                    page.buffer[start..start + edit.bytes.len()].copy_from_slice(&edit.bytes);
                }
            }
        }
        Ok(page)
    }

    fn load_base(&self, location: u64, buf: &mut [u8]) -> Result<()> {
        self.inc_reader();
        let result = (|| {
            let ep = self.data.acquire_endpoint_at(location)?;
            let available = (ep.upper_bound().saturating_sub(location)) as usize;
            let len = buf.len().min(available);
            ep.read_bytes(location, &mut buf[..len])?;
            if len < buf.len() {
                buf[len..].fill(0);
            }
            self.data.release_endpoint(ep);
            Ok(())
        })();
        self.dec_reader();
        result
    }

    fn inc_reader(&self) {
        loop {
            let cur = self.state.load(Ordering::SeqCst);
            if cur & STORAGE_WRITE_LOCK != 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .state
                .compare_exchange(cur, cur + READER_UNIT, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    fn dec_reader(&self) {
        self.state.fetch_sub(READER_UNIT, Ordering::SeqCst);
    }

    fn acquire_storage_write_lock(&self) {
        loop {
            let cur = self.state.load(Ordering::SeqCst);
            let readers = (cur & READER_MASK) >> READER_SHIFT;
            if cur & STORAGE_WRITE_LOCK == 0
                && readers == 0
                && self
                    .state
                    .compare_exchange(
                        cur,
                        cur | STORAGE_WRITE_LOCK,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn release_storage_write_lock(&self) {
        release_bit(&self.state, STORAGE_WRITE_LOCK);
    }

    /// `doCommit()`: conflict-check, append, flush, publish.
    #[instrument(level = "debug", skip(self, tx))]
    fn commit_tx(&self, tx: &Arc<Mutex<TxInner>>) -> Result<()> {
        let (end_mark, mut pages) = {
            let inner = tx.lock().unwrap();
            let end_mark = inner.record.end_mark;
            let pages: Vec<LogPageData> = inner
                .pages
                .values()
                .filter(|p| p.dirty && !p.edits.is_empty())
                .map(|p| LogPageData {
                    location: p.location,
                    edits: p.edits.clone(),
                })
                .collect();
            (end_mark, pages)
        };
        if pages.is_empty() {
            return Ok(());
        }
        pages.sort_by_key(|p| p.location);

        let sequence_number = self.sequencer.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp_ms = now_ms();
        let mut record = LogTransactionData::new(sequence_number, timestamp_ms, pages);

        let _guard = BitGuard::acquire(&self.state, INDEX_LOCK);
        let mut index = self.index.lock().unwrap();
        let last_committed = self.index_last_committed.load(Ordering::SeqCst);
        if last_committed > end_mark {
            for existing in index.iter() {
                if existing.sequence_number as i64 > end_mark && existing.intersects(&record) {
                    return Err(WalError::ConcurrentWrite {
                        first_conflict_seq: existing.sequence_number,
                        timestamp_ms: existing.timestamp_ms,
                    });
                }
            }
        }

        let log_location = (self.log.size()).max(HEADER_SIZE);
        if index.is_empty() {
            let header = LogHeader {
                magic: crate::wal::log_record::MAGIC,
                last_checkpoint_timestamp_ms: timestamp_ms,
                indexed_transaction_count: 0,
                first_transaction_log_offset: log_location,
            };
            header.write(&self.log)?;
        }
        record.write_at(&self.log, log_location)?;
        self.log.flush()?;
        index.push(record);
        self.index_last_committed.store(sequence_number as i64, Ordering::SeqCst);
        let index_len = index.len();
        drop(index);
        drop(_guard);

        debug!(sequence_number, log_location, "transaction committed");

        if index_len >= self.config.index_trigger || self.log.size() > self.config.log_size_trigger
        {
            if let Err(e) = self.cleanup(false) {
                warn!(error = %e, "post-commit checkpoint trigger failed");
            }
        }
        Ok(())
    }

    fn end_tx(&self, executor: &ExecutorHandle) {
        let _guard = BitGuard::acquire(&self.state, TRANSACTIONS_LOCK);
        self.running.remove(&executor.id());
    }

    /// `flush()`: force a checkpoint regardless of trigger state.
    pub fn flush(&self) -> Result<()> {
        self.cleanup(true)
    }

    /// Janitor + explicit-flush entry point: reap orphans, then checkpoint if triggered (or
    /// forced).
    #[instrument(level = "debug", skip(self))]
    pub fn cleanup(&self, force_checkpoint: bool) -> Result<()> {
        self.reap_orphans();
        let index_len = self.index.lock().unwrap().len();
        let should_checkpoint = force_checkpoint
            || index_len >= self.config.index_trigger
            || self.log.size() > self.config.log_size_trigger;
        if should_checkpoint {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn reap_orphans(&self) {
        let orphans: Vec<ExecutorId> = self
            .running
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.state.load(Ordering::SeqCst) == TxState::Running as u8
                    && !record.executor.is_alive()
            })
            .map(|entry| *entry.key())
            .collect();
        for id in orphans {
            if let Some((_, record)) = self.running.remove(&id) {
                record.state.store(TxState::Aborted as u8, Ordering::SeqCst);
                info!(executor = ?id, "reaped orphaned transaction");
            }
        }
    }

    fn min_end_mark(&self) -> i64 {
        self.running
            .iter()
            .map(|entry| entry.value().end_mark)
            .min()
            .unwrap_or(i64::MAX)
    }

    /// Write back every checkpoint-safe record to `data`, then truncate the log.
    #[instrument(level = "debug", skip(self))]
    fn checkpoint(&self) -> Result<()> {
        let _tx_guard = BitGuard::acquire(&self.state, TRANSACTIONS_LOCK);
        let min_end_mark = self.min_end_mark();
        drop(_tx_guard);

        let _idx_guard = BitGuard::acquire(&self.state, INDEX_LOCK);
        let mut index = self.index.lock().unwrap();
        let safe_count = index
            .iter()
            .take_while(|r| (r.sequence_number as i64) < min_end_mark)
            .count();
        if safe_count == 0 {
            return Ok(());
        }

        self.acquire_storage_write_lock();
        let write_result = (|| -> Result<()> {
            for record in &index[..safe_count] {
                for page in &record.pages {
                    let mut access = Access::new(self.data.clone(), page.location, PAGE_SIZE, true);
                    for edit in page.edits.iter() {
                        access.seek(page.location + edit.offset as u64)?;
                        access.write_bytes(&edit.bytes)?;
                    }
                    access.close();
                }
            }
            self.data.flush()
        })();
        self.release_storage_write_lock();
        write_result?;

        let checkpointed_all = safe_count == index.len();
        if checkpointed_all {
            // Nothing left to replay: truncate the whole log back to an empty header.
            self.log.cut(0, self.log.size())?;
            LogHeader::empty(now_ms()).write(&self.log)?;
        } else {
            // `Storage::cut` zeroes/truncates in place; it does not splice the remaining bytes
            // down. So a partial checkpoint just moves the header's
            // `first_transaction_log_offset` marker past the checkpointed records -- the log
            // file keeps growing until a later checkpoint manages to clear it entirely. Record
            // positions are untouched.
            let next_offset = index[safe_count].log_location.unwrap_or(HEADER_SIZE);
            let header = LogHeader {
                magic: crate::wal::log_record::MAGIC,
                last_checkpoint_timestamp_ms: now_ms(),
                indexed_transaction_count: (index.len() - safe_count) as u64,
                first_transaction_log_offset: next_offset,
            };
            header.write(&self.log)?;
        }
        index.drain(..safe_count);
        self.log.flush()?;
        info!(checkpointed = safe_count, remaining = index.len(), "checkpoint complete");
        Ok(())
    }

    /// Set `ClosingLock`, stop the janitor, run a final forced checkpoint, close both
    /// storages, then set `Closed`.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        acquire_bit(&self.state, CLOSING_LOCK);
        let handle = self.janitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.wake_tx.send(());
            let _ = handle.join();
        }
        let result = self.cleanup(true);
        self.log.close()?;
        self.data.close()?;
        self.state.fetch_or(CLOSED, Ordering::SeqCst);
        result
    }
}

/// On open: replay (and then discard) any existing log content into `data`.
fn reload(data: &Arc<dyn Storage>, log: &Arc<dyn Storage>) -> Result<()> {
    if log.size() <= HEADER_SIZE {
        return Ok(());
    }
    let header = LogHeader::read(log)?;
    let mut offset = header.first_transaction_log_offset;
    if offset == 0 {
        return Ok(());
    }
    let mut applied = 0u64;
    loop {
        match LogTransactionData::try_read_at(log, offset)? {
            Some(record) => {
                let len = record.encoded_len();
                for page in &record.pages {
                    let mut access = Access::new(data.clone(), page.location, PAGE_SIZE, true);
                    for edit in page.edits.iter() {
                        access.seek(page.location + edit.offset as u64)?;
                        access.write_bytes(&edit.bytes)?;
                    }
                    access.close();
                }
                offset += len;
                applied += 1;
            }
            None => break,
        }
    }
    data.flush()?;
    log.cut(0, log.size())?;
    LogHeader::empty(now_ms()).write(log)?;
    log.flush()?;
    info!(applied, "replayed transactions from log on reload");
    Ok(())
}

struct WalTxOps {
    wal: Arc<Wal>,
    tx: Arc<Mutex<TxInner>>,
    executor: ExecutorHandle,
}

impl TransactionOps for WalTxOps {
    fn do_commit(&mut self) -> Result<()> {
        self.wal.commit_tx(&self.tx)
    }

    fn do_access(&mut self, index: u64, length: u64, writable: bool) -> Result<Access> {
        let storage: Arc<dyn Storage> = Arc::new(SnapshotStorage {
            wal: self.wal.clone(),
            tx: self.tx.clone(),
            writable,
        });
        Ok(Access::new(storage, index, length, writable))
    }

    fn on_close(&mut self) {
        self.wal.end_tx(&self.executor);
    }
}

/// The per-transaction virtual storage backing `Transaction::access`. Pages are acquired once
/// (via `Wal::acquire_page`) and cached for the transaction's lifetime; `release_endpoint` is a
/// no-op, matching the spec's "no release until transaction end."
struct SnapshotStorage {
    wal: Arc<Wal>,
    tx: Arc<Mutex<TxInner>>,
    writable: bool,
}

impl Storage for SnapshotStorage {
    fn size(&self) -> u64 {
        self.wal.data.size()
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn cut(&self, _from: u64, _to: u64) -> Result<bool> {
        Err(WalError::BadState(
            "cut is not supported on a transaction snapshot".into(),
        ))
    }

    fn acquire_endpoint_at(&self, index: u64) -> Result<Box<dyn Endpoint>> {
        let location = page_location(index);
        let mut inner = self.tx.lock().unwrap();
        if !inner.pages.contains_key(&location) {
            let end_mark = inner.record.end_mark;
            let page = self.wal.acquire_page(location, end_mark)?;
            inner.pages.insert(location, page);
        }
        Ok(Box::new(TxPageEndpoint {
            tx: self.tx.clone(),
            location,
            writable: self.writable,
        }))
    }

    fn release_endpoint(&self, _ep: Box<dyn Endpoint>) {}

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct TxPageEndpoint {
    tx: Arc<Mutex<TxInner>>,
    location: u64,
    writable: bool,
}

impl Endpoint for TxPageEndpoint {
    fn lower_bound(&self) -> u64 {
        self.location
    }

    fn upper_bound(&self) -> u64 {
        self.location + PAGE_SIZE
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(index, out.len() as u64)?;
        let inner = self.tx.lock().unwrap();
        let page = inner
            .pages
            .get(&self.location)
            .expect("page must be acquired before it can be read");
        let start = (index - self.location) as usize;
        out.copy_from_slice(&page.buffer[start..start + out.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, index: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WalError::BadState("endpoint is not writable".into()));
        }
        self.check_range(index, data.len() as u64)?;
        let mut inner = self.tx.lock().unwrap();
        let page = inner
            .pages
            .get_mut(&self.location)
            .expect("page must be acquired before it can be written");
        let offset = (index - self.location) as u32;
        page.write(offset, data);
        Ok(())
    }
}
