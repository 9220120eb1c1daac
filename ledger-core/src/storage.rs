//! Storage layer using RocksDB
//!
//! The store is a pessimistic `TransactionDB`. Every engine operation runs in
//! one [`LedgerTxn`]; rows read with `*_for_update` stay exclusively locked
//! until that transaction commits or is dropped.
//!
//! # Column Families
//!
//! - `transfers` - Immutable transfer rows (key: transfer_id)
//! - `transfer_state_changes` - Append-only state log (key: transfer_id || seq)
//! - `transfer_state` - Current state pointer (key: transfer_id)
//! - `transfer_fulfilments` - Fulfilment proofs (key: transfer_id)
//! - `transfer_errors` - Terminal failures (key: transfer_id || seq)
//! - `transfer_timeouts` - Expiry index (key: expiration || transfer_id)
//! - `transfer_duplicate_checks` - Prepare hashes (key: transfer_id)
//! - `fulfil_duplicate_checks` - Fulfil hashes (key: transfer_id)
//! - `positions` - Net positions (key: len || participant || currency)
//! - `position_changes` - Position ledger (key: position key || seq)
//! - `position_change_refs` - One delta per state change guard (key: state_change_id || position key)
//! - `windows` - Settlement windows (key: window_id)
//! - `window_state_changes` - Window state log (key: window_id || seq)
//! - `open_windows` - OPEN window singleton per scope (key: currency)
//! - `window_transfers` - Assignment index (key: window_id || committed_at || transfer_id)
//! - `transfer_windows` - Transfer -> window (key: transfer_id)
//! - `meta` - Sequences

use crate::{
    config::RocksDBConfig,
    error::{Error, Result},
    types::*,
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, ReadOptions,
    Transaction, TransactionDB, TransactionDBOptions, TransactionOptions, WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Column family names
pub(crate) const CF_TRANSFERS: &str = "transfers";
pub(crate) const CF_STATE_CHANGES: &str = "transfer_state_changes";
pub(crate) const CF_STATE: &str = "transfer_state";
pub(crate) const CF_FULFILMENTS: &str = "transfer_fulfilments";
pub(crate) const CF_ERRORS: &str = "transfer_errors";
pub(crate) const CF_TIMEOUTS: &str = "transfer_timeouts";
pub(crate) const CF_DUPLICATES: &str = "transfer_duplicate_checks";
pub(crate) const CF_FULFIL_DUPLICATES: &str = "fulfil_duplicate_checks";
pub(crate) const CF_POSITIONS: &str = "positions";
pub(crate) const CF_POSITION_CHANGES: &str = "position_changes";
pub(crate) const CF_POSITION_REFS: &str = "position_change_refs";
pub(crate) const CF_WINDOWS: &str = "windows";
pub(crate) const CF_WINDOW_STATE_CHANGES: &str = "window_state_changes";
pub(crate) const CF_OPEN_WINDOWS: &str = "open_windows";
pub(crate) const CF_WINDOW_TRANSFERS: &str = "window_transfers";
pub(crate) const CF_TRANSFER_WINDOWS: &str = "transfer_windows";
pub(crate) const CF_META: &str = "meta";

const ALL_CFS: [&str; 17] = [
    CF_TRANSFERS,
    CF_STATE_CHANGES,
    CF_STATE,
    CF_FULFILMENTS,
    CF_ERRORS,
    CF_TIMEOUTS,
    CF_DUPLICATES,
    CF_FULFIL_DUPLICATES,
    CF_POSITIONS,
    CF_POSITION_CHANGES,
    CF_POSITION_REFS,
    CF_WINDOWS,
    CF_WINDOW_STATE_CHANGES,
    CF_OPEN_WINDOWS,
    CF_WINDOW_TRANSFERS,
    CF_TRANSFER_WINDOWS,
    CF_META,
];

const META_WINDOW_SEQ: &[u8] = b"window_seq";

/// Key encoding helpers
pub(crate) mod keys {
    use super::*;

    /// Order-preserving 8-byte timestamp
    pub fn timestamp(ts: DateTime<Utc>) -> [u8; 8] {
        let nanos = ts.timestamp_nanos_opt().unwrap_or(i64::MAX);
        ((nanos as u64) ^ (1 << 63)).to_be_bytes()
    }

    pub fn transfer_seq(transfer_id: &TransferId, sequence: u32) -> Vec<u8> {
        let mut key = transfer_id.as_bytes().to_vec();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    pub fn timeout(expiration: DateTime<Utc>, transfer_id: &TransferId) -> Vec<u8> {
        let mut key = timestamp(expiration).to_vec();
        key.extend_from_slice(transfer_id.as_bytes());
        key
    }

    /// Length-prefixed participant followed by the 3-byte currency
    ///
    /// No position key is a prefix of another, so `position_key || seq`
    /// scans never reach a different participant.
    pub fn position(participant: &ParticipantId, currency: &Currency) -> Vec<u8> {
        let name = participant.as_str().as_bytes();
        let len = u16::try_from(name.len()).unwrap_or(u16::MAX);
        let mut key = Vec::with_capacity(2 + name.len() + 3);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(&name[..len as usize]);
        key.extend_from_slice(currency.code().as_bytes());
        key
    }

    /// Split a position key back into its parts
    pub fn split_position(key: &[u8]) -> Option<(ParticipantId, Currency)> {
        if key.len() < 2 {
            return None;
        }
        let (len, rest) = key.split_at(2);
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        if rest.len() != len + 3 {
            return None;
        }
        let participant = std::str::from_utf8(&rest[..len]).ok()?;
        let currency = std::str::from_utf8(&rest[len..]).ok()?;
        Some((ParticipantId::new(participant), Currency::from_code(currency)?))
    }

    pub fn position_change(position_key: &[u8], sequence: u64) -> Vec<u8> {
        let mut key = position_key.to_vec();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    pub fn position_ref(state_change_id: &Uuid, position_key: &[u8]) -> Vec<u8> {
        let mut key = state_change_id.as_bytes().to_vec();
        key.extend_from_slice(position_key);
        key
    }

    pub fn window_seq(window_id: WindowId, sequence: u32) -> Vec<u8> {
        let mut key = window_id.to_key().to_vec();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    pub fn window_transfer(
        window_id: WindowId,
        committed_at: DateTime<Utc>,
        transfer_id: &TransferId,
    ) -> Vec<u8> {
        let mut key = window_id.to_key().to_vec();
        key.extend_from_slice(&timestamp(committed_at));
        key.extend_from_slice(transfer_id.as_bytes());
        key
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: TransactionDB,
    lock_timeout_ms: i64,
    max_retries: u32,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let db_opts = Self::db_options(&config.rocksdb);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_default_lock_timeout(config.rocksdb.lock_timeout_ms);
        txn_db_opts.set_txn_lock_timeout(config.rocksdb.lock_timeout_ms);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect();

        let db: TransactionDB =
            TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            "Opened RocksDB transaction store"
        );

        Ok(Self {
            db,
            lock_timeout_ms: config.rocksdb.lock_timeout_ms,
            max_retries: config.rocksdb.max_retries,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn db_options(config: &RocksDBConfig) -> Options {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.max_background_jobs);

        if config.enable_statistics {
            db_opts.enable_statistics();
        }

        db_opts
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Logs are written once and rarely read
            CF_STATE_CHANGES | CF_POSITION_CHANGES | CF_WINDOW_STATE_CHANGES | CF_ERRORS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Point lookups on every request benefit from bloom filters
            CF_STATE | CF_DUPLICATES | CF_FULFIL_DUPLICATES | CF_POSITIONS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false); // 10 bits per key
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn begin(&self, snapshot: bool) -> LedgerTxn<'_> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);

        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_deadlock_detect(true);
        txn_opts.set_snapshot(snapshot);

        LedgerTxn {
            storage: self,
            txn: self.db.transaction_opt(&write_opts, &txn_opts),
            snapshot,
        }
    }

    /// Run `f` in one transaction and commit it
    ///
    /// Transient failures (lock timeout, busy, deadlock victim) restart the
    /// whole closure up to `max_retries` times. Any other error drops the
    /// transaction, which rolls it back.
    pub fn transact<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&LedgerTxn<'_>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let txn = self.begin(false);
            let result = match f(&txn) {
                Ok(value) => txn.commit().map(|_| value),
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "Retrying transaction");
                }
                other => return other,
            }
        }
    }

    /// Run `f` against a transaction that is never committed
    ///
    /// Every read in `f` sees the store as of the start of the call, so
    /// rows written together by a concurrent commit are seen together.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LedgerTxn<'_>) -> Result<T>,
    {
        let txn = self.begin(true);
        f(&txn)
    }
}

/// One open store transaction with typed row accessors
pub struct LedgerTxn<'a> {
    storage: &'a Storage,
    txn: Transaction<'a, TransactionDB>,
    snapshot: bool,
}

impl std::fmt::Debug for LedgerTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerTxn").finish_non_exhaustive()
    }
}

impl<'a> LedgerTxn<'a> {
    fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    // Helper: get column family handle

    fn cf(&self, name: &str) -> Result<&'a ColumnFamily> {
        self.storage
            .db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Raw typed access

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let bytes = if self.snapshot {
            let snapshot = self.txn.snapshot();
            let mut read_opts = ReadOptions::default();
            read_opts.set_snapshot(&snapshot);
            self.txn.get_cf_opt(self.cf(cf)?, key, &read_opts)?
        } else {
            self.txn.get_cf(self.cf(cf)?, key)?
        };
        match bytes {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read and exclusively lock a row (absent rows are locked too)
    fn get_for_update<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.txn.get_for_update_cf(self.cf(cf)?, key, true)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.txn.put_cf(self.cf(cf)?, key, bytes)?;
        Ok(())
    }

    fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        self.txn.delete_cf(self.cf(cf)?, key)?;
        Ok(())
    }

    /// All rows whose key starts with `prefix`, in key order
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Box<[u8]>, T)>> {
        let snapshot = self.txn.snapshot();
        let mut read_opts = ReadOptions::default();
        if self.snapshot {
            read_opts.set_snapshot(&snapshot);
        }
        let iter = self.txn.iterator_cf_opt(
            self.cf(cf)?,
            read_opts,
            IteratorMode::From(prefix, Direction::Forward),
        );

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            let row: T = bincode::deserialize(&value)?;
            rows.push((key, row));
        }
        Ok(rows)
    }

    // Transfer operations

    /// Get transfer by ID
    pub fn get_transfer(&self, transfer_id: &TransferId) -> Result<Option<TransferRecord>> {
        self.get(CF_TRANSFERS, transfer_id.as_bytes())
    }

    /// Insert the immutable transfer row
    pub fn put_transfer(&self, transfer: &TransferRecord) -> Result<()> {
        self.put(CF_TRANSFERS, transfer.transfer_id.as_bytes(), transfer)
    }

    /// Current state pointer, locked for the rest of the transaction
    pub fn state_for_update(&self, transfer_id: &TransferId) -> Result<Option<StatePointer>> {
        self.get_for_update(CF_STATE, transfer_id.as_bytes())
    }

    /// Current state pointer without locking
    pub fn state(&self, transfer_id: &TransferId) -> Result<Option<StatePointer>> {
        self.get(CF_STATE, transfer_id.as_bytes())
    }

    /// Append a state change and move the pointer to it
    ///
    /// This is the only writer of `transfer_state`. The caller must hold the
    /// pointer lock (`state_for_update`) and pass the pointer it read.
    pub fn append_state_change(
        &self,
        transfer_id: &TransferId,
        current: Option<&StatePointer>,
        state: TransferState,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<StateChange> {
        let (sequence, changed_at) = match current {
            Some(pointer) => (pointer.sequence + 1, now.max(pointer.changed_at)),
            None => (0, now),
        };

        let change = StateChange {
            change_id: Uuid::now_v7(),
            transfer_id: *transfer_id,
            sequence,
            state,
            changed_at,
            reason,
        };

        self.put(
            CF_STATE_CHANGES,
            &keys::transfer_seq(transfer_id, sequence),
            &change,
        )?;
        self.put(
            CF_STATE,
            transfer_id.as_bytes(),
            &StatePointer::from(&change),
        )?;

        Ok(change)
    }

    /// Full state log of a transfer, oldest first
    pub fn state_history(&self, transfer_id: &TransferId) -> Result<Vec<StateChange>> {
        Ok(self
            .scan_prefix(CF_STATE_CHANGES, transfer_id.as_bytes(), usize::MAX)?
            .into_iter()
            .map(|(_, change)| change)
            .collect())
    }

    /// Stored fulfilment
    pub fn get_fulfilment(&self, transfer_id: &TransferId) -> Result<Option<FulfilmentRecord>> {
        self.get(CF_FULFILMENTS, transfer_id.as_bytes())
    }

    /// Store the fulfilment proof
    pub fn put_fulfilment(&self, transfer_id: &TransferId, record: &FulfilmentRecord) -> Result<()> {
        self.put(CF_FULFILMENTS, transfer_id.as_bytes(), record)
    }

    /// Record a terminal failure
    pub fn put_transfer_error(&self, record: &TransferErrorRecord) -> Result<()> {
        self.put(
            CF_ERRORS,
            &keys::transfer_seq(&record.transfer_id, record.state_change_sequence),
            record,
        )
    }

    /// Errors recorded for a transfer, oldest first
    pub fn transfer_errors(&self, transfer_id: &TransferId) -> Result<Vec<TransferErrorRecord>> {
        Ok(self
            .scan_prefix(CF_ERRORS, transfer_id.as_bytes(), usize::MAX)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    // Timeout index

    /// Schedule expiry
    pub fn put_timeout(&self, transfer_id: &TransferId, expiration: DateTime<Utc>) -> Result<()> {
        self.put(CF_TIMEOUTS, &keys::timeout(expiration, transfer_id), &())
    }

    /// Remove a scheduled expiry
    pub fn delete_timeout(&self, transfer_id: &TransferId, expiration: DateTime<Utc>) -> Result<()> {
        self.delete(CF_TIMEOUTS, &keys::timeout(expiration, transfer_id))
    }

    /// Timeouts with expiration <= `now`, soonest first
    pub fn due_timeouts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TransferId>> {
        let cutoff = keys::timestamp(now);
        let iter = self.txn.iterator_cf(self.cf(CF_TIMEOUTS)?, IteratorMode::Start);

        let mut due = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() < 24 || key[..8] > cutoff[..] || due.len() >= limit {
                break;
            }
            if let Some(transfer_id) = TransferId::from_slice(&key[8..24]) {
                due.push(transfer_id);
            }
        }
        Ok(due)
    }

    /// Number of scheduled timeouts
    pub fn timeout_count(&self) -> Result<usize> {
        let iter = self.txn.iterator_cf(self.cf(CF_TIMEOUTS)?, IteratorMode::Start);
        let mut count = 0;
        for item in iter {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // Duplicate checks

    /// Prepare duplicate-check row (locked)
    pub fn duplicate_check_for_update(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<DuplicateCheckRecord>> {
        self.get_for_update(CF_DUPLICATES, transfer_id.as_bytes())
    }

    /// Prepare duplicate-check row
    pub fn duplicate_check(&self, transfer_id: &TransferId) -> Result<Option<DuplicateCheckRecord>> {
        self.get(CF_DUPLICATES, transfer_id.as_bytes())
    }

    /// Insert prepare duplicate-check row
    pub fn put_duplicate_check(
        &self,
        transfer_id: &TransferId,
        record: &DuplicateCheckRecord,
    ) -> Result<()> {
        self.put(CF_DUPLICATES, transfer_id.as_bytes(), record)
    }

    /// Fulfil duplicate-check row (locked)
    pub fn fulfil_check_for_update(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<DuplicateCheckRecord>> {
        self.get_for_update(CF_FULFIL_DUPLICATES, transfer_id.as_bytes())
    }

    /// Fulfil duplicate-check row
    pub fn fulfil_check(&self, transfer_id: &TransferId) -> Result<Option<DuplicateCheckRecord>> {
        self.get(CF_FULFIL_DUPLICATES, transfer_id.as_bytes())
    }

    /// Insert fulfil duplicate-check row
    pub fn put_fulfil_check(
        &self,
        transfer_id: &TransferId,
        record: &DuplicateCheckRecord,
    ) -> Result<()> {
        self.put(CF_FULFIL_DUPLICATES, transfer_id.as_bytes(), record)
    }

    // Position operations

    /// Position row, locked for the rest of the transaction
    pub fn position_for_update(&self, position_key: &[u8]) -> Result<Option<PositionRecord>> {
        self.get_for_update(CF_POSITIONS, position_key)
    }

    /// Position row without locking
    pub fn position(&self, position_key: &[u8]) -> Result<Option<PositionRecord>> {
        self.get(CF_POSITIONS, position_key)
    }

    /// Write position row
    pub fn put_position(&self, position_key: &[u8], record: &PositionRecord) -> Result<()> {
        self.put(CF_POSITIONS, position_key, record)
    }

    /// Append a position ledger entry and its per-state-change guard
    pub fn append_position_change(&self, position_key: &[u8], change: &PositionChange) -> Result<()> {
        self.put(
            CF_POSITION_CHANGES,
            &keys::position_change(position_key, change.sequence),
            change,
        )?;
        self.put(
            CF_POSITION_REFS,
            &keys::position_ref(&change.state_change_id, position_key),
            &change.change_id,
        )
    }

    /// Change already applied to this position for the given state change
    pub fn position_change_ref(
        &self,
        state_change_id: &Uuid,
        position_key: &[u8],
    ) -> Result<Option<Uuid>> {
        self.get(CF_POSITION_REFS, &keys::position_ref(state_change_id, position_key))
    }

    /// Position ledger of one pair, in application order
    pub fn position_changes(&self, position_key: &[u8]) -> Result<Vec<PositionChange>> {
        Ok(self
            .scan_prefix(CF_POSITION_CHANGES, position_key, usize::MAX)?
            .into_iter()
            .map(|(_, change)| change)
            .collect())
    }

    /// Every stored position
    pub fn all_positions(&self) -> Result<Vec<(ParticipantId, Currency, PositionRecord)>> {
        let mut positions = Vec::new();
        for (key, record) in self.scan_prefix::<PositionRecord>(CF_POSITIONS, &[], usize::MAX)? {
            let (participant, currency) = keys::split_position(&key)
                .ok_or_else(|| Error::Corruption("Malformed position key".to_string()))?;
            positions.push((participant, currency, record));
        }
        Ok(positions)
    }

    // Window operations

    /// Window row
    pub fn get_window(&self, window_id: WindowId) -> Result<Option<SettlementWindow>> {
        self.get(CF_WINDOWS, &window_id.to_key())
    }

    /// Window row, locked
    pub fn window_for_update(&self, window_id: WindowId) -> Result<Option<SettlementWindow>> {
        self.get_for_update(CF_WINDOWS, &window_id.to_key())
    }

    /// Write the window row and append its state log entry
    pub fn put_window_state(&self, window: &SettlementWindow) -> Result<WindowStateChange> {
        let sequence = self
            .scan_prefix::<WindowStateChange>(
                CF_WINDOW_STATE_CHANGES,
                &window.window_id.to_key(),
                usize::MAX,
            )?
            .len() as u32;

        let change = WindowStateChange {
            window_id: window.window_id,
            sequence,
            state: window.state,
            changed_at: window.changed_at,
            reason: window.reason.clone(),
        };

        self.put(
            CF_WINDOW_STATE_CHANGES,
            &keys::window_seq(window.window_id, sequence),
            &change,
        )?;
        self.put(CF_WINDOWS, &window.window_id.to_key(), window)?;
        Ok(change)
    }

    /// Window state log, oldest first
    pub fn window_history(&self, window_id: WindowId) -> Result<Vec<WindowStateChange>> {
        Ok(self
            .scan_prefix(CF_WINDOW_STATE_CHANGES, &window_id.to_key(), usize::MAX)?
            .into_iter()
            .map(|(_, change)| change)
            .collect())
    }

    /// Every window, oldest first
    pub fn all_windows(&self) -> Result<Vec<SettlementWindow>> {
        Ok(self
            .scan_prefix(CF_WINDOWS, &[], usize::MAX)?
            .into_iter()
            .map(|(_, window)| window)
            .collect())
    }

    /// OPEN window singleton of a scope, locked
    pub fn open_window_for_update(&self, currency: &Currency) -> Result<Option<WindowId>> {
        self.get_for_update(CF_OPEN_WINDOWS, currency.code().as_bytes())
    }

    /// OPEN window singleton of a scope
    pub fn open_window(&self, currency: &Currency) -> Result<Option<WindowId>> {
        self.get(CF_OPEN_WINDOWS, currency.code().as_bytes())
    }

    /// Point the scope's singleton at a window
    pub fn set_open_window(&self, currency: &Currency, window_id: WindowId) -> Result<()> {
        self.put(CF_OPEN_WINDOWS, currency.code().as_bytes(), &window_id)
    }

    /// Allocate the next window id
    pub fn next_window_id(&self) -> Result<WindowId> {
        let current: u64 = self.get_for_update(CF_META, META_WINDOW_SEQ)?.unwrap_or(0);
        let next = current + 1;
        self.put(CF_META, META_WINDOW_SEQ, &next)?;
        Ok(WindowId(next))
    }

    /// Record transfer -> window assignment and the derived window index
    pub fn put_assignment(&self, window_id: WindowId, entry: &WindowTransfer) -> Result<()> {
        self.put(
            CF_WINDOW_TRANSFERS,
            &keys::window_transfer(window_id, entry.committed_at, &entry.transfer_id),
            entry,
        )?;
        self.put(CF_TRANSFER_WINDOWS, entry.transfer_id.as_bytes(), &window_id)
    }

    /// Window a transfer was assigned to
    pub fn transfer_window(&self, transfer_id: &TransferId) -> Result<Option<WindowId>> {
        self.get(CF_TRANSFER_WINDOWS, transfer_id.as_bytes())
    }

    /// Transfers of a window in commit order
    pub fn window_transfers(&self, window_id: WindowId) -> Result<Vec<WindowTransfer>> {
        Ok(self
            .scan_prefix(CF_WINDOW_TRANSFERS, &window_id.to_key(), usize::MAX)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn test_transfer() -> TransferRecord {
        TransferRecord {
            transfer_id: TransferId::new(),
            payer: ParticipantId::new("dfsp1"),
            payee: ParticipantId::new("dfsp2"),
            amount: Decimal::new(10000, 2),
            currency: Currency::from_code("USD").unwrap(),
            condition: Condition("c".into()),
            expiration: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for name in ALL_CFS {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_commit_makes_rows_visible() {
        let (storage, _temp) = test_storage();
        let transfer = test_transfer();

        storage.transact(|txn| txn.put_transfer(&transfer)).unwrap();

        let stored = storage.read(|txn| txn.get_transfer(&transfer.transfer_id)).unwrap();
        assert_eq!(stored, Some(transfer));
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let (storage, _temp) = test_storage();
        let transfer = test_transfer();

        let result: Result<()> = storage.transact(|txn| {
            txn.put_transfer(&transfer)?;
            Err(Error::Validation("boom".into()))
        });
        assert!(result.is_err());

        let stored = storage.read(|txn| txn.get_transfer(&transfer.transfer_id)).unwrap();
        assert!(stored.is_none());
    }

    #[test]
    fn test_state_pointer_follows_log() {
        let (storage, _temp) = test_storage();
        let id = TransferId::new();

        storage
            .transact(|txn| {
                let first = txn.append_state_change(&id, None, TransferState::Received, Utc::now(), None)?;
                txn.append_state_change(
                    &id,
                    Some(&StatePointer::from(&first)),
                    TransferState::Reserved,
                    Utc::now(),
                    None,
                )?;
                Ok(())
            })
            .unwrap();

        let (pointer, history) = storage
            .read(|txn| Ok((txn.state(&id)?, txn.state_history(&id)?)))
            .unwrap();

        assert_eq!(history.len(), 2);
        let pointer = pointer.unwrap();
        assert_eq!(pointer.state, TransferState::Reserved);
        assert_eq!(pointer.sequence, 1);
        assert_eq!(pointer.change_id, history[1].change_id);
    }

    #[test]
    fn test_changed_at_is_monotonic() {
        let (storage, _temp) = test_storage();
        let id = TransferId::new();
        let later = Utc::now() + chrono::Duration::seconds(60);

        let second = storage
            .transact(|txn| {
                let first = txn.append_state_change(&id, None, TransferState::Received, later, None)?;
                // Clock went backwards
                txn.append_state_change(
                    &id,
                    Some(&StatePointer::from(&first)),
                    TransferState::Reserved,
                    Utc::now(),
                    None,
                )
            })
            .unwrap();

        assert_eq!(second.changed_at, later);
    }

    #[test]
    fn test_due_timeouts_in_expiry_order() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();
        let early = TransferId::new();
        let late = TransferId::new();
        let future = TransferId::new();

        storage
            .transact(|txn| {
                txn.put_timeout(&late, now - chrono::Duration::seconds(1))?;
                txn.put_timeout(&early, now - chrono::Duration::seconds(10))?;
                txn.put_timeout(&future, now + chrono::Duration::seconds(10))
            })
            .unwrap();

        let due = storage.read(|txn| txn.due_timeouts(now, 100)).unwrap();
        assert_eq!(due, vec![early, late]);

        let limited = storage.read(|txn| txn.due_timeouts(now, 1)).unwrap();
        assert_eq!(limited, vec![early]);
    }

    #[test]
    fn test_timestamp_key_orders_pre_epoch() {
        let before = DateTime::<Utc>::from_timestamp(-5, 0).unwrap();
        let after = DateTime::<Utc>::from_timestamp(5, 0).unwrap();
        assert!(keys::timestamp(before) < keys::timestamp(after));
    }

    #[test]
    fn test_split_position_key() {
        let key = keys::position(&ParticipantId::new("dfsp|1"), &Currency::from_code("EUR").unwrap());
        let (participant, currency) = keys::split_position(&key).unwrap();
        assert_eq!(participant.as_str(), "dfsp|1");
        assert_eq!(currency.code(), "EUR");

        assert!(keys::split_position(b"\x00").is_none());
        assert!(keys::split_position(&key[..key.len() - 1]).is_none());
    }

    #[test]
    fn test_position_key_is_not_a_prefix_of_another() {
        let usd = Currency::from_code("USD").unwrap();
        let short = keys::position(&ParticipantId::new("a"), &usd);
        let long = keys::position(&ParticipantId::new("a|USD|x"), &usd);

        assert!(!long.starts_with(&short));
        assert!(!keys::position_change(&long, 0).starts_with(&short));
    }

    #[test]
    fn test_window_ids_are_sequential() {
        let (storage, _temp) = test_storage();
        let a = storage.transact(|txn| txn.next_window_id()).unwrap();
        let b = storage.transact(|txn| txn.next_window_id()).unwrap();
        assert_eq!(a, WindowId(1));
        assert_eq!(b, WindowId(2));
    }
}
