//! Duplicate detection
//!
//! Classifies a submission against the hash stored for its transfer id. The
//! same detector runs over two tables: one for prepare requests and one for
//! fulfil requests.

use crate::crypto::PayloadHash;
use crate::storage::LedgerTxn;
use crate::types::{DuplicateCheckRecord, TransferId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Outcome of a duplicate check
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateStatus {
    /// First time this id is seen
    New,

    /// Same id, same payload; carries the stored original outcome
    DuplicateIdentical(DuplicateCheckRecord),

    /// Same id, different payload
    DuplicateConflicting,
}

/// Which duplicate-check table a detector reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateTable {
    /// Prepare requests
    Prepare,
    /// Fulfil requests
    Fulfil,
}

/// Duplicate detector over one table
#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    table: DuplicateTable,
}

impl DuplicateDetector {
    /// Detector for prepare requests
    pub const PREPARE: Self = Self {
        table: DuplicateTable::Prepare,
    };

    /// Detector for fulfil requests
    pub const FULFIL: Self = Self {
        table: DuplicateTable::Fulfil,
    };

    /// Classify a submission
    ///
    /// Writes nothing. The row (present or absent) is locked until the
    /// caller's transaction ends, so two concurrent submissions of the same
    /// id are serialized.
    pub fn check(
        &self,
        txn: &LedgerTxn<'_>,
        transfer_id: &TransferId,
        hash: &PayloadHash,
    ) -> Result<DuplicateStatus> {
        let existing = match self.table {
            DuplicateTable::Prepare => txn.duplicate_check_for_update(transfer_id)?,
            DuplicateTable::Fulfil => txn.fulfil_check_for_update(transfer_id)?,
        };

        Ok(classify(existing, hash))
    }

    /// Classify without locking
    pub fn peek(
        &self,
        txn: &LedgerTxn<'_>,
        transfer_id: &TransferId,
        hash: &PayloadHash,
    ) -> Result<DuplicateStatus> {
        let existing = match self.table {
            DuplicateTable::Prepare => txn.duplicate_check(transfer_id)?,
            DuplicateTable::Fulfil => txn.fulfil_check(transfer_id)?,
        };

        Ok(classify(existing, hash))
    }

    /// Store the hash and outcome of a NEW submission
    ///
    /// Only callable inside the transaction that performs the submission's
    /// state change.
    pub fn record(
        &self,
        txn: &LedgerTxn<'_>,
        transfer_id: &TransferId,
        hash: &PayloadHash,
        rejection: Option<Error>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = DuplicateCheckRecord {
            hash: *hash,
            rejection,
            created_at: now,
        };

        match self.table {
            DuplicateTable::Prepare => txn.put_duplicate_check(transfer_id, &record),
            DuplicateTable::Fulfil => txn.put_fulfil_check(transfer_id, &record),
        }
    }
}

fn classify(existing: Option<DuplicateCheckRecord>, hash: &PayloadHash) -> DuplicateStatus {
    match existing {
        None => DuplicateStatus::New,
        Some(record) if record.hash == *hash => DuplicateStatus::DuplicateIdentical(record),
        Some(_) => DuplicateStatus::DuplicateConflicting,
    }
}

impl DuplicateCheckRecord {
    /// Replay the original outcome
    pub fn replay<T>(&self, value: T) -> Result<T> {
        match &self.rejection {
            Some(err) => Err(err.clone()),
            None => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::Storage, Config};
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    #[test]
    fn test_classification() {
        let (storage, _temp) = test_storage();
        let id = TransferId::new();
        let hash = [1u8; 32];
        let other = [2u8; 32];

        let status = storage
            .read(|txn| DuplicateDetector::PREPARE.check(txn, &id, &hash))
            .unwrap();
        assert_eq!(status, DuplicateStatus::New);

        storage
            .transact(|txn| DuplicateDetector::PREPARE.record(txn, &id, &hash, None, Utc::now()))
            .unwrap();

        let status = storage
            .read(|txn| DuplicateDetector::PREPARE.check(txn, &id, &hash))
            .unwrap();
        assert!(matches!(status, DuplicateStatus::DuplicateIdentical(_)));

        let status = storage
            .read(|txn| DuplicateDetector::PREPARE.check(txn, &id, &other))
            .unwrap();
        assert_eq!(status, DuplicateStatus::DuplicateConflicting);
    }

    #[test]
    fn test_tables_are_independent() {
        let (storage, _temp) = test_storage();
        let id = TransferId::new();
        let hash = [9u8; 32];

        storage
            .transact(|txn| DuplicateDetector::PREPARE.record(txn, &id, &hash, None, Utc::now()))
            .unwrap();

        let status = storage
            .read(|txn| DuplicateDetector::FULFIL.peek(txn, &id, &hash))
            .unwrap();
        assert_eq!(status, DuplicateStatus::New);
    }

    #[test]
    fn test_replay_returns_stored_rejection() {
        let (storage, _temp) = test_storage();
        let id = TransferId::new();
        let hash = [3u8; 32];

        storage
            .transact(|txn| {
                DuplicateDetector::FULFIL.record(
                    txn,
                    &id,
                    &hash,
                    Some(Error::ProofMismatch(id)),
                    Utc::now(),
                )
            })
            .unwrap();

        let status = storage
            .read(|txn| DuplicateDetector::FULFIL.check(txn, &id, &hash))
            .unwrap();
        let DuplicateStatus::DuplicateIdentical(record) = status else {
            panic!("expected identical duplicate");
        };
        assert_eq!(record.replay(()), Err(Error::ProofMismatch(id)));
    }
}
