// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded ledger database backed by redb (pure Rust, ACID).
//!
//! redb serializes write transactions, so the conditional upsert and the
//! settlement claim below are atomic without any engine-level lock: two
//! producers racing on the same `(merchant, reference)` key resolve to one
//! record with a deterministic last write, and two settlement attempts
//! racing on the same record resolve to one claim.
//!
//! ## Table Layout
//!
//! - `transactions`: `merchant_id|reference` → serialized Transaction
//! - `wallet_tx_index`: composite key (wallet|!timestamp|tx_key) → tx_key
//! - `time_tx_index`: composite key (timestamp_be|tx_key) → tx_key
//! - `listener_state`: key → value (chain listener checkpoints)

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::transaction::{SettlementRecord, SettlementStatus, Transaction, TxStatus};
use crate::normalize::NormalizedEvent;

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary table: `merchant_id|reference` → serialized Transaction (JSON bytes).
const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");

/// Index: composite key → tx_key.
/// Key format: `wallet|!timestamp_be|tx_key` for descending-time range scans.
const WALLET_TX_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("wallet_tx_index");

/// Index: composite key → tx_key.
/// Key format: `timestamp_be|tx_key` for ascending time-range scans.
const TIME_TX_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("time_tx_index");

/// Chain listener state: key → value bytes (e.g., "last_block_testnet" → u64 BE).
const LISTENER_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("listener_state");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Key Helpers
// =============================================================================

/// Primary key for a ledger record.
pub fn tx_key(merchant_id: &str, reference: &str) -> String {
    format!("{merchant_id}|{reference}")
}

/// Build a composite key for the wallet_tx_index table.
///
/// Format: `lowercase_wallet | inverted_timestamp_be_bytes | tx_key`
///
/// The inverted timestamp ensures newest-first ordering when scanning forward.
fn make_wallet_key(wallet: &str, timestamp: i64, key: &str) -> Vec<u8> {
    let addr = wallet.to_lowercase();
    let mut out = Vec::with_capacity(addr.len() + 1 + 8 + 1 + key.len());
    out.extend_from_slice(addr.as_bytes());
    out.push(b'|');
    out.extend_from_slice(&(!timestamp as u64).to_be_bytes());
    out.push(b'|');
    out.extend_from_slice(key.as_bytes());
    out
}

/// Build a prefix key for range scanning all records of a wallet.
fn make_wallet_prefix(wallet: &str) -> Vec<u8> {
    let addr = wallet.to_lowercase();
    let mut prefix = Vec::with_capacity(addr.len() + 1);
    prefix.extend_from_slice(addr.as_bytes());
    prefix.push(b'|');
    prefix
}

/// Upper bound for a wallet range scan (prefix with 0xFF bytes appended).
fn make_wallet_prefix_end(wallet: &str) -> Vec<u8> {
    let mut end = make_wallet_prefix(wallet);
    end.extend_from_slice(&[0xFF; 20]);
    end
}

/// Build a composite key for the time_tx_index table.
///
/// Format: `timestamp_be_bytes | tx_key` (ascending time order).
fn make_time_key(timestamp: i64, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 1 + key.len());
    out.extend_from_slice(&(timestamp.max(0) as u64).to_be_bytes());
    out.push(b'|');
    out.extend_from_slice(key.as_bytes());
    out
}

// =============================================================================
// Claim Outcome
// =============================================================================

/// Result of an atomic settlement claim.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The record is now `Processing` and this caller owns the attempt.
    Claimed(Box<Transaction>),
    /// The record is already `Settled`; the stored settlement is returned.
    AlreadySettled(Box<Transaction>),
    /// Another attempt is still in flight; do nothing.
    InFlight,
    /// No such record.
    NotFound,
}

// =============================================================================
// LedgerStore
// =============================================================================

/// Embedded ACID ledger store, one record per `(merchant_id, reference)`.
pub struct LedgerStore {
    db: Database,
}

impl LedgerStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TRANSACTIONS)?;
            let _ = write_txn.open_table(WALLET_TX_INDEX)?;
            let _ = write_txn.open_table(TIME_TX_INDEX)?;
            let _ = write_txn.open_table(LISTENER_STATE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Conditional upsert
    // =========================================================================

    /// Insert or merge a normalized event under `(merchant_id, reference)`,
    /// all inside one write transaction.
    ///
    /// A missing record becomes a fresh `Pending` one; an existing record is
    /// merged per the status rules in [`Transaction::merge_event`]. Index
    /// entries follow the event timestamp; a timestamp change during a
    /// `Pending` overwrite relocates the old entries.
    pub fn upsert_event(
        &self,
        merchant_id: &str,
        wallet_address: Option<&str>,
        default_fiat_currency: &str,
        event: &NormalizedEvent,
    ) -> LedgerResult<Transaction> {
        let key = tx_key(merchant_id, &event.reference);

        let write_txn = self.db.begin_write()?;
        let tx = {
            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;

            let existing = match tx_table.get(key.as_str())? {
                Some(value) => Some(serde_json::from_slice::<Transaction>(value.value())?),
                None => None,
            };

            let (tx, old_timestamp) = match existing {
                Some(mut current) => {
                    let old_ts = current.event_timestamp.timestamp();
                    current.merge_event(event);
                    (current, Some(old_ts))
                }
                None => (
                    Transaction::from_event(merchant_id, event, default_fiat_currency),
                    None,
                ),
            };

            let json = serde_json::to_vec(&tx)?;
            tx_table.insert(key.as_str(), json.as_slice())?;

            let new_ts = tx.event_timestamp.timestamp();
            let mut time_table = write_txn.open_table(TIME_TX_INDEX)?;
            let mut wallet_table = write_txn.open_table(WALLET_TX_INDEX)?;

            if let Some(old_ts) = old_timestamp.filter(|old| *old != new_ts) {
                time_table.remove(make_time_key(old_ts, &key).as_slice())?;
                if let Some(wallet) = wallet_address {
                    wallet_table.remove(make_wallet_key(wallet, old_ts, &key).as_slice())?;
                }
            }

            time_table.insert(make_time_key(new_ts, &key).as_slice(), key.as_str())?;
            if let Some(wallet) = wallet_address {
                wallet_table.insert(make_wallet_key(wallet, new_ts, &key).as_slice(), key.as_str())?;
            }

            tx
        };
        write_txn.commit()?;
        Ok(tx)
    }

    /// Look up a single record.
    pub fn get(&self, merchant_id: &str, reference: &str) -> LedgerResult<Option<Transaction>> {
        let key = tx_key(merchant_id, reference);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Settlement bookkeeping
    // =========================================================================

    /// Atomically claim a record for settlement.
    ///
    /// `Pending` and `Failed` records move to `Processing` and are returned
    /// as [`ClaimOutcome::Claimed`]. A `Processing` record is normally left
    /// alone (`InFlight`); when `stale_after` is given and the record has
    /// not been touched for that long, it is reclaimed instead — this is
    /// the sweeper's crash-recovery path.
    pub fn claim_for_settlement(
        &self,
        merchant_id: &str,
        reference: &str,
        stale_after: Option<Duration>,
    ) -> LedgerResult<ClaimOutcome> {
        let key = tx_key(merchant_id, reference);

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(TRANSACTIONS)?;

            // Copy the bytes out so the access guard does not pin `table`
            // while we write back through it.
            let existing_bytes = table.get(key.as_str())?.map(|value| value.value().to_vec());

            match existing_bytes {
                None => ClaimOutcome::NotFound,
                Some(bytes) => {
                    let mut tx = serde_json::from_slice::<Transaction>(&bytes)?;
                    match tx.status {
                        TxStatus::Settled => ClaimOutcome::AlreadySettled(Box::new(tx)),
                        TxStatus::Processing => {
                            let stale = stale_after
                                .is_some_and(|max_age| Utc::now() - tx.recorded_at >= max_age);
                            if !stale {
                                ClaimOutcome::InFlight
                            } else {
                                tx.recorded_at = Utc::now();
                                let json = serde_json::to_vec(&tx)?;
                                table.insert(key.as_str(), json.as_slice())?;
                                ClaimOutcome::Claimed(Box::new(tx))
                            }
                        }
                        TxStatus::Pending | TxStatus::Failed => {
                            tx.status = TxStatus::Processing;
                            tx.recorded_at = Utc::now();
                            let json = serde_json::to_vec(&tx)?;
                            table.insert(key.as_str(), json.as_slice())?;
                            ClaimOutcome::Claimed(Box::new(tx))
                        }
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Record the outcome of a settlement attempt and move the status to
    /// its terminal state (`Settled` on success, `Failed` otherwise).
    ///
    /// An already `Settled` record is never regressed; a late failure
    /// report against it is dropped.
    pub fn record_settlement(
        &self,
        merchant_id: &str,
        reference: &str,
        record: SettlementRecord,
    ) -> LedgerResult<Transaction> {
        let key = tx_key(merchant_id, reference);

        let write_txn = self.db.begin_write()?;
        let tx = {
            let mut table = write_txn.open_table(TRANSACTIONS)?;

            let existing_bytes = {
                let existing = table
                    .get(key.as_str())?
                    .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
                existing.value().to_vec()
            };

            let mut tx: Transaction = serde_json::from_slice(&existing_bytes)?;
            if tx.status != TxStatus::Settled {
                tx.status = match record.status {
                    SettlementStatus::Success => TxStatus::Settled,
                    SettlementStatus::Failed => TxStatus::Failed,
                };
                tx.settlement = Some(record);
                tx.recorded_at = Utc::now();
                let json = serde_json::to_vec(&tx)?;
                table.insert(key.as_str(), json.as_slice())?;
            }
            tx
        };
        write_txn.commit()?;
        Ok(tx)
    }

    /// Attach a dispatch failure (e.g. the settlement queue was full) to a
    /// record without touching its status. No-op on `Settled` records.
    pub fn note_dispatch_error(
        &self,
        merchant_id: &str,
        reference: &str,
        message: &str,
    ) -> LedgerResult<()> {
        let key = tx_key(merchant_id, reference);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRANSACTIONS)?;

            let existing_bytes = {
                let existing = table
                    .get(key.as_str())?
                    .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
                existing.value().to_vec()
            };

            let mut tx: Transaction = serde_json::from_slice(&existing_bytes)?;
            if tx.status != TxStatus::Settled {
                tx.settlement = Some(SettlementRecord::dispatch_error(message));
                let json = serde_json::to_vec(&tx)?;
                table.insert(key.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Paginated listing of records for a merchant wallet, newest first.
    ///
    /// Returns `(transactions, next_cursor)`.
    pub fn list_by_wallet(
        &self,
        wallet: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> LedgerResult<(Vec<Transaction>, Option<String>)> {
        let read_txn = self.db.begin_read()?;
        let idx_table = read_txn.open_table(WALLET_TX_INDEX)?;
        let tx_table = read_txn.open_table(TRANSACTIONS)?;

        let prefix = make_wallet_prefix(wallet);
        let prefix_end = make_wallet_prefix_end(wallet);

        // Resume strictly after the cursor key. The cursor entry itself may
        // have been relocated by a later upsert, so the range start must not
        // depend on it still existing.
        let start: Vec<u8> = match cursor.and_then(decode_cursor) {
            Some(mut after) => {
                after.push(0x00);
                after
            }
            None => prefix.clone(),
        };

        let mut results = Vec::with_capacity(limit);
        let mut last_key: Option<Vec<u8>> = None;

        for entry in idx_table.range(start.as_slice()..prefix_end.as_slice())? {
            let entry = entry?;
            let key_bytes = entry.0.value().to_vec();
            let tx_key = entry.1.value().to_string();

            if let Some(value) = tx_table.get(tx_key.as_str())? {
                results.push(serde_json::from_slice(value.value())?);
                last_key = Some(key_bytes);
            }

            if results.len() >= limit {
                break;
            }
        }

        let next_cursor = if results.len() >= limit {
            last_key.map(|k| encode_cursor(&k))
        } else {
            None
        };

        Ok((results, next_cursor))
    }

    /// List records whose event timestamp falls in `[from, to]`, oldest
    /// first, up to `limit`.
    pub fn list_by_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let read_txn = self.db.begin_read()?;
        let idx_table = read_txn.open_table(TIME_TX_INDEX)?;
        let tx_table = read_txn.open_table(TRANSACTIONS)?;

        let start = make_time_key(from.timestamp(), "");
        let end = make_time_key(to.timestamp() + 1, "");

        let mut results = Vec::new();
        for entry in idx_table.range(start.as_slice()..end.as_slice())? {
            let entry = entry?;
            let tx_key = entry.1.value().to_string();
            if let Some(value) = tx_table.get(tx_key.as_str())? {
                results.push(serde_json::from_slice(value.value())?);
            }
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Full-table scan for `Processing` records older than `older_than`.
    ///
    /// Returns `(merchant_id, reference)` pairs for the sweeper to re-queue.
    pub fn list_stuck_processing(
        &self,
        older_than: Duration,
    ) -> LedgerResult<Vec<(String, String)>> {
        let cutoff = Utc::now() - older_than;
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;

        let mut stuck = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let tx: Transaction = serde_json::from_slice(entry.1.value())?;
            if tx.status == TxStatus::Processing && tx.recorded_at <= cutoff {
                stuck.push((tx.merchant_id, tx.reference));
            }
        }
        Ok(stuck)
    }

    // =========================================================================
    // Listener checkpoint
    // =========================================================================

    /// Get the last ingested block number for a network.
    pub fn get_last_ingested_block(&self, network: &str) -> LedgerResult<u64> {
        let key = format!("last_block_{network}");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LISTENER_STATE)?;
        match table.get(key.as_str())? {
            Some(v) => {
                let bytes = v.value();
                if bytes.len() >= 8 {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&bytes[..8]);
                    Ok(u64::from_be_bytes(buf))
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    /// Persist the last ingested block number for a network.
    pub fn set_last_ingested_block(&self, network: &str, block: u64) -> LedgerResult<()> {
        let key = format!("last_block_{network}");
        let bytes = block.to_be_bytes();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LISTENER_STATE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// Cursor Encoding
// =============================================================================

fn encode_cursor(key: &[u8]) -> String {
    // Hex encoding for cursor (avoids a base64 dependency)
    alloy::hex::encode(key)
}

fn decode_cursor(cursor: &str) -> Option<Vec<u8>> {
    alloy::hex::decode(cursor).ok()
}

// =============================================================================
// Tests
// =============================================================================
