// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Merchant Directory
//!
//! Read-only merchant registry. Merchant lifecycle (onboarding, payout
//! account changes) is owned by an external service; this engine only
//! reads, plus a startup sync that imports the service's JSON export.
//!
//! Lookups sit behind [`MerchantResolver`], which fronts the redb
//! directory with a small LRU+TTL cache — the settlement worker resolves
//! the same few merchants over and over.
//!
//! ## Table Layout
//!
//! - `merchants`: merchant_id → serialized Merchant
//! - `wallet_merchant_map`: lowercase wallet address → merchant_id

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use redb::{Database, ReadableDatabase, TableDefinition};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary table: merchant_id → serialized Merchant (JSON bytes).
const MERCHANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("merchants");

/// Map: lowercase wallet address → merchant_id.
const WALLET_MERCHANT_MAP: TableDefinition<&str, &str> =
    TableDefinition::new("wallet_merchant_map");

// =============================================================================
// Model
// =============================================================================

/// How and where a merchant wants to be paid out.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PayoutPreferences {
    /// Settlement currency (fiat code, or a token symbol for crypto payout).
    pub currency: String,
    /// Payout channel: `"crypto"` routes on-chain, anything else routes to
    /// the fiat transfer gateway.
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
}

/// A merchant as known to the settlement engine.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Merchant {
    pub merchant_id: String,
    pub business_name: String,
    /// On-chain receiving wallet, stored lower-cased. Unique across the
    /// directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    pub payout: PayoutPreferences,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
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

    #[error("cannot read merchants file: {0}")]
    Io(#[from] std::io::Error),
}

/// Merchant resolution failure, surfaced to producers before any ledger
/// write happens.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("merchant not found: {0}")]
    NotFound(String),

    #[error("invalid merchant query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

// =============================================================================
// MerchantDirectory
// =============================================================================

/// Embedded merchant registry.
pub struct MerchantDirectory {
    db: Database,
}

impl MerchantDirectory {
    /// Open (or create) the directory database at the given path.
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MERCHANTS)?;
            let _ = write_txn.open_table(WALLET_MERCHANT_MAP)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert or replace a merchant and its wallet mapping.
    pub fn upsert(&self, merchant: &Merchant) -> Result<(), DirectoryError> {
        let mut stored = merchant.clone();
        stored.wallet_address = stored.wallet_address.map(|w| w.to_lowercase());
        let json = serde_json::to_vec(&stored)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MERCHANTS)?;
            table.insert(stored.merchant_id.as_str(), json.as_slice())?;

            if let Some(wallet) = &stored.wallet_address {
                let mut map = write_txn.open_table(WALLET_MERCHANT_MAP)?;
                map.insert(wallet.as_str(), stored.merchant_id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a merchant by id.
    pub fn get(&self, merchant_id: &str) -> Result<Option<Merchant>, DirectoryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MERCHANTS)?;
        match table.get(merchant_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Look up a merchant by wallet address, case-insensitively.
    pub fn get_by_wallet(&self, wallet: &str) -> Result<Option<Merchant>, DirectoryError> {
        let addr = wallet.to_lowercase();
        let read_txn = self.db.begin_read()?;
        let map = read_txn.open_table(WALLET_MERCHANT_MAP)?;
        let merchant_id = match map.get(addr.as_str())? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        drop(map);
        let table = read_txn.open_table(MERCHANTS)?;
        match table.get(merchant_id.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Import a JSON array of merchants exported by the merchant service.
    ///
    /// Returns the number of merchants imported.
    pub fn import_file(&self, path: &Path) -> Result<usize, DirectoryError> {
        let data = std::fs::read_to_string(path)?;
        let merchants: Vec<Merchant> = serde_json::from_str(&data)?;
        for merchant in &merchants {
            self.upsert(merchant)?;
        }
        Ok(merchants.len())
    }
}

// =============================================================================
// Lookup cache
// =============================================================================

struct CacheEntry {
    merchant: Merchant,
    inserted_at: Instant,
}

/// In-process LRU cache for hot merchant lookups.
struct MerchantCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl MerchantCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or_else(|| NonZeroUsize::new(1).unwrap()),
            )),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Merchant> {
        let mut cache = self.cache.lock().ok()?;
        if let Some(entry) = cache.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.merchant.clone());
            }
            cache.pop(key);
        }
        None
    }

    fn put(&self, key: String, merchant: Merchant) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                key,
                CacheEntry {
                    merchant,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

// =============================================================================
// MerchantResolver
// =============================================================================

/// Default number of merchants held in the lookup cache.
const CACHE_CAPACITY: usize = 256;

/// Default TTL for cached merchant lookups.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolves events to merchants, caching directory reads.
pub struct MerchantResolver {
    directory: Arc<MerchantDirectory>,
    cache: MerchantCache,
}

impl MerchantResolver {
    pub fn new(directory: Arc<MerchantDirectory>) -> Self {
        Self {
            directory,
            cache: MerchantCache::new(CACHE_CAPACITY, CACHE_TTL),
        }
    }

    /// Resolve a merchant from whichever identifier the event carried.
    ///
    /// The id takes precedence; when both id and wallet are supplied the
    /// wallet is cross-checked against the directory record. An event
    /// naming no merchant at all, or naming an unknown one, is a hard
    /// error — no ledger write may happen for it.
    pub fn resolve(
        &self,
        merchant_id: Option<&str>,
        wallet_address: Option<&str>,
    ) -> Result<Merchant, ResolveError> {
        match (merchant_id, wallet_address) {
            (Some(id), wallet) => {
                let merchant = self
                    .lookup(&format!("id|{id}"), || self.directory.get(id))?
                    .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;

                if let Some(wallet) = wallet {
                    let claimed = wallet.to_lowercase();
                    if merchant.wallet_address.as_deref() != Some(claimed.as_str()) {
                        return Err(ResolveError::InvalidQuery(format!(
                            "wallet {claimed} does not belong to merchant {id}"
                        )));
                    }
                }
                Ok(merchant)
            }
            (None, Some(wallet)) => {
                let addr = wallet.to_lowercase();
                self.lookup(&format!("wallet|{addr}"), || {
                    self.directory.get_by_wallet(&addr)
                })?
                .ok_or(ResolveError::NotFound(addr))
            }
            (None, None) => Err(ResolveError::InvalidQuery(
                "event carries neither merchant id nor wallet".to_string(),
            )),
        }
    }

    /// Import the merchant service's JSON export and drop all cached
    /// lookups so stale payout preferences cannot be served.
    pub fn sync_from_file(&self, path: &Path) -> Result<usize, DirectoryError> {
        let imported = self.directory.import_file(path)?;
        self.cache.clear();
        Ok(imported)
    }

    fn lookup<F>(&self, cache_key: &str, load: F) -> Result<Option<Merchant>, DirectoryError>
    where
        F: FnOnce() -> Result<Option<Merchant>, DirectoryError>,
    {
        if let Some(hit) = self.cache.get(cache_key) {
            return Ok(Some(hit));
        }
        let loaded = load()?;
        if let Some(merchant) = &loaded {
            self.cache.put(cache_key.to_string(), merchant.clone());
        }
        Ok(loaded)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn sample_merchant(id: &str, wallet: Option<&str>) -> Merchant {
        Merchant {
            merchant_id: id.to_string(),
            business_name: format!("{id} Ltd"),
            wallet_address: wallet.map(str::to_string),
            payout: PayoutPreferences {
                currency: "NGN".to_string(),
                method: "bank_transfer".to_string(),
                account_number: Some("0690000040".to_string()),
                bank_code: Some("044".to_string()),
                account_name: Some(format!("{id} Ltd")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_merchant;
    use super::*;
    use std::io::Write as _;

    fn temp_resolver() -> (MerchantResolver, Arc<MerchantDirectory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let directory =
            Arc::new(MerchantDirectory::open(&dir.path().join("merchants.redb")).unwrap());
        (MerchantResolver::new(directory.clone()), directory, dir)
    }

    #[test]
    fn resolve_by_id() {
        let (resolver, directory, _dir) = temp_resolver();
        directory.upsert(&sample_merchant("merchant-1", None)).unwrap();

        let merchant = resolver.resolve(Some("merchant-1"), None).unwrap();
        assert_eq!(merchant.business_name, "merchant-1 Ltd");
    }

    #[test]
    fn resolve_by_wallet_is_case_insensitive() {
        let (resolver, directory, _dir) = temp_resolver();
        directory
            .upsert(&sample_merchant("merchant-1", Some("0xAbCd00000000000000000000000000000000AbCd")))
            .unwrap();

        let merchant = resolver
            .resolve(None, Some("0xABCD00000000000000000000000000000000ABCD"))
            .unwrap();
        assert_eq!(merchant.merchant_id, "merchant-1");
    }

    #[test]
    fn id_takes_precedence_and_wallet_is_cross_checked() {
        let (resolver, directory, _dir) = temp_resolver();
        directory
            .upsert(&sample_merchant("merchant-1", Some("0xaaaa")))
            .unwrap();

        assert!(resolver.resolve(Some("merchant-1"), Some("0xAAAA")).is_ok());

        let err = resolver
            .resolve(Some("merchant-1"), Some("0xbbbb"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidQuery(_)));
    }

    #[test]
    fn unknown_merchant_is_a_hard_error() {
        let (resolver, _directory, _dir) = temp_resolver();
        assert!(matches!(
            resolver.resolve(Some("ghost"), None),
            Err(ResolveError::NotFound(_))
        ));
        assert!(matches!(
            resolver.resolve(None, Some("0xdead")),
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn query_without_identifiers_is_invalid() {
        let (resolver, _directory, _dir) = temp_resolver();
        assert!(matches!(
            resolver.resolve(None, None),
            Err(ResolveError::InvalidQuery(_))
        ));
    }

    #[test]
    fn sync_imports_file_and_invalidates_cache() {
        let (resolver, directory, dir) = temp_resolver();
        directory.upsert(&sample_merchant("merchant-1", None)).unwrap();

        // Warm the cache with the original payout preferences.
        let before = resolver.resolve(Some("merchant-1"), None).unwrap();
        assert_eq!(before.payout.bank_code.as_deref(), Some("044"));

        let mut updated = sample_merchant("merchant-1", None);
        updated.payout.bank_code = Some("058".to_string());
        let path = dir.path().join("merchants.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(serde_json::to_string(&vec![updated]).unwrap().as_bytes())
            .unwrap();

        assert_eq!(resolver.sync_from_file(&path).unwrap(), 1);

        let after = resolver.resolve(Some("merchant-1"), None).unwrap();
        assert_eq!(after.payout.bank_code.as_deref(), Some("058"));
    }
}
