use std::path::Path;

use aqm_core::{AqmConfig, AqmError, KeyId, Tier, VaultEntry, VaultStats, VaultStatus};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use tracing::{debug, info};

const COUNTER_ACTIVE_GOLD: &[u8] = b"active_gold";
const COUNTER_ACTIVE_SILVER: &[u8] = b"active_silver";
const COUNTER_ACTIVE_BRONZE: &[u8] = b"active_bronze";
const COUNTER_TOTAL_BURNED: &[u8] = b"total_burned";
const COUNTER_TOTAL_EXPIRED: &[u8] = b"total_expired";

fn counter_key(tier: Tier) -> &'static [u8] {
    match tier {
        Tier::Gold => COUNTER_ACTIVE_GOLD,
        Tier::Silver => COUNTER_ACTIVE_SILVER,
        Tier::Bronze => COUNTER_ACTIVE_BRONZE,
    }
}

fn decode_u64(bytes: Option<sled::IVec>) -> u64 {
    match bytes {
        Some(b) if b.len() == 8 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&b);
            u64::from_be_bytes(arr)
        }
        _ => 0,
    }
}

fn encode_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Outcome of a `burn_key` call, distinguishing the two failure modes §7
/// requires callers to tell apart.
#[derive(Debug, PartialEq, Eq)]
pub enum BurnOutcome {
    Burned,
}

/// One private-key vault, backed by a sled database at `path` (or an
/// in-memory sled instance for tests).
pub struct VaultDb {
    _db: sled::Db,
    entries: sled::Tree,
    counters: sled::Tree,
    config: AqmConfig,
}

#[derive(Debug)]
enum TxAbort {
    AlreadyExists(String),
    NotFound(String),
    AlreadyBurned(String),
}

impl From<TxAbort> for AqmError {
    fn from(e: TxAbort) -> Self {
        match e {
            TxAbort::AlreadyExists(id) => AqmError::AlreadyExists(id),
            TxAbort::NotFound(id) => AqmError::NotFound(id),
            TxAbort::AlreadyBurned(id) => AqmError::AlreadyBurned(id),
        }
    }
}

impl VaultDb {
    /// Open or create the vault database at `path` with the given config.
    pub fn open<P: AsRef<Path>>(path: P, config: AqmConfig) -> Result<Self, AqmError> {
        let db = sled::open(path).map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Self::from_sled(db, config)
    }

    /// Build a vault over an already-open sled `Db` (e.g. an in-memory
    /// instance created with `sled::Config::new().temporary(true)` for tests).
    pub fn from_sled(db: sled::Db, config: AqmConfig) -> Result<Self, AqmError> {
        let entries = db
            .open_tree("entries")
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        let counters = db
            .open_tree("counters")
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            _db: db,
            entries,
            counters,
            config,
        })
    }

    // ── store_key ─────────────────────────────────────────────────────────────

    pub fn store_key(
        &self,
        key_id: KeyId,
        tier: Tier,
        encrypted_blob: Vec<u8>,
        iv: Vec<u8>,
        auth_tag: Vec<u8>,
        coin_version: String,
        now: i64,
    ) -> Result<(), AqmError> {
        let entry = VaultEntry {
            key_id: key_id.clone(),
            tier,
            encrypted_blob,
            iv,
            auth_tag,
            status: VaultStatus::Active,
            created_at: now,
            coin_version,
            expires_at: now + self.config.vault_key_ttl_seconds * 1000,
        };
        let entry_bytes = bincode::serialize(&entry).map_err(|e| AqmError::Serialization(e.to_string()))?;
        let key_bytes = key_id.as_str().as_bytes().to_vec();
        let ctr_key = counter_key(tier);

        let result: Result<(), TransactionError<TxAbort>> =
            (&self.entries, &self.counters).transaction(move |(entries, counters)| {
                if entries.get(&key_bytes)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(TxAbort::AlreadyExists(
                        key_id.to_string(),
                    )));
                }
                entries.insert(key_bytes.clone(), entry_bytes.clone())?;
                let cur = decode_u64(counters.get(ctr_key)?);
                counters.insert(ctr_key, encode_u64(cur + 1))?;
                Ok(())
            });

        match result {
            Ok(()) => {
                debug!(key_id = %entry.key_id, tier = %tier, "vault: stored key");
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e.into()),
            Err(TransactionError::Storage(e)) => Err(AqmError::StoreUnavailable(e.to_string())),
        }
    }

    // ── fetch_key ─────────────────────────────────────────────────────────────

    /// Pure read. Returns `Ok(None)` if absent or burned — a positive
    /// absence, never an error (§7 propagation policy).
    pub fn fetch_key(&self, key_id: &KeyId) -> Result<Option<VaultEntry>, AqmError> {
        match self
            .entries
            .get(key_id.as_str().as_bytes())
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
        {
            Some(bytes) => {
                let entry: VaultEntry =
                    bincode::deserialize(&bytes).map_err(|e| AqmError::Serialization(e.to_string()))?;
                if entry.status == VaultStatus::Burned {
                    Ok(None)
                } else {
                    Ok(Some(entry))
                }
            }
            None => Ok(None),
        }
    }

    pub fn exists(&self, key_id: &KeyId) -> Result<bool, AqmError> {
        Ok(self.fetch_key(key_id)?.is_some())
    }

    // ── burn_key ──────────────────────────────────────────────────────────────

    pub fn burn_key(&self, key_id: &KeyId, now: i64) -> Result<BurnOutcome, AqmError> {
        let key_bytes = key_id.as_str().as_bytes().to_vec();
        let grace_ms = self.config.vault_burn_grace_seconds * 1000;
        let id_for_err = key_id.to_string();

        let result: Result<Tier, TransactionError<TxAbort>> =
            (&self.entries, &self.counters).transaction(move |(entries, counters)| {
                let existing = entries.get(&key_bytes)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(TxAbort::NotFound(id_for_err.clone()))
                })?;
                let mut entry: VaultEntry = bincode::deserialize(&existing)
                    .expect("vault entry bytes are always valid bincode written by this crate");
                if entry.status == VaultStatus::Burned {
                    return Err(ConflictableTransactionError::Abort(TxAbort::AlreadyBurned(
                        id_for_err.clone(),
                    )));
                }
                let tier = entry.tier;
                entry.status = VaultStatus::Burned;
                entry.expires_at = now + grace_ms;
                let bytes = bincode::serialize(&entry)
                    .expect("vault entry always serializes");
                entries.insert(key_bytes.clone(), bytes)?;

                let ctr_key = counter_key(tier);
                let cur = decode_u64(counters.get(ctr_key)?);
                counters.insert(ctr_key, encode_u64(cur.saturating_sub(1)))?;
                let burned = decode_u64(counters.get(COUNTER_TOTAL_BURNED)?);
                counters.insert(COUNTER_TOTAL_BURNED, encode_u64(burned + 1))?;
                Ok(tier)
            });

        match result {
            Ok(tier) => {
                info!(key_id = %key_id, tier = %tier, "vault: burned key");
                Ok(BurnOutcome::Burned)
            }
            Err(TransactionError::Abort(e)) => Err(e.into()),
            Err(TransactionError::Storage(e)) => Err(AqmError::StoreUnavailable(e.to_string())),
        }
    }

    // ── counters / stats ──────────────────────────────────────────────────────

    pub fn count_active(&self, tier: Option<Tier>) -> Result<u64, AqmError> {
        match tier {
            Some(t) => Ok(decode_u64(
                self.counters
                    .get(counter_key(t))
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?,
            )),
            None => {
                let stats = self.get_stats()?;
                Ok(stats.total_active())
            }
        }
    }

    pub fn get_stats(&self) -> Result<VaultStats, AqmError> {
        let get = |k: &[u8]| -> Result<u64, AqmError> {
            Ok(decode_u64(
                self.counters
                    .get(k)
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?,
            ))
        };
        Ok(VaultStats {
            active_gold: get(COUNTER_ACTIVE_GOLD)?,
            active_silver: get(COUNTER_ACTIVE_SILVER)?,
            active_bronze: get(COUNTER_ACTIVE_BRONZE)?,
            total_burned: get(COUNTER_TOTAL_BURNED)?,
            total_expired: get(COUNTER_TOTAL_EXPIRED)?,
        })
    }

    /// Background-only scan: every key_id with status ACTIVE, optionally
    /// filtered to a single tier. O(n).
    pub fn get_all_active_ids(&self, tier: Option<Tier>) -> Result<Vec<KeyId>, AqmError> {
        let mut out = Vec::new();
        for item in self.entries.iter() {
            let (_, bytes) = item.map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
            let entry: VaultEntry =
                bincode::deserialize(&bytes).map_err(|e| AqmError::Serialization(e.to_string()))?;
            if entry.status != VaultStatus::Active {
                continue;
            }
            if let Some(t) = tier {
                if entry.tier != t {
                    continue;
                }
            }
            out.push(entry.key_id.clone());
        }
        Ok(out)
    }

    // ── purge_expired ─────────────────────────────────────────────────────────

    /// Safety net for lost TTLs: remove ACTIVE entries whose `created_at` is
    /// older than `now - max_age_days`, updating counters atomically per
    /// removed entry. Returns the count purged.
    pub fn purge_expired(&self, max_age_days: i64, now: i64) -> Result<u64, AqmError> {
        let cutoff = now - max_age_days * 24 * 3600 * 1000;
        let mut stale_ids: Vec<Vec<u8>> = Vec::new();
        for item in self.entries.iter() {
            let (key, bytes) = item.map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
            let entry: VaultEntry =
                bincode::deserialize(&bytes).map_err(|e| AqmError::Serialization(e.to_string()))?;
            if entry.status == VaultStatus::Active && entry.created_at < cutoff {
                stale_ids.push(key.to_vec());
            }
        }

        let mut purged = 0u64;
        for key_bytes in stale_ids {
            let result: Result<(), TransactionError<TxAbort>> =
                (&self.entries, &self.counters).transaction(|(entries, counters)| {
                    let Some(existing) = entries.get(&key_bytes)? else {
                        return Ok(());
                    };
                    let entry: VaultEntry = bincode::deserialize(&existing)
                        .expect("vault entry bytes are always valid bincode written by this crate");
                    if entry.status != VaultStatus::Active || entry.created_at >= cutoff {
                        // Raced with a burn or a concurrent purge; skip.
                        return Ok(());
                    }
                    entries.remove(&key_bytes)?;
                    let ctr_key = counter_key(entry.tier);
                    let cur = decode_u64(counters.get(ctr_key)?);
                    counters.insert(ctr_key, encode_u64(cur.saturating_sub(1)))?;
                    let expired = decode_u64(counters.get(COUNTER_TOTAL_EXPIRED)?);
                    counters.insert(COUNTER_TOTAL_EXPIRED, encode_u64(expired + 1))?;
                    Ok(())
                });
            match result {
                Ok(()) => purged += 1,
                Err(TransactionError::Storage(e)) => return Err(AqmError::StoreUnavailable(e.to_string())),
                Err(TransactionError::Abort(_)) => unreachable!("purge_expired never aborts"),
            }
        }
        info!(purged, max_age_days, "vault: purge_expired swept");
        Ok(purged)
    }

    /// Reap entries (ACTIVE or BURNED) whose `expires_at` has passed. This is
    /// the background maintenance sweep that actually executes the TTL the
    /// distilled spec describes as store-level; sled has no native per-key
    /// TTL, so the core runs this instead of relying on one.
    pub fn reap(&self, now: i64) -> Result<u64, AqmError> {
        let mut expired_ids: Vec<Vec<u8>> = Vec::new();
        for item in self.entries.iter() {
            let (key, bytes) = item.map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
            let entry: VaultEntry =
                bincode::deserialize(&bytes).map_err(|e| AqmError::Serialization(e.to_string()))?;
            if entry.expires_at <= now {
                expired_ids.push(key.to_vec());
            }
        }

        let mut reaped = 0u64;
        for key_bytes in expired_ids {
            let result: Result<(), TransactionError<TxAbort>> =
                (&self.entries, &self.counters).transaction(|(entries, counters)| {
                    let Some(existing) = entries.get(&key_bytes)? else {
                        return Ok(());
                    };
                    let entry: VaultEntry = bincode::deserialize(&existing)
                        .expect("vault entry bytes are always valid bincode written by this crate");
                    if entry.expires_at > now {
                        return Ok(());
                    }
                    entries.remove(&key_bytes)?;
                    if entry.status == VaultStatus::Active {
                        let ctr_key = counter_key(entry.tier);
                        let cur = decode_u64(counters.get(ctr_key)?);
                        counters.insert(ctr_key, encode_u64(cur.saturating_sub(1)))?;
                        let expired = decode_u64(counters.get(COUNTER_TOTAL_EXPIRED)?);
                        counters.insert(COUNTER_TOTAL_EXPIRED, encode_u64(expired + 1))?;
                    }
                    Ok(())
                });
            match result {
                Ok(()) => reaped += 1,
                Err(TransactionError::Storage(e)) => return Err(AqmError::StoreUnavailable(e.to_string())),
                Err(TransactionError::Abort(_)) => unreachable!("reap never aborts"),
            }
        }
        Ok(reaped)
    }

    pub fn flush(&self) -> Result<(), AqmError> {
        self._db
            .flush()
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// The configuration this vault was opened with, including
    /// `tier_sizes_bytes` — exposed so callers outside this crate (the
    /// Reporter) can read the effective tier sizes rather than re-deriving
    /// a default.
    pub fn config(&self) -> &AqmConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault() -> VaultDb {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("open in-memory sled db");
        VaultDb::from_sled(db, AqmConfig::default()).expect("build vault")
    }

    #[test]
    fn store_then_fetch_round_trips_byte_exact() {
        let vault = temp_vault();
        vault
            .store_key(
                KeyId::from("k1"),
                Tier::Gold,
                vec![1, 2, 3],
                vec![4, 5],
                vec![6, 7, 8, 9],
                "v1".into(),
                1_000,
            )
            .unwrap();
        let entry = vault.fetch_key(&KeyId::from("k1")).unwrap().unwrap();
        assert_eq!(entry.encrypted_blob, vec![1, 2, 3]);
        assert_eq!(entry.iv, vec![4, 5]);
        assert_eq!(entry.auth_tag, vec![6, 7, 8, 9]);
        assert_eq!(entry.tier, Tier::Gold);
    }

    #[test]
    fn duplicate_store_fails() {
        let vault = temp_vault();
        let key = KeyId::from("dup");
        vault
            .store_key(key.clone(), Tier::Silver, vec![], vec![], vec![], "v1".into(), 0)
            .unwrap();
        let err = vault
            .store_key(key, Tier::Silver, vec![], vec![], vec![], "v1".into(), 0)
            .unwrap_err();
        assert!(matches!(err, AqmError::AlreadyExists(_)));
    }

    #[test]
    fn p1_single_use_burn_is_irreversible() {
        let vault = temp_vault();
        let key = KeyId::from("single-use");
        vault
            .store_key(key.clone(), Tier::Bronze, vec![], vec![], vec![], "v1".into(), 0)
            .unwrap();
        assert!(vault.fetch_key(&key).unwrap().is_some());

        vault.burn_key(&key, 100).unwrap();
        assert!(vault.fetch_key(&key).unwrap().is_none());

        let err = vault.burn_key(&key, 200).unwrap_err();
        assert!(matches!(err, AqmError::AlreadyBurned(_)));
        assert!(vault.fetch_key(&key).unwrap().is_none());
    }

    #[test]
    fn p6_counters_track_active_population() {
        let vault = temp_vault();
        for i in 0..3 {
            vault
                .store_key(
                    KeyId::from(format!("g{i}")),
                    Tier::Gold,
                    vec![],
                    vec![],
                    vec![],
                    "v1".into(),
                    0,
                )
                .unwrap();
        }
        assert_eq!(vault.count_active(Some(Tier::Gold)).unwrap(), 3);

        vault.burn_key(&KeyId::from("g0"), 10).unwrap();
        let stats = vault.get_stats().unwrap();
        assert_eq!(stats.active_gold, 2);
        assert_eq!(stats.total_burned, 1);
    }

    #[test]
    fn burn_race_exactly_one_winner() {
        use std::sync::Arc;
        let vault = Arc::new(temp_vault());
        let key = KeyId::from("raced");
        vault
            .store_key(key.clone(), Tier::Silver, vec![], vec![], vec![], "v1".into(), 0)
            .unwrap();

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let vault = Arc::clone(&vault);
                let key = key.clone();
                std::thread::spawn(move || vault.burn_key(&key, 100 + i))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let already_burned = results
            .iter()
            .filter(|r| matches!(r, Err(AqmError::AlreadyBurned(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(already_burned, 4);

        let stats = vault.get_stats().unwrap();
        assert_eq!(stats.total_burned, 1);
        assert_eq!(stats.active_silver, 0);
    }

    #[test]
    fn burn_of_unknown_key_is_not_found_not_already_burned() {
        let vault = temp_vault();
        let err = vault.burn_key(&KeyId::from("never-stored"), 0).unwrap_err();
        assert!(matches!(err, AqmError::NotFound(_)));
    }

    #[test]
    fn purge_expired_only_touches_active_entries_past_cutoff() {
        let vault = temp_vault();
        vault
            .store_key(KeyId::from("old"), Tier::Bronze, vec![], vec![], vec![], "v1".into(), 0)
            .unwrap();
        vault
            .store_key(
                KeyId::from("new"),
                Tier::Bronze,
                vec![],
                vec![],
                vec![],
                "v1".into(),
                29 * 24 * 3600 * 1000,
            )
            .unwrap();

        let now = 31 * 24 * 3600 * 1000;
        let purged = vault.purge_expired(30, now).unwrap();
        assert_eq!(purged, 1);
        assert!(vault.fetch_key(&KeyId::from("old")).unwrap().is_none());
        assert!(vault.fetch_key(&KeyId::from("new")).unwrap().is_some());
    }
}
