use std::collections::HashMap;
use std::path::Path;

use aqm_core::{
    budget_cap, fallback_chain, AqmConfig, AqmError, ContactId, ContactMeta, InventoryEntry,
    KeyId, Priority, Tier, TierCounts,
};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use tracing::{debug, warn};

use crate::keys::{contact_key, index_key, index_prefix, keys_key, size_key};

#[derive(Clone, Serialize, Deserialize)]
struct StoredKeyPayload {
    public_key: Vec<u8>,
    signature: Vec<u8>,
    fetched_at: i64,
}

fn decode_u32(bytes: Option<sled::IVec>) -> u32 {
    match bytes {
        Some(b) if b.len() == 4 => {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&b);
            u32::from_be_bytes(arr)
        }
        _ => 0,
    }
}

fn encode_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

/// What a caller gets back from `get_inventory`.
pub enum InventoryView {
    ForContact(TierCounts),
    AllContacts(HashMap<ContactId, TierCounts>),
}

#[derive(Debug)]
enum TxAbort {
    /// Watched size counter moved (or cap exceeded on recheck) — retry.
    Retry,
    BudgetExceeded { current: u32, cap: u32 },
}

/// The Public Key Inventory for one sender device.
pub struct InventoryDb {
    _db: sled::Db,
    contacts: sled::Tree,
    keys: sled::Tree,
    index: sled::Tree,
    sizes: sled::Tree,
    config: AqmConfig,
}

impl InventoryDb {
    pub fn open<P: AsRef<Path>>(path: P, config: AqmConfig) -> Result<Self, AqmError> {
        let db = sled::open(path).map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Self::from_sled(db, config)
    }

    pub fn from_sled(db: sled::Db, config: AqmConfig) -> Result<Self, AqmError> {
        let contacts = db
            .open_tree("contacts")
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        let keys = db
            .open_tree("keys")
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        let index = db
            .open_tree("index")
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        let sizes = db
            .open_tree("sizes")
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            _db: db,
            contacts,
            keys,
            index,
            sizes,
            config,
        })
    }

    // ── Contacts ──────────────────────────────────────────────────────────────

    /// Idempotent: returns `true` if this call created the meta, `false` if
    /// it already existed (a no-op).
    pub fn register_contact(
        &self,
        contact_id: ContactId,
        priority: Priority,
        display_name: Option<String>,
        now: i64,
    ) -> Result<bool, AqmError> {
        let key = contact_key(&contact_id);
        let meta = ContactMeta {
            contact_id,
            priority,
            last_msg_at: now,
            display_name,
        };
        let bytes = bincode::serialize(&meta).map_err(|e| AqmError::Serialization(e.to_string()))?;
        // compare_and_swap(None -> Some(bytes)) is the atomic check-and-set:
        // it only writes if the key is still absent, so two concurrent
        // callers for the same unregistered contact can never both win —
        // exactly one creates the meta, the other observes it already exists.
        match self.contacts.compare_and_swap(&key, None as Option<&[u8]>, Some(bytes)) {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(e) => Err(AqmError::StoreUnavailable(e.to_string())),
        }
    }

    pub fn get_contact(&self, contact_id: &ContactId) -> Result<Option<ContactMeta>, AqmError> {
        match self
            .contacts
            .get(contact_key(contact_id))
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| AqmError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Atomically updates priority. On downgrade, each tier's index is
    /// synchronously trimmed to the new cap by evicting newest-first
    /// (ZPOPMAX semantics). On upgrade, caps rise immediately — the Bridge
    /// fills the gap asynchronously.
    pub fn set_contact_priority(&self, contact_id: &ContactId, priority: Priority) -> Result<(), AqmError> {
        let mut meta = self
            .get_contact(contact_id)?
            .ok_or_else(|| AqmError::NotRegistered(contact_id.to_string()))?;
        let old_priority = meta.priority;
        meta.priority = priority;
        let bytes = bincode::serialize(&meta).map_err(|e| AqmError::Serialization(e.to_string()))?;
        self.contacts
            .insert(contact_key(contact_id), bytes)
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;

        let caps = &self.config.budget_caps;
        let downgraded = Tier::ALL.iter().any(|&t| budget_cap(caps, priority, t) < budget_cap(caps, old_priority, t));
        if downgraded {
            for tier in Tier::ALL {
                let cap = budget_cap(caps, priority, tier);
                self.trim_to_cap(contact_id, tier, cap)?;
            }
        }
        Ok(())
    }

    /// Evicts newest-first until the tier's index size is <= `cap`.
    fn trim_to_cap(&self, contact_id: &ContactId, tier: Tier, cap: u32) -> Result<(), AqmError> {
        loop {
            let size = decode_u32(
                self.sizes
                    .get(size_key(contact_id, tier))
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?,
            );
            if size <= cap {
                return Ok(());
            }
            if self.pop_newest(contact_id, tier)?.is_none() {
                // Index and counter disagree — nothing left to evict.
                return Ok(());
            }
        }
    }

    // ── store_key (optimistic locking) ───────────────────────────────────────

    pub fn store_key(
        &self,
        contact_id: &ContactId,
        key_id: KeyId,
        tier: Tier,
        public_key: Vec<u8>,
        signature: Vec<u8>,
        now: i64,
    ) -> Result<(), AqmError> {
        let meta = self
            .get_contact(contact_id)?
            .ok_or_else(|| AqmError::NotRegistered(contact_id.to_string()))?;
        let cap = budget_cap(&self.config.budget_caps, meta.priority, tier);
        if cap == 0 {
            return Err(AqmError::BudgetExceeded {
                contact: contact_id.to_string(),
                tier,
                current: 0,
                cap: 0,
            });
        }

        let size_k = size_key(contact_id, tier);
        let keys_k = keys_key(contact_id, tier, &key_id);
        let index_k = index_key(contact_id, tier, now, &key_id);
        let payload = StoredKeyPayload {
            public_key,
            signature,
            fetched_at: now,
        };
        let payload_bytes =
            bincode::serialize(&payload).map_err(|e| AqmError::Serialization(e.to_string()))?;

        let max_attempts = self.config.inventory_optimistic_lock_retries.max(1);
        for attempt in 0..max_attempts {
            let watched = self
                .sizes
                .get(&size_k)
                .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
            let current = decode_u32(watched.clone());
            if current >= cap {
                return Err(AqmError::BudgetExceeded {
                    contact: contact_id.to_string(),
                    tier,
                    current,
                    cap,
                });
            }

            let size_k2 = size_k.clone();
            let keys_k2 = keys_k.clone();
            let index_k2 = index_k.clone();
            let payload_bytes2 = payload_bytes.clone();
            let watched2 = watched.clone();
            let new_size = encode_u32(current + 1);

            let result: Result<(), TransactionError<TxAbort>> =
                (&self.keys, &self.index, &self.sizes).transaction(move |(kt, it, st)| {
                    // Re-check the watched counter inside the transaction —
                    // this is the "abort if watched key changed" guard.
                    let now_val = st.get(&size_k2)?;
                    if now_val.as_deref() != watched2.as_deref() {
                        return Err(ConflictableTransactionError::Abort(TxAbort::Retry));
                    }
                    let current = decode_u32(now_val);
                    if current >= cap {
                        return Err(ConflictableTransactionError::Abort(TxAbort::BudgetExceeded {
                            current,
                            cap,
                        }));
                    }
                    kt.insert(keys_k2.clone(), payload_bytes2.clone())?;
                    it.insert(index_k2.clone(), keys_k2.clone())?;
                    st.insert(size_k2.clone(), new_size)?;
                    Ok(())
                });

            match result {
                Ok(()) => {
                    debug!(contact = %contact_id, tier = %tier, attempt, "inventory: stored key");
                    return Ok(());
                }
                Err(TransactionError::Abort(TxAbort::Retry)) => continue,
                Err(TransactionError::Abort(TxAbort::BudgetExceeded { current, cap })) => {
                    return Err(AqmError::BudgetExceeded {
                        contact: contact_id.to_string(),
                        tier,
                        current,
                        cap,
                    })
                }
                Err(TransactionError::Storage(e)) => return Err(AqmError::StoreUnavailable(e.to_string())),
            }
        }

        warn!(contact = %contact_id, tier = %tier, "inventory: optimistic lock retries exhausted");
        Err(AqmError::ConcurrencyError {
            contact: contact_id.to_string(),
            tier,
        })
    }

    // ── select_coin ───────────────────────────────────────────────────────────

    /// Atomic pop of the oldest entry in `desired_tier`, falling back to
    /// lower tiers in the fixed downward-only order if empty. Updates
    /// `last_msg_at` on any success. Never falls back upward.
    pub fn select_coin(
        &self,
        contact_id: &ContactId,
        desired_tier: Tier,
        now: i64,
    ) -> Result<Option<InventoryEntry>, AqmError> {
        for &tier in fallback_chain(desired_tier) {
            if let Some(entry) = self.pop_oldest(contact_id, tier)? {
                self.touch_last_msg_at(contact_id, now)?;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Explicit removal of a specific key, e.g. when a selected key was
    /// later rejected by the caller. Absence is a positive result, not an
    /// error.
    pub fn consume_key(&self, contact_id: &ContactId, tier: Tier, key_id: &KeyId) -> Result<bool, AqmError> {
        let keys_k = keys_key(contact_id, tier, key_id);
        let Some(payload_bytes) = self
            .keys
            .get(&keys_k)
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
        else {
            return Ok(false);
        };
        let payload: StoredKeyPayload =
            bincode::deserialize(&payload_bytes).map_err(|e| AqmError::Serialization(e.to_string()))?;
        let index_k = index_key(contact_id, tier, payload.fetched_at, key_id);
        let size_k = size_key(contact_id, tier);

        let result: Result<Option<()>, TransactionError<()>> =
            (&self.keys, &self.index, &self.sizes).transaction(move |(kt, it, st)| {
                if kt.get(&keys_k)?.is_none() {
                    // Raced away (e.g. by a concurrent select_coin) since
                    // the read above — nothing to remove.
                    return Ok(None);
                }
                kt.remove(&keys_k)?;
                it.remove(&index_k)?;
                let cur = decode_u32(st.get(&size_k)?);
                st.insert(&size_k, encode_u32(cur.saturating_sub(1)))?;
                Ok(Some(()))
            });
        match result {
            Ok(removed) => Ok(removed.is_some()),
            Err(TransactionError::Storage(e)) => Err(AqmError::StoreUnavailable(e.to_string())),
            Err(TransactionError::Abort(())) => unreachable!(),
        }
    }

    fn pop_oldest(&self, contact_id: &ContactId, tier: Tier) -> Result<Option<InventoryEntry>, AqmError> {
        self.pop_edge(contact_id, tier, true)
    }

    fn pop_newest(&self, contact_id: &ContactId, tier: Tier) -> Result<Option<InventoryEntry>, AqmError> {
        self.pop_edge(contact_id, tier, false)
    }

    /// Peek-then-transactional-delete: find the oldest (`front`) or newest
    /// index entry by range scan, then remove it inside a transaction that
    /// re-verifies it is still present. If a concurrent caller raced it
    /// away, the transaction aborts and the scan retries — this is the
    /// "atomic pop" primitive built from sled's actual transactional API.
    fn pop_edge(
        &self,
        contact_id: &ContactId,
        tier: Tier,
        front: bool,
    ) -> Result<Option<InventoryEntry>, AqmError> {
        let prefix = index_prefix(contact_id, tier);
        loop {
            let candidate = if front {
                self.index
                    .scan_prefix(&prefix)
                    .next()
                    .transpose()
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
            } else {
                self.index
                    .scan_prefix(&prefix)
                    .next_back()
                    .transpose()
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
            };
            let Some((idx_key, keys_key_bytes)) = candidate else {
                return Ok(None);
            };

            let size_k = size_key(contact_id, tier);
            let idx_key_owned = idx_key.to_vec();
            let keys_key_owned = keys_key_bytes.to_vec();

            let result: Result<Option<Vec<u8>>, TransactionError<TxAbort>> =
                (&self.keys, &self.index, &self.sizes).transaction(move |(kt, it, st)| {
                    if it.get(&idx_key_owned)?.is_none() {
                        return Err(ConflictableTransactionError::Abort(TxAbort::Retry));
                    }
                    let Some(payload) = kt.get(&keys_key_owned)? else {
                        return Err(ConflictableTransactionError::Abort(TxAbort::Retry));
                    };
                    it.remove(&idx_key_owned)?;
                    kt.remove(&keys_key_owned)?;
                    let cur = decode_u32(st.get(&size_k)?);
                    st.insert(&size_k, encode_u32(cur.saturating_sub(1)))?;
                    Ok(Some(payload.to_vec()))
                });

            match result {
                Ok(Some(payload_bytes)) => {
                    let payload: StoredKeyPayload = bincode::deserialize(&payload_bytes)
                        .map_err(|e| AqmError::Serialization(e.to_string()))?;
                    // Recover key_id — it's the suffix of the `keys` key after
                    // the `contact \0 tier \0` prefix written in keys::keys_key.
                    let key_id = recover_key_id(&keys_key_owned, contact_id, tier);
                    return Ok(Some(InventoryEntry {
                        contact_id: contact_id.clone(),
                        key_id,
                        tier,
                        public_key: payload.public_key,
                        signature: payload.signature,
                        fetched_at: payload.fetched_at,
                    }));
                }
                Ok(None) => unreachable!("transaction always returns Some on commit"),
                Err(TransactionError::Abort(TxAbort::Retry)) => continue,
                Err(TransactionError::Abort(TxAbort::BudgetExceeded { .. })) => unreachable!(),
                Err(TransactionError::Storage(e)) => return Err(AqmError::StoreUnavailable(e.to_string())),
            }
        }
    }

    fn touch_last_msg_at(&self, contact_id: &ContactId, now: i64) -> Result<(), AqmError> {
        if let Some(mut meta) = self.get_contact(contact_id)? {
            meta.last_msg_at = now;
            let bytes = bincode::serialize(&meta).map_err(|e| AqmError::Serialization(e.to_string()))?;
            self.contacts
                .insert(contact_key(contact_id), bytes)
                .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    // ── Reporting-facing reads ────────────────────────────────────────────────

    pub fn get_inventory(&self, contact_id: Option<&ContactId>) -> Result<InventoryView, AqmError> {
        match contact_id {
            Some(c) => Ok(InventoryView::ForContact(self.tier_counts(c)?)),
            None => {
                let mut out = HashMap::new();
                for item in self.contacts.iter() {
                    let (_, bytes) = item.map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
                    let meta: ContactMeta = bincode::deserialize(&bytes)
                        .map_err(|e| AqmError::Serialization(e.to_string()))?;
                    let counts = self.tier_counts(&meta.contact_id)?;
                    out.insert(meta.contact_id, counts);
                }
                Ok(InventoryView::AllContacts(out))
            }
        }
    }

    fn tier_counts(&self, contact_id: &ContactId) -> Result<TierCounts, AqmError> {
        let mut counts = TierCounts::default();
        for tier in Tier::ALL {
            let size = decode_u32(
                self.sizes
                    .get(size_key(contact_id, tier))
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?,
            );
            counts.set(tier, size);
        }
        Ok(counts)
    }

    pub fn has_keys_for(&self, contact_id: &ContactId) -> Result<bool, AqmError> {
        let counts = self.tier_counts(contact_id)?;
        Ok(counts.gold > 0 || counts.silver > 0 || counts.bronze > 0)
    }

    pub fn get_available_tiers(&self, contact_id: &ContactId) -> Result<Vec<Tier>, AqmError> {
        let counts = self.tier_counts(contact_id)?;
        Ok(Tier::ALL.into_iter().filter(|&t| counts.get(t) > 0).collect())
    }

    pub fn flush(&self) -> Result<(), AqmError> {
        self._db
            .flush()
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// The configuration this inventory was opened with, including the
    /// budget caps — exposed so callers outside this crate (the Bridge,
    /// the Reporter) can read the same effective `budget_caps` this store
    /// enforces rather than re-deriving a default.
    pub fn config(&self) -> &AqmConfig {
        &self.config
    }

    // ── GC support ────────────────────────────────────────────────────────────

    /// Every registered contact's meta. Background-only, O(n).
    pub fn list_contacts(&self) -> Result<Vec<ContactMeta>, AqmError> {
        let mut out = Vec::new();
        for item in self.contacts.iter() {
            let (_, bytes) = item.map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
            out.push(bincode::deserialize(&bytes).map_err(|e| AqmError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    /// Deletes every `keys`/`index`/`sizes` entry prefixed by `contact_id`
    /// across all three tiers, returning the number of keys deleted. The
    /// contact's meta row itself is left untouched — callers decide
    /// separately whether to downgrade or drop it (§4.6).
    pub fn purge_contact_keys(&self, contact_id: &ContactId) -> Result<u64, AqmError> {
        let mut deleted = 0u64;
        for tier in Tier::ALL {
            let prefix = index_prefix(contact_id, tier);
            let index_keys: Vec<Vec<u8>> = self
                .index
                .scan_prefix(&prefix)
                .keys()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
                .into_iter()
                .map(|k| k.to_vec())
                .collect();
            for idx_key in index_keys {
                if let Some(keys_key_bytes) = self
                    .index
                    .remove(&idx_key)
                    .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?
                {
                    self.keys
                        .remove(keys_key_bytes.as_ref())
                        .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
                    deleted += 1;
                }
            }
            self.sizes
                .remove(size_key(contact_id, tier))
                .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        }
        Ok(deleted)
    }

    /// Removes the contact's meta row entirely (used when GC is configured
    /// to drop rather than downgrade an inactive contact).
    pub fn remove_contact(&self, contact_id: &ContactId) -> Result<(), AqmError> {
        self.contacts
            .remove(contact_key(contact_id))
            .map_err(|e| AqmError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// The `keys` tree key layout is `contact \0 tier \0 key_id`; strip the
/// known-length prefix to recover the `key_id` suffix.
fn recover_key_id(keys_key_bytes: &[u8], contact_id: &ContactId, tier: Tier) -> KeyId {
    let prefix_len = keys_key(contact_id, tier, &KeyId::from("")).len();
    let suffix = &keys_key_bytes[prefix_len..];
    KeyId::from(String::from_utf8_lossy(suffix).to_string())
}
