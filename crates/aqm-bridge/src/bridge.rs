//! Glue protocol between Inventory and Directory (§4.4). Kept as free
//! functions over the three stores rather than a stateful wrapper — there
//! is no bridge-owned state, only the sequencing of calls across them.

use aqm_core::{AqmError, ContactId, KeyId, NewCoin, Tier};
use aqm_directory::Directory;
use aqm_inventory::InventoryDb;
use aqm_vault::VaultDb;
use tracing::{info, warn};

/// Both halves of one freshly minted single-use key, as produced by the
/// device's crypto layer ahead of a call to `upload_coins`.
#[derive(Clone)]
pub struct MintedCoin {
    pub key_id: KeyId,
    pub tier: Tier,
    pub encrypted_blob: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub coin_version: String,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Claims up to `n` coins from the Directory on `target_owner`'s behalf and
/// caches each into the local Inventory. Stops early, discarding any
/// remaining claimed-but-uncached rows, the moment `BudgetExceeded` is hit —
/// the caps are already satisfied, so the surplus claim is an acceptable
/// loss rather than something worth retrying. Returns the count cached.
pub async fn fetch_and_cache(
    directory: &Directory,
    inventory: &InventoryDb,
    target_owner: &ContactId,
    self_id: &ContactId,
    tier: Tier,
    n: u64,
    now: i64,
) -> Result<u64, AqmError> {
    let rows = directory
        .fetch_coins(target_owner, self_id, tier, n, now)
        .await?;
    if rows.len() as u64 != n {
        info!(target = %target_owner, tier = %tier, requested = n, claimed = rows.len(), "bridge: directory had fewer coins than requested");
    }

    let mut cached = 0u64;
    for row in rows {
        match inventory.store_key(target_owner, row.key_id, row.tier, row.public_key, row.signature, now) {
            Ok(()) => cached += 1,
            Err(AqmError::BudgetExceeded { .. }) => {
                warn!(target = %target_owner, tier = %tier, "bridge: budget satisfied mid-fetch, discarding remainder");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(cached)
}

/// Stores the private half of every minted coin in the Vault, then uploads
/// the public halves as a batch to the Directory. If the Vault write fails
/// for any entry the whole minting batch is aborted — a coin must never be
/// advertised in the Directory without a private half to back it. If the
/// Directory upload itself fails, the private halves remain vaulted; a
/// retry will dedupe on `(owner_id, key_id)`.
pub async fn upload_coins(
    vault: &VaultDb,
    directory: &Directory,
    owner_id: &ContactId,
    minted: Vec<MintedCoin>,
    now: i64,
) -> Result<u64, AqmError> {
    let mut public_batch = Vec::with_capacity(minted.len());
    for coin in &minted {
        vault.store_key(
            coin.key_id.clone(),
            coin.tier,
            coin.encrypted_blob.clone(),
            coin.iv.clone(),
            coin.auth_tag.clone(),
            coin.coin_version.clone(),
            now,
        )?;
        public_batch.push(NewCoin {
            key_id: coin.key_id.clone(),
            tier: coin.tier,
            public_key: coin.public_key.clone(),
            signature: coin.signature.clone(),
        });
    }

    directory.upload_coins(owner_id, public_batch, now).await
}

/// Reconciles the local cache for `contact` against their priority's
/// budget: fetches the deficit for every tier that is short.
pub async fn sync_inventory(
    directory: &Directory,
    inventory: &InventoryDb,
    contact: &ContactId,
    self_id: &ContactId,
    now: i64,
) -> Result<u64, AqmError> {
    let meta = inventory
        .get_contact(contact)?
        .ok_or_else(|| AqmError::NotRegistered(contact.to_string()))?;

    let mut total_fetched = 0u64;
    for tier in Tier::ALL {
        let cap = aqm_core::budget_cap(&inventory.config().budget_caps, meta.priority, tier);
        let current = inventory_tier_count(inventory, contact, tier)?;
        let deficit = cap.saturating_sub(current);
        if deficit > 0 {
            total_fetched += fetch_and_cache(directory, inventory, contact, self_id, tier, deficit as u64, now).await?;
        }
    }
    Ok(total_fetched)
}

fn inventory_tier_count(inventory: &InventoryDb, contact: &ContactId, tier: Tier) -> Result<u32, AqmError> {
    match inventory.get_inventory(Some(contact))? {
        aqm_inventory::InventoryView::ForContact(counts) => Ok(counts.get(tier)),
        aqm_inventory::InventoryView::AllContacts(_) => unreachable!("get_inventory(Some(_)) always returns ForContact"),
    }
}
