//! aqm-reporter
//!
//! Pure aggregation over Vault and Inventory state (§4.7): storage
//! utilization, per-contact breakdowns, and the replenishment deficit that
//! drives `Bridge::sync_inventory`. Reads only — never mutates either store.

use std::collections::HashMap;

use aqm_core::{AqmConfig, AqmError, ContactId, Priority, Tier, TierCounts};
use aqm_inventory::{InventoryDb, InventoryView};
use aqm_vault::VaultDb;
use serde::Serialize;

/// Aggregate storage figures across the whole Vault.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StorageReport {
    pub total_bytes: u64,
    pub budget_bytes: u64,
    /// `total_bytes / budget_bytes`, expressed as parts-per-10000 to avoid
    /// floating point in a report that may be logged or diffed.
    pub utilization_bps: u64,
    pub active_gold: u64,
    pub active_silver: u64,
    pub active_bronze: u64,
}

/// Per-contact cache breakdown plus the per-tier shortfall against that
/// contact's budget.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ContactReport {
    pub counts: TierCounts,
    pub deficit: TierCounts,
}

/// Computes Vault-wide storage utilization against `budget_bytes`.
pub fn storage_report(vault: &VaultDb, budget_bytes: u64) -> Result<StorageReport, AqmError> {
    let stats = vault.get_stats()?;
    let config = vault.config();
    let total_bytes = stats.active_gold * config.tier_sizes_bytes.get(Tier::Gold)
        + stats.active_silver * config.tier_sizes_bytes.get(Tier::Silver)
        + stats.active_bronze * config.tier_sizes_bytes.get(Tier::Bronze);
    let utilization_bps = if budget_bytes == 0 {
        0
    } else {
        total_bytes.saturating_mul(10_000) / budget_bytes
    };
    Ok(StorageReport {
        total_bytes,
        budget_bytes,
        utilization_bps,
        active_gold: stats.active_gold,
        active_silver: stats.active_silver,
        active_bronze: stats.active_bronze,
    })
}

/// Per-tier replenishment deficit for one contact: `max(0, cap - current)`.
pub fn contact_deficit(inventory: &InventoryDb, contact_id: &ContactId, priority: Priority) -> Result<ContactReport, AqmError> {
    let counts = match inventory.get_inventory(Some(contact_id))? {
        InventoryView::ForContact(c) => c,
        InventoryView::AllContacts(_) => unreachable!("get_inventory(Some(_)) always returns ForContact"),
    };
    let mut deficit = TierCounts::default();
    for tier in Tier::ALL {
        let cap = aqm_core::budget_cap(&inventory.config().budget_caps, priority, tier);
        deficit.set(tier, cap.saturating_sub(counts.get(tier)));
    }
    Ok(ContactReport { counts, deficit })
}

/// Per-contact breakdown across the whole Inventory. The deficit here
/// requires each contact's `Priority`, which the caller supplies via
/// `priorities` (keyed by contact) since `InventoryDb` alone already
/// carries it per contact meta — this just avoids a second store round
/// trip per contact when the caller already has it cached.
pub fn all_contacts_report(inventory: &InventoryDb) -> Result<HashMap<ContactId, ContactReport>, AqmError> {
    let mut out = HashMap::new();
    for meta in inventory.list_contacts()? {
        let report = contact_deficit(inventory, &meta.contact_id, meta.priority)?;
        out.insert(meta.contact_id, report);
    }
    Ok(out)
}
