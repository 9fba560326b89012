//! aqm-gc
//!
//! Inventory garbage collection (§4.6): reclaims cached keys for contacts
//! that have gone quiet, so a device's local cache doesn't grow unbounded
//! across its whole contact list.

use aqm_core::{AqmConfig, AqmError, ContactId, Priority, Tier};
use aqm_inventory::InventoryDb;
use tracing::info;

/// What happens to an inactive contact's meta row once its keys are swept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Downgrade to STRANGER and keep the meta row (re-earns budget on
    /// the next message).
    DowngradeToStranger,
    /// Drop the meta row entirely.
    DeleteMeta,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub contacts_cleaned: u64,
    pub keys_deleted: u64,
    pub bytes_freed: u64,
}

/// Every registered contact whose `last_msg_at` is more than `inactive_days`
/// old — the set both `garbage_collect` and `dry_run` sweep, so the two
/// can't drift on what counts as "inactive".
fn inactive_contacts(
    inventory: &InventoryDb,
    inactive_days: i64,
    now: i64,
) -> Result<Vec<aqm_core::ContactMeta>, AqmError> {
    let cutoff_ms = inactive_days * 24 * 3600 * 1000;
    Ok(inventory
        .list_contacts()?
        .into_iter()
        .filter(|meta| now - meta.last_msg_at > cutoff_ms)
        .collect())
}

/// Sweeps every contact whose `last_msg_at` is more than `inactive_days`
/// old: deletes all three tier indexes and every hash prefixed by that
/// contact, then applies `retention` to the meta row.
pub fn garbage_collect(
    inventory: &InventoryDb,
    config: &AqmConfig,
    retention: RetentionPolicy,
    inactive_days: i64,
    now: i64,
) -> Result<GcReport, AqmError> {
    let mut report = GcReport::default();

    for meta in inactive_contacts(inventory, inactive_days, now)? {
        let (keys_deleted, bytes_freed) = purge_one(inventory, &meta.contact_id, config)?;
        apply_retention(inventory, &meta.contact_id, retention)?;

        report.contacts_cleaned += 1;
        report.keys_deleted += keys_deleted;
        report.bytes_freed += bytes_freed;
    }

    if report.contacts_cleaned > 0 {
        info!(
            contacts_cleaned = report.contacts_cleaned,
            keys_deleted = report.keys_deleted,
            bytes_freed = report.bytes_freed,
            "gc: inactive contacts swept"
        );
    }
    Ok(report)
}

/// Manual purge of a single contact (e.g. after the user blocks them),
/// regardless of activity recency.
pub fn collect_single_contact(
    inventory: &InventoryDb,
    config: &AqmConfig,
    retention: RetentionPolicy,
    contact_id: &ContactId,
) -> Result<GcReport, AqmError> {
    let (keys_deleted, bytes_freed) = purge_one(inventory, contact_id, config)?;
    apply_retention(inventory, contact_id, retention)?;
    Ok(GcReport {
        contacts_cleaned: 1,
        keys_deleted,
        bytes_freed,
    })
}

/// Preview of what `garbage_collect` would do, without mutating anything.
pub fn dry_run(inventory: &InventoryDb, config: &AqmConfig, inactive_days: i64, now: i64) -> Result<GcReport, AqmError> {
    let mut report = GcReport::default();

    for meta in inactive_contacts(inventory, inactive_days, now)? {
        let counts = match inventory.get_inventory(Some(&meta.contact_id))? {
            aqm_inventory::InventoryView::ForContact(c) => c,
            aqm_inventory::InventoryView::AllContacts(_) => unreachable!(),
        };
        report.contacts_cleaned += 1;
        for tier in Tier::ALL {
            let n = counts.get(tier) as u64;
            report.keys_deleted += n;
            report.bytes_freed += n * config.tier_sizes_bytes.get(tier);
        }
    }
    Ok(report)
}

fn purge_one(inventory: &InventoryDb, contact_id: &ContactId, config: &AqmConfig) -> Result<(u64, u64), AqmError> {
    let before = match inventory.get_inventory(Some(contact_id))? {
        aqm_inventory::InventoryView::ForContact(c) => c,
        aqm_inventory::InventoryView::AllContacts(_) => unreachable!(),
    };
    let mut bytes_freed = 0u64;
    for tier in Tier::ALL {
        bytes_freed += before.get(tier) as u64 * config.tier_sizes_bytes.get(tier);
    }
    let keys_deleted = inventory.purge_contact_keys(contact_id)?;
    Ok((keys_deleted, bytes_freed))
}

fn apply_retention(inventory: &InventoryDb, contact_id: &ContactId, retention: RetentionPolicy) -> Result<(), AqmError> {
    match retention {
        RetentionPolicy::DowngradeToStranger => {
            inventory.set_contact_priority(contact_id, Priority::Stranger)
        }
        RetentionPolicy::DeleteMeta => inventory.remove_contact(contact_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqm_core::KeyId;

    fn temp_inventory() -> InventoryDb {
        let db = sled::Config::new().temporary(true).open().expect("open in-memory sled db");
        InventoryDb::from_sled(db, AqmConfig::default()).expect("build inventory")
    }

    #[test]
    fn inactive_contact_is_swept_and_downgraded() {
        let inv = temp_inventory();
        let config = AqmConfig::default();
        let bob = ContactId::from("bob");
        inv.register_contact(bob.clone(), Priority::Bestie, None, 0).unwrap();
        inv.store_key(&bob, KeyId::from("g0"), Tier::Gold, vec![], vec![], 0).unwrap();
        inv.store_key(&bob, KeyId::from("s0"), Tier::Silver, vec![], vec![], 0).unwrap();

        let now = 31 * 24 * 3600 * 1000;
        let report = garbage_collect(&inv, &config, RetentionPolicy::DowngradeToStranger, 30, now).unwrap();

        assert_eq!(report.contacts_cleaned, 1);
        assert_eq!(report.keys_deleted, 2);
        assert_eq!(report.bytes_freed, 4_096 + 2_048);

        let meta = inv.get_contact(&bob).unwrap().unwrap();
        assert_eq!(meta.priority, Priority::Stranger);
        assert!(!inv.has_keys_for(&bob).unwrap());
    }

    #[test]
    fn active_contact_is_left_alone() {
        let inv = temp_inventory();
        let config = AqmConfig::default();
        let bob = ContactId::from("bob");
        inv.register_contact(bob.clone(), Priority::Bestie, None, 0).unwrap();
        inv.store_key(&bob, KeyId::from("g0"), Tier::Gold, vec![], vec![], 0).unwrap();

        let now = 5 * 24 * 3600 * 1000;
        let report = garbage_collect(&inv, &config, RetentionPolicy::DowngradeToStranger, 30, now).unwrap();
        assert_eq!(report.contacts_cleaned, 0);
        assert!(inv.has_keys_for(&bob).unwrap());
    }

    #[test]
    fn dry_run_matches_what_a_real_collect_would_report() {
        let inv = temp_inventory();
        let config = AqmConfig::default();
        let bob = ContactId::from("bob");
        inv.register_contact(bob.clone(), Priority::Bestie, None, 0).unwrap();
        inv.store_key(&bob, KeyId::from("g0"), Tier::Gold, vec![], vec![], 0).unwrap();

        let now = 31 * 24 * 3600 * 1000;
        let preview = dry_run(&inv, &config, 30, now).unwrap();
        assert_eq!(preview.contacts_cleaned, 1);
        assert_eq!(preview.keys_deleted, 1);

        // The preview must not have mutated anything.
        assert!(inv.has_keys_for(&bob).unwrap());
    }

    #[test]
    fn collect_single_contact_ignores_activity_recency() {
        let inv = temp_inventory();
        let config = AqmConfig::default();
        let bob = ContactId::from("bob");
        inv.register_contact(bob.clone(), Priority::Bestie, None, 0).unwrap();
        inv.store_key(&bob, KeyId::from("g0"), Tier::Gold, vec![], vec![], 0).unwrap();

        let report = collect_single_contact(&inv, &config, RetentionPolicy::DeleteMeta, &bob).unwrap();
        assert_eq!(report.contacts_cleaned, 1);
        assert!(inv.get_contact(&bob).unwrap().is_none());
    }
}
