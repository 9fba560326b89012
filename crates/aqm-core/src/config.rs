use serde::{Deserialize, Serialize};

use crate::budget::BudgetCaps;
use crate::types::Tier;
use crate::AqmError;

/// Frozen configuration for the whole AQM core (§6). Constructed once by the
/// integrator and passed by reference into every component — there is no
/// global mutable config singleton.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AqmConfig {
    /// Active Vault entry expiry, seconds. Default 30 days.
    pub vault_key_ttl_seconds: i64,
    /// Retention after burn before hard removal, seconds. Default 60s.
    pub vault_burn_grace_seconds: i64,
    /// Cutoff for contact GC: days of inactivity. Default 30 days.
    pub inventory_gc_inactive_days: i64,
    /// Max optimistic-lock retries before `ConcurrencyError`. Default 3.
    pub inventory_optimistic_lock_retries: u32,
    /// Unclaimed Directory row cutoff, days. Default 30 days.
    pub directory_purge_stale_days: i64,
    /// Claimed Directory row grace window, hours. Default 1 hour.
    pub directory_hard_delete_grace_hours: i64,
    /// Fixed per-tier size estimate in bytes, for storage reports.
    pub tier_sizes_bytes: TierSizes,
    /// The priority×tier budget matrix (§4.2).
    pub budget_caps: BudgetCaps,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSizes {
    pub gold: u64,
    pub silver: u64,
    pub bronze: u64,
}

impl TierSizes {
    pub fn get(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Gold => self.gold,
            Tier::Silver => self.silver,
            Tier::Bronze => self.bronze,
        }
    }
}

impl Default for TierSizes {
    fn default() -> Self {
        // Dilithium2 + Kyber-class public key + signature, rounded up.
        Self {
            gold: 4_096,
            silver: 2_048,
            bronze: 1_024,
        }
    }
}

impl Default for AqmConfig {
    fn default() -> Self {
        Self {
            vault_key_ttl_seconds: 30 * 24 * 3600,
            vault_burn_grace_seconds: 60,
            inventory_gc_inactive_days: 30,
            inventory_optimistic_lock_retries: 3,
            directory_purge_stale_days: 30,
            directory_hard_delete_grace_hours: 1,
            tier_sizes_bytes: TierSizes::default(),
            budget_caps: BudgetCaps::default(),
        }
    }
}

impl AqmConfig {
    /// Parses a frozen config value out of a JSON document (e.g. a deploy's
    /// `aqm-config.json`). Any field omitted from the document keeps its
    /// `Default` value by loading onto a default and overlaying the parsed
    /// partial document.
    pub fn from_json_str(s: &str) -> Result<Self, AqmError> {
        serde_json::from_str(s).map_err(|e| AqmError::Serialization(e.to_string()))
    }

    /// Serializes this config to pretty-printed JSON, for writing out the
    /// effective configuration at startup (an operator-facing audit trail,
    /// not a runtime mutation path — the core never re-reads it).
    pub fn to_json_string(&self) -> Result<String, AqmError> {
        serde_json::to_string_pretty(self).map_err(|e| AqmError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_overlays_onto_defaults() {
        let cfg = AqmConfig::from_json_str(r#"{"vault_burn_grace_seconds": 120}"#).unwrap();
        assert_eq!(cfg.vault_burn_grace_seconds, 120);
        assert_eq!(cfg.vault_key_ttl_seconds, AqmConfig::default().vault_key_ttl_seconds);
        assert_eq!(cfg.inventory_optimistic_lock_retries, 3);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = AqmConfig::default();
        let json = cfg.to_json_string().unwrap();
        let back = AqmConfig::from_json_str(&json).unwrap();
        assert_eq!(back.vault_key_ttl_seconds, cfg.vault_key_ttl_seconds);
        assert_eq!(back.tier_sizes_bytes.gold, cfg.tier_sizes_bytes.gold);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let err = AqmConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, AqmError::Serialization(_)));
    }

    #[test]
    fn partial_budget_caps_overlay_onto_defaults() {
        let cfg = AqmConfig::from_json_str(r#"{"budget_caps": {"bestie_gold": 8}}"#).unwrap();
        assert_eq!(cfg.budget_caps.bestie_gold, 8);
        assert_eq!(cfg.budget_caps.bestie_silver, BudgetCaps::default().bestie_silver);
        assert_eq!(cfg.budget_caps.mate_silver, 6);
    }
}
