//! The priority×tier budget table (§4.2, §6 "budget_caps") and the
//! downward-only fallback chain used by `select_coin` (§4.2, §4.5, GLOSSARY
//! "Fallback order").

use serde::{Deserialize, Serialize};

use crate::types::{Priority, Tier};

/// The priority×tier budget matrix, one of the configuration knobs
/// enumerated in §6 ("budget_caps ... The priority×tier matrix"). Carried
/// on `AqmConfig` rather than hardcoded, so an integrator can override the
/// table (e.g. a looser BESTIE cap for a high-storage device class)
/// without forking this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetCaps {
    pub bestie_gold: u32,
    pub bestie_silver: u32,
    pub bestie_bronze: u32,
    pub mate_gold: u32,
    pub mate_silver: u32,
    pub mate_bronze: u32,
    pub stranger_gold: u32,
    pub stranger_silver: u32,
    pub stranger_bronze: u32,
}

impl Default for BudgetCaps {
    /// The fixed table from §4.2.
    fn default() -> Self {
        Self {
            bestie_gold: 5,
            bestie_silver: 4,
            bestie_bronze: 1,
            mate_gold: 0,
            mate_silver: 6,
            mate_bronze: 4,
            stranger_gold: 0,
            stranger_silver: 0,
            stranger_bronze: 0,
        }
    }
}

impl BudgetCaps {
    pub fn get(&self, priority: Priority, tier: Tier) -> u32 {
        match (priority, tier) {
            (Priority::Bestie, Tier::Gold) => self.bestie_gold,
            (Priority::Bestie, Tier::Silver) => self.bestie_silver,
            (Priority::Bestie, Tier::Bronze) => self.bestie_bronze,

            (Priority::Mate, Tier::Gold) => self.mate_gold,
            (Priority::Mate, Tier::Silver) => self.mate_silver,
            (Priority::Mate, Tier::Bronze) => self.mate_bronze,

            (Priority::Stranger, Tier::Gold) => self.stranger_gold,
            (Priority::Stranger, Tier::Silver) => self.stranger_silver,
            (Priority::Stranger, Tier::Bronze) => self.stranger_bronze,
        }
    }
}

/// Maximum number of cached keys for a `(priority, tier)` cell under `caps`.
/// A cap of 0 means `store_key` always fails `BudgetExceeded` for that cell.
pub fn budget_cap(caps: &BudgetCaps, priority: Priority, tier: Tier) -> u32 {
    caps.get(priority, tier)
}

/// The fixed downward-only fallback chain for `select_coin`, starting with
/// `desired` itself. GOLD tries GOLD, SILVER, BRONZE; SILVER tries SILVER,
/// BRONZE; BRONZE tries only BRONZE. Never falls back upward.
pub fn fallback_chain(desired: Tier) -> &'static [Tier] {
    match desired {
        Tier::Gold => &[Tier::Gold, Tier::Silver, Tier::Bronze],
        Tier::Silver => &[Tier::Silver, Tier::Bronze],
        Tier::Bronze => &[Tier::Bronze],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bestie_caps_match_table() {
        let caps = BudgetCaps::default();
        assert_eq!(budget_cap(&caps, Priority::Bestie, Tier::Gold), 5);
        assert_eq!(budget_cap(&caps, Priority::Bestie, Tier::Silver), 4);
        assert_eq!(budget_cap(&caps, Priority::Bestie, Tier::Bronze), 1);
    }

    #[test]
    fn mate_has_no_gold() {
        let caps = BudgetCaps::default();
        assert_eq!(budget_cap(&caps, Priority::Mate, Tier::Gold), 0);
        assert_eq!(budget_cap(&caps, Priority::Mate, Tier::Silver), 6);
        assert_eq!(budget_cap(&caps, Priority::Mate, Tier::Bronze), 4);
    }

    #[test]
    fn stranger_has_no_budget_at_all() {
        let caps = BudgetCaps::default();
        for tier in Tier::ALL {
            assert_eq!(budget_cap(&caps, Priority::Stranger, tier), 0);
        }
    }

    #[test]
    fn override_caps_are_honored() {
        let mut caps = BudgetCaps::default();
        caps.bestie_gold = 8;
        assert_eq!(budget_cap(&caps, Priority::Bestie, Tier::Gold), 8);
    }

    #[test]
    fn fallback_never_goes_upward() {
        assert_eq!(fallback_chain(Tier::Bronze), &[Tier::Bronze]);
        assert_eq!(fallback_chain(Tier::Silver), &[Tier::Silver, Tier::Bronze]);
        assert_eq!(
            fallback_chain(Tier::Gold),
            &[Tier::Gold, Tier::Silver, Tier::Bronze]
        );
    }
}
