use thiserror::Error;

use crate::types::Tier;

#[derive(Debug, Error)]
pub enum AqmError {
    // ── Storage ───────────────────────────────────────────────────────────────
    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ── Vault ─────────────────────────────────────────────────────────────────
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already burned: {0}")]
    AlreadyBurned(String),

    // ── Inventory ─────────────────────────────────────────────────────────────
    #[error("contact not registered: {0}")]
    NotRegistered(String),

    #[error("budget exceeded for contact {contact} tier {tier}: {current}/{cap}")]
    BudgetExceeded {
        contact: String,
        tier: Tier,
        current: u32,
        cap: u32,
    },

    #[error("optimistic lock retries exhausted for contact {contact} tier {tier}")]
    ConcurrencyError { contact: String, tier: Tier },

    // ── General ───────────────────────────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}
