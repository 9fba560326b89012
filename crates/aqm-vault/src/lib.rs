//! aqm-vault
//!
//! The Private Key Vault: one sled database per recipient device, holding
//! hardware-encrypted private halves of minted keys with burn-after-use
//! semantics (§4.1). Every mutating operation — `store_key`, `burn_key`,
//! `purge_expired` — commits the entry change and its counter delta inside
//! a single sled transaction, so a concurrent `fetch_key` only ever observes
//! the before- or after-state, never a partial one.

pub mod db;

pub use db::{BurnOutcome, VaultDb};
