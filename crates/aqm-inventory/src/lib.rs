//! aqm-inventory
//!
//! The Public Key Inventory: a per-contact, per-tier cache of public keys
//! with budget caps and FIFO consumption (§4.2). Backed by a sled database
//! with four trees — `contacts`, `keys`, `index`, `sizes` — where `index`
//! plays the role of a score-ordered set (sled's B-tree key ordering over a
//! big-endian `fetched_at` prefix gives oldest-first / newest-first walks
//! in O(log n)) and `sizes` is the watched counter for optimistic locking.

pub mod db;
pub mod keys;

pub use db::{InventoryDb, InventoryView};
