//! aqm-bridge
//!
//! Glue protocol moving coins between the server-side Directory and a
//! device's local Inventory/Vault (§4.4).

pub mod bridge;

pub use bridge::{fetch_and_cache, sync_inventory, upload_coins, MintedCoin};
