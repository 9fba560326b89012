use serde::{Deserialize, Serialize};
use std::fmt;

/// Millisecond Unix timestamp, UTC.
pub type Timestamp = i64;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Opaque, unique-within-vault identifier for a single minted key pair.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

/// Identifies a contact (sender's inventory) or an owner (directory upload).
/// The two roles share one identifier space — a contact and an owner are the
/// same device, viewed from different ends of the bridge.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl ContactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContactId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContactId({})", self.0)
    }
}

// ── Tier / Priority ───────────────────────────────────────────────────────────

/// Cryptographic strength / byte-cost tier of a single-use key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Gold,
    Silver,
    Bronze,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Gold, Tier::Silver, Tier::Bronze];

    /// Lowercase wire/storage label, e.g. for sled key segments and the
    /// Directory's `tier` enum column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Gold => "gold",
            Tier::Silver => "silver",
            Tier::Bronze => "bronze",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-contact classification determining cache budgets (§4.2 budget table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Bestie,
    Mate,
    Stranger,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Bestie => "bestie",
            Priority::Mate => "mate",
            Priority::Stranger => "stranger",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Vault ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    Active,
    Burned,
}

/// One minted private key half, as held in the Vault.
///
/// The encrypted payload fields are wiped on drop, mirroring how the
/// crypto layer treats raw key material — even though these bytes are
/// already hardware-encrypted, there is no reason to let a stale copy
/// linger in freed memory.
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub key_id: KeyId,
    pub tier: Tier,
    pub encrypted_blob: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub status: VaultStatus,
    pub created_at: Timestamp,
    pub coin_version: String,
    /// Millis at which this row should be reaped by background maintenance.
    /// Set to `created_at + vault_key_ttl_seconds*1000` at store time, and
    /// shortened to `burn_time + vault_burn_grace_seconds*1000` on burn.
    pub expires_at: Timestamp,
}

impl fmt::Debug for VaultEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultEntry")
            .field("key_id", &self.key_id)
            .field("tier", &self.tier)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("coin_version", &self.coin_version)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Drop for VaultEntry {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.encrypted_blob.zeroize();
        self.iv.zeroize();
        self.auth_tag.zeroize();
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultStats {
    pub active_gold: u64,
    pub active_silver: u64,
    pub active_bronze: u64,
    pub total_burned: u64,
    pub total_expired: u64,
}

impl VaultStats {
    pub fn active_for(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Gold => self.active_gold,
            Tier::Silver => self.active_silver,
            Tier::Bronze => self.active_bronze,
        }
    }

    pub fn total_active(&self) -> u64 {
        self.active_gold + self.active_silver + self.active_bronze
    }
}

// ── Inventory ─────────────────────────────────────────────────────────────────

/// One cached public key half, as held in a sender's Inventory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub contact_id: ContactId,
    pub key_id: KeyId,
    pub tier: Tier,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub fetched_at: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactMeta {
    pub contact_id: ContactId,
    pub priority: Priority,
    pub last_msg_at: Timestamp,
    pub display_name: Option<String>,
}

/// Per-tier counts returned by `Inventory::get_inventory`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierCounts {
    pub gold: u32,
    pub silver: u32,
    pub bronze: u32,
}

impl TierCounts {
    pub fn get(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Gold => self.gold,
            Tier::Silver => self.silver,
            Tier::Bronze => self.bronze,
        }
    }

    pub fn set(&mut self, tier: Tier, value: u32) {
        match tier {
            Tier::Gold => self.gold = value,
            Tier::Silver => self.silver = value,
            Tier::Bronze => self.bronze = value,
        }
    }
}

// ── Directory ─────────────────────────────────────────────────────────────────

/// One uploaded public key half, as held in the server-side Directory.
/// `record_id` is the monotonic internal primary key assigned by the backing
/// relational store; it has no meaning outside that store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryRow {
    pub record_id: i64,
    pub owner_id: ContactId,
    pub key_id: KeyId,
    pub tier: Tier,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub uploaded_at: Timestamp,
    pub claimed_by: Option<ContactId>,
    pub claimed_at: Option<Timestamp>,
}

/// A freshly minted coin's public half, ready for `Directory::upload_coins`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewCoin {
    pub key_id: KeyId,
    pub tier: Tier,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Current millisecond timestamp. Centralized so every component reads the
/// clock the same way and so tests can inject a fixed value where needed.
pub fn now_millis() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as Timestamp
}
