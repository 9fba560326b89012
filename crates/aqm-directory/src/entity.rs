//! `SeaORM` entity for the server-side coin pool (§4.3).

use sea_orm::entity::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "coin_tier")]
pub enum TierColumn {
    #[sea_orm(string_value = "gold")]
    Gold,
    #[sea_orm(string_value = "silver")]
    Silver,
    #[sea_orm(string_value = "bronze")]
    Bronze,
}

impl From<aqm_core::Tier> for TierColumn {
    fn from(t: aqm_core::Tier) -> Self {
        match t {
            aqm_core::Tier::Gold => TierColumn::Gold,
            aqm_core::Tier::Silver => TierColumn::Silver,
            aqm_core::Tier::Bronze => TierColumn::Bronze,
        }
    }
}

impl From<TierColumn> for aqm_core::Tier {
    fn from(t: TierColumn) -> Self {
        match t {
            TierColumn::Gold => aqm_core::Tier::Gold,
            TierColumn::Silver => aqm_core::Tier::Silver,
            TierColumn::Bronze => aqm_core::Tier::Bronze,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "directory_rows")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub record_id: i64,
    pub owner_id: String,
    pub key_id: String,
    pub tier: TierColumn,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub uploaded_at: DateTimeUtc,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_directory_row(self) -> aqm_core::DirectoryRow {
        aqm_core::DirectoryRow {
            record_id: self.record_id,
            owner_id: aqm_core::ContactId::from(self.owner_id),
            key_id: aqm_core::KeyId::from(self.key_id),
            tier: self.tier.into(),
            public_key: self.public_key,
            signature: self.signature,
            uploaded_at: self.uploaded_at.timestamp_millis(),
            claimed_by: self.claimed_by.map(aqm_core::ContactId::from),
            claimed_at: self.claimed_at.map(|t| t.timestamp_millis()),
        }
    }
}
