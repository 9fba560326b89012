//! The server-side coin pool (§4.3): idempotent upload plus the
//! skip-locked claim protocol that gives two concurrent `fetch_coins`
//! callers disjoint results without queuing on contended rows.

use aqm_core::{AqmError, ContactId, DirectoryRow, NewCoin, Tier};
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    DbErr, EntityTrait, Statement, Value,
};
use tracing::{debug, instrument, warn};

use crate::entity::{self as row, TierColumn};

pub struct Directory {
    db: DatabaseConnection,
}

fn map_db_err(e: DbErr) -> AqmError {
    AqmError::StoreUnavailable(e.to_string())
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

impl Directory {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Batch insert; duplicates on `(owner_id, key_id)` are silently
    /// dropped so device retries after ambiguous network failures are
    /// idempotent. Returns the count actually inserted.
    #[instrument(skip(self, batch), fields(owner = %owner_id, batch_len = batch.len()), err)]
    pub async fn upload_coins(
        &self,
        owner_id: &ContactId,
        batch: Vec<NewCoin>,
        now: i64,
    ) -> Result<u64, AqmError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let uploaded_at = millis_to_utc(now);
        let models = batch.into_iter().map(|coin| row::ActiveModel {
            owner_id: Set(owner_id.as_str().to_string()),
            key_id: Set(coin.key_id.as_str().to_string()),
            tier: Set(TierColumn::from(coin.tier)),
            public_key: Set(coin.public_key),
            signature: Set(coin.signature),
            uploaded_at: Set(uploaded_at),
            claimed_by: Set(None),
            claimed_at: Set(None),
            ..Default::default()
        });

        let result = row::Entity::insert_many(models)
            .on_conflict(
                OnConflict::columns([row::Column::OwnerId, row::Column::KeyId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await;

        match result {
            Ok(rows_affected) => Ok(rows_affected),
            // sea-orm returns this when every row in the batch collided —
            // zero rows inserted, not a failure.
            Err(DbErr::RecordNotInserted) => Ok(0),
            Err(e) => Err(map_db_err(e)),
        }
    }

    /// Atomically claims up to `n` oldest unclaimed rows for
    /// `(target_owner, tier)`. Rows already locked by another in-flight
    /// claim are skipped, not waited on — two concurrent callers receive
    /// disjoint subsets. Returning fewer than `n` is not an error.
    #[instrument(skip(self), fields(owner = %target_owner, requester = %requester_id, tier = %tier, n), err)]
    pub async fn fetch_coins(
        &self,
        target_owner: &ContactId,
        requester_id: &ContactId,
        tier: Tier,
        n: u64,
        now: i64,
    ) -> Result<Vec<DirectoryRow>, AqmError> {
        if n == 0 {
            return Ok(vec![]);
        }
        let claimed_at = millis_to_utc(now);
        let sql = r#"
            UPDATE directory_rows
            SET claimed_by = $1, claimed_at = $2
            WHERE record_id IN (
                SELECT record_id FROM directory_rows
                WHERE owner_id = $3 AND tier = $4::coin_tier AND claimed_by IS NULL
                ORDER BY uploaded_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING record_id, owner_id, key_id, tier, public_key, signature,
                      uploaded_at, claimed_by, claimed_at;
        "#;
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            [
                Value::from(requester_id.as_str().to_string()),
                Value::from(claimed_at),
                Value::from(target_owner.as_str().to_string()),
                Value::from(tier.as_str().to_string()),
                Value::from(n as i64),
            ],
        );

        let rows = row::Entity::find_by_statement(stmt)
            .all(&self.db)
            .await
            .map_err(map_db_err)?;

        debug!(owner = %target_owner, tier = %tier, claimed = rows.len(), "directory: fetch_coins");
        Ok(rows.into_iter().map(row::Model::into_directory_row).collect())
    }

    /// Per-tier count of unclaimed rows for `owner_id`.
    #[instrument(skip(self), fields(owner = %owner_id), err)]
    pub async fn inventory_count(&self, owner_id: &ContactId) -> Result<aqm_core::TierCounts, AqmError> {
        let mut counts = aqm_core::TierCounts::default();
        for tier in Tier::ALL {
            let sql = "SELECT count(*) AS cnt FROM directory_rows WHERE owner_id = $1 AND tier = $2::coin_tier AND claimed_by IS NULL";
            let stmt = Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                sql,
                [
                    Value::from(owner_id.as_str().to_string()),
                    Value::from(tier.as_str().to_string()),
                ],
            );
            let result = self.db.query_one(stmt).await.map_err(map_db_err)?;
            let count: i64 = match result {
                Some(r) => r.try_get_by("cnt").map_err(map_db_err)?,
                None => 0,
            };
            counts.set(tier, count.max(0) as u32);
        }
        Ok(counts)
    }

    /// Hard-deletes unclaimed rows older than `max_age_days`.
    #[instrument(skip(self), err)]
    pub async fn purge_stale(&self, max_age_days: i64, now: i64) -> Result<u64, AqmError> {
        let cutoff = millis_to_utc(now - max_age_days * 24 * 3600 * 1000);
        let sql = "DELETE FROM directory_rows WHERE claimed_by IS NULL AND uploaded_at < $1";
        let stmt = Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, [Value::from(cutoff)]);
        let result = self.db.execute(stmt).await.map_err(map_db_err)?;
        if result.rows_affected() > 0 {
            warn!(deleted = result.rows_affected(), "directory: purge_stale");
        }
        Ok(result.rows_affected())
    }

    /// Hard-deletes claimed rows whose `claimed_at` is older than the grace
    /// window — the second stage of the two-stage deletion.
    #[instrument(skip(self), err)]
    pub async fn hard_delete_claimed(&self, grace_hours: i64, now: i64) -> Result<u64, AqmError> {
        let cutoff = millis_to_utc(now - grace_hours * 3600 * 1000);
        let sql = "DELETE FROM directory_rows WHERE claimed_by IS NOT NULL AND claimed_at < $1";
        let stmt = Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, [Value::from(cutoff)]);
        let result = self.db.execute(stmt).await.map_err(map_db_err)?;
        Ok(result.rows_affected())
    }
}
