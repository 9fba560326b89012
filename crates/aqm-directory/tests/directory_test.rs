//! Integration tests for the fetch_coins claim protocol. These need a real
//! Postgres instance — point `DATABASE_URL` at one (no trailing database
//! name) to run them.

use aqm_core::{ContactId, NewCoin, Tier};
use aqm_directory::{Directory, Migrator};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use sea_orm_migration::MigratorTrait;

struct TestDb {
    name: String,
    base_url: String,
    conn: DatabaseConnection,
}

impl TestDb {
    async fn new(name: &str) -> Self {
        let base_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set to run aqm-directory integration tests");
        let admin = Database::connect(&base_url)
            .await
            .expect("connect to postgres for test db setup");
        let db_name = format!("aqm_directory_test_{name}");
        Self::drop_database(&admin, &db_name).await.unwrap();
        Self::create_database(&admin, &db_name).await.unwrap();

        let db_url = format!("{base_url}/{db_name}");
        let conn = Database::connect(&db_url).await.expect("connect to fresh test db");
        Migrator::up(&conn, None).await.expect("run migrations");

        Self {
            name: db_name,
            base_url,
            conn,
        }
    }

    async fn create_database(db: &DatabaseConnection, name: &str) -> Result<(), DbErr> {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            format!("CREATE DATABASE {name}"),
        ))
        .await?;
        Ok(())
    }

    async fn drop_database(db: &DatabaseConnection, name: &str) -> Result<(), DbErr> {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)"),
        ))
        .await?;
        Ok(())
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let base_url = self.base_url.clone();
        let name = self.name.clone();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                if let Ok(admin) = Database::connect(&base_url).await {
                    let _ = TestDb::drop_database(&admin, &name).await;
                }
            });
        })
        .join()
        .ok();
    }
}

fn coin(key_id: &str, tier: Tier) -> NewCoin {
    NewCoin {
        key_id: key_id.into(),
        tier,
        public_key: vec![1, 2, 3],
        signature: vec![4, 5, 6],
    }
}

#[tokio::test]
async fn upload_is_idempotent_on_owner_and_key_id() {
    let db = TestDb::new("idempotent_upload").await;
    let directory = Directory::new(db.conn.clone());
    let owner = ContactId::from("alice");

    let inserted = directory
        .upload_coins(&owner, vec![coin("k1", Tier::Gold)], 1_000)
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    // Retry with the same (owner, key_id): silently absorbed, no error, no duplicate.
    let inserted_again = directory
        .upload_coins(&owner, vec![coin("k1", Tier::Gold)], 1_000)
        .await
        .unwrap();
    assert_eq!(inserted_again, 0);

    let counts = directory.inventory_count(&owner).await.unwrap();
    assert_eq!(counts.gold, 1);
}

#[tokio::test]
async fn fetch_coins_claims_are_disjoint_across_concurrent_callers() {
    use std::sync::Arc;

    let db = TestDb::new("disjoint_claims").await;
    let directory = Arc::new(Directory::new(db.conn.clone()));
    let owner = ContactId::from("bob");

    let batch: Vec<_> = (0..20).map(|i| coin(&format!("s{i}"), Tier::Silver)).collect();
    directory.upload_coins(&owner, batch, 0).await.unwrap();

    // §8 scenario 5: 20 concurrent single-coin claims on the same
    // (owner, tier) must race on the real SKIP LOCKED path — each task
    // runs on its own pooled connection so the claims genuinely overlap,
    // not just run back-to-back on one connection.
    let mut handles = Vec::with_capacity(20);
    for i in 0..20 {
        let directory = Arc::clone(&directory);
        let owner = owner.clone();
        let requester = ContactId::from(format!("device-{i}"));
        handles.push(tokio::spawn(async move {
            directory
                .fetch_coins(&owner, &requester, Tier::Silver, 1, 100)
                .await
                .unwrap()
        }));
    }

    let mut claimed_ids = Vec::with_capacity(20);
    for handle in handles {
        let rows = handle.await.unwrap();
        assert_eq!(rows.len(), 1, "every requester should claim exactly one of the 20 rows");
        claimed_ids.push(rows[0].key_id.clone());
    }

    let unique: std::collections::HashSet<_> = claimed_ids.iter().collect();
    assert_eq!(unique.len(), 20, "P2: the 20 returned key_ids must form a set of size 20");

    let remaining = directory.inventory_count(&owner).await.unwrap();
    assert_eq!(remaining.silver, 0);
}

#[tokio::test]
async fn p9_same_key_id_is_fine_across_different_owners() {
    let db = TestDb::new("cross_owner_key_id").await;
    let directory = Directory::new(db.conn.clone());
    let alice = ContactId::from("alice");
    let eve = ContactId::from("eve");

    // The uniqueness constraint is scoped to (owner_id, key_id), not
    // key_id alone — a burned/reused key_id on one device's vault must
    // not collide with the same key_id minted by a different owner here.
    let inserted_alice = directory
        .upload_coins(&alice, vec![coin("reused-id", Tier::Gold)], 0)
        .await
        .unwrap();
    let inserted_eve = directory
        .upload_coins(&eve, vec![coin("reused-id", Tier::Gold)], 0)
        .await
        .unwrap();
    assert_eq!(inserted_alice, 1);
    assert_eq!(inserted_eve, 1);

    let alice_counts = directory.inventory_count(&alice).await.unwrap();
    let eve_counts = directory.inventory_count(&eve).await.unwrap();
    assert_eq!(alice_counts.gold, 1);
    assert_eq!(eve_counts.gold, 1);
}

#[tokio::test]
async fn purge_stale_only_removes_old_unclaimed_rows() {
    let db = TestDb::new("purge_stale").await;
    let directory = Directory::new(db.conn.clone());
    let owner = ContactId::from("carol");

    directory
        .upload_coins(&owner, vec![coin("old", Tier::Bronze)], 0)
        .await
        .unwrap();
    directory
        .upload_coins(&owner, vec![coin("new", Tier::Bronze)], 29 * 24 * 3600 * 1000)
        .await
        .unwrap();

    let now = 31 * 24 * 3600 * 1000;
    let deleted = directory.purge_stale(30, now).await.unwrap();
    assert_eq!(deleted, 1);

    let counts = directory.inventory_count(&owner).await.unwrap();
    assert_eq!(counts.bronze, 1);
}

#[tokio::test]
async fn hard_delete_claimed_respects_grace_window() {
    let db = TestDb::new("hard_delete_claimed").await;
    let directory = Directory::new(db.conn.clone());
    let owner = ContactId::from("dave");
    let requester = ContactId::from("device-a");

    directory
        .upload_coins(&owner, vec![coin("k1", Tier::Gold)], 0)
        .await
        .unwrap();
    directory
        .fetch_coins(&owner, &requester, Tier::Gold, 1, 0)
        .await
        .unwrap();

    let now = 2 * 3600 * 1000;
    let deleted = directory.hard_delete_claimed(1, now).await.unwrap();
    assert_eq!(deleted, 1);
}
