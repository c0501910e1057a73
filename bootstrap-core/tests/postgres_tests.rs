//! Tests against a live Postgres. Run with
//! `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.

use bootstrap_core::command::ManageCommand;
use bootstrap_core::db::{CacheTableAction, DbPool, PgSeedStore};
use bootstrap_core::seed::{AdminAccount, CreateResult, Department, SeedDepartmentsAction, SeedRecord, SeedStore};
use bootstrap_core::steps::StepAction;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

async fn test_pool() -> Option<DbPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("TEST_DATABASE_URL must point at a reachable database");
    Some(pool)
}

async fn count(pool: &DbPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn test_department_seed_twice_leaves_count_unchanged() {
    let Some(pool) = test_pool().await else {
        return;
    };

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS departments (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(100) NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            floor_number INTEGER NOT NULL CHECK (floor_number >= 0),
            phone_extension VARCHAR(10) NOT NULL DEFAULT '',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let manage = ManageCommand::parse("true", Duration::from_secs(5)).unwrap();
    let store = Arc::new(PgSeedStore::new(pool.clone(), manage));
    let action = SeedDepartmentsAction::new(store, Department::defaults());

    action.run().await.unwrap();
    let after_first = count(&pool, "departments").await;
    let detail = action.run().await.unwrap();
    let after_second = count(&pool, "departments").await;

    assert_eq!(after_first, after_second);
    assert!(after_first >= Department::defaults().len() as i64);
    assert_eq!(detail.as_deref(), Some("0 created, 6 already existed"));
}

#[tokio::test]
#[ignore]
async fn test_cache_table_creation_is_idempotent() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let action = CacheTableAction::new(pool.clone(), "bootstrap_test_cache");
    action.run().await.unwrap();
    action.run().await.unwrap();

    assert_eq!(count(&pool, "bootstrap_test_cache").await, 0);
    sqlx::query(r#"DROP TABLE "bootstrap_test_cache""#)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_created_admin_gets_admin_role() {
    let Some(pool) = test_pool().await else {
        return;
    };

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            username VARCHAR(150) NOT NULL UNIQUE,
            role VARCHAR(20) NOT NULL DEFAULT 'patient'
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    // Stand-in for createsuperuser: the row appears with the default role.
    let username = "bootstrap_test_admin";
    sqlx::query("DELETE FROM users WHERE username = $1")
        .bind(username)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO users (username) VALUES ($1)")
        .bind(username)
        .execute(&pool)
        .await
        .unwrap();

    let manage = ManageCommand::parse("true", Duration::from_secs(5)).unwrap();
    let store = PgSeedStore::new(pool.clone(), manage);
    let account = AdminAccount {
        username: username.to_string(),
        email: "admin@hospital.com".to_string(),
        password: "s3cret".to_string(),
        fallback_password: false,
    };

    let created = store.create(&SeedRecord::AdminAccount(account)).await.unwrap();
    let role: String = sqlx::query_scalar("SELECT role FROM users WHERE username = $1")
        .bind(username)
        .fetch_one(&pool)
        .await
        .unwrap();

    assert_eq!(created, CreateResult::Created);
    assert_eq!(role, "admin");
    sqlx::query("DELETE FROM users WHERE username = $1")
        .bind(username)
        .execute(&pool)
        .await
        .unwrap();
}
