use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Liveness probe for health endpoints.
pub async fn ping(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS statements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            statement_ref TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            total_rows INTEGER NOT NULL DEFAULT 0,
            imported_rows INTEGER NOT NULL DEFAULT 0,
            skipped_rows INTEGER NOT NULL DEFAULT 0,
            errored_rows INTEGER NOT NULL DEFAULT 0,
            start_date TEXT,
            end_date TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bank_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            statement_ref TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            description TEXT NOT NULL,
            counterparty TEXT,
            memo TEXT,
            check_number TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (statement_ref, line_no)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_type TEXT NOT NULL,
            counterparty TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            date TEXT NOT NULL,
            reference TEXT,
            is_open INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id INTEGER NOT NULL REFERENCES bank_transactions(id),
            record_type TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0,
            user_override INTEGER NOT NULL DEFAULT 0,
            supersedes INTEGER REFERENCES matches(id),
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One active match per transaction, enforced where it matters: in the
    // database, so concurrent writers hit the constraint rather than racing
    // an application-level check.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_one_active
        ON matches(transaction_id) WHERE status IN ('proposed', 'confirmed')
        "#,
    )
    .execute(pool)
    .await?;

    // Same guard on the record side: an open ledger record can hold at most
    // one active match, which also keeps it out of candidate pools.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_one_active_record
        ON matches(record_type, record_id) WHERE status IN ('proposed', 'confirmed')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bank_transactions_date ON bank_transactions(date)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
