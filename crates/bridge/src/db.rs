use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::{BridgeError, Result};

/// Append-only telemetry log backed by SQLite.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    pub sequence_id: i64,
    pub value: f64,
    pub observed_at: OffsetDateTime,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/device-bridge/telemetry.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| BridgeError::storage(format!("invalid sqlite connection string: {db_url}"), e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // Every in-memory connection is its own database, so keep exactly one
        // and never let the pool recycle it.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| BridgeError::storage(format!("failed to connect to sqlite db: {db_url}"), e))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BridgeError::storage("failed to run migrations", e))?;
        Ok(())
    }

    // ----------------------------
    // Telemetry
    // ----------------------------

    /// Append one reading. The returned sequence id is assigned by SQLite's
    /// autoincrement key, so it is strictly increasing across all writers.
    pub async fn append(&self, value: f64, observed_at: OffsetDateTime) -> Result<i64> {
        let observed_ms = unix_millis(observed_at);
        let id = sqlx::query(
            r#"
            INSERT INTO telemetry_readings (value, observed_at)
            VALUES (?, ?)
            "#,
        )
        .bind(value)
        .bind(observed_ms)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// The `n` most recently appended readings, oldest first.
    pub async fn query_recent(&self, n: u32) -> Result<Vec<TelemetryReading>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT sequence_id, value, observed_at
            FROM (
              SELECT sequence_id, value, observed_at
              FROM telemetry_readings
              ORDER BY sequence_id DESC
              LIMIT ?
            )
            ORDER BY sequence_id ASC
            "#,
        )
        .bind(i64::from(n))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| -> Result<TelemetryReading> {
                let observed_ms: i64 = r.try_get("observed_at")?;
                Ok(TelemetryReading {
                    sequence_id: r.try_get("sequence_id")?,
                    value: r.try_get("value")?,
                    observed_at: from_unix_millis(observed_ms),
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub fn unix_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

// ===========================================================================
// Tests
// ===========================================================================
