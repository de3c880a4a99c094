//! Idempotent catalog persistence over `SQLite`.
//!
//! [`DedupStore`] accepts record batches keyed by external identity and
//! inserts only unseen keys, inside a single all-or-nothing transaction per
//! batch. Writers are serialized: a batch in flight blocks the next one
//! until its transaction commits or rolls back.

use crate::catalog::CatalogRecord;
use crate::errors::{StepError, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

/// Current schema version recorded in `store_meta` on first initialization.
const SCHEMA_VERSION: &str = "1";

/// Outcome of one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Records newly committed in this batch.
    pub inserted: usize,
    /// Records whose key was already present; no write, no error.
    pub skipped: usize,
    /// Records rejected by validation; excluded without failing the batch.
    pub invalid: usize,
}

impl BatchOutcome {
    /// Total records examined.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inserted + self.skipped + self.invalid
    }
}

/// A record as stored, with its insertion timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRecord {
    /// External identity.
    pub id: i64,
    /// Product title.
    pub title: String,
    /// Unit price.
    pub price: f64,
    /// Product category.
    pub category: String,
    /// Free-form description.
    pub description: String,
    /// RFC 3339 timestamp of the insertion.
    pub inserted_at: String,
}

/// Per-category aggregate used by the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStats {
    /// Category name.
    pub category: String,
    /// Number of records in the category.
    pub count: i64,
    /// Average price.
    pub avg_price: f64,
    /// Minimum price.
    pub min_price: f64,
    /// Maximum price.
    pub max_price: f64,
}

/// Catalog-wide aggregates used by the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogStats {
    /// Total stored records.
    pub total_products: i64,
    /// Average price across the catalog.
    pub avg_price: f64,
    /// Per-category breakdown, ordered by category name.
    pub categories: Vec<CategoryStats>,
}

/// Store connectivity report used by the health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    /// Whether `SELECT 1` succeeded.
    pub connected: bool,
    /// Whether the records table exists.
    pub table_exists: bool,
    /// Stored record count.
    pub record_count: i64,
    /// Timestamp of the most recent insertion, if any.
    pub last_insert: Option<String>,
}

/// Deduplicating record store backed by `SQLite`.
#[derive(Debug)]
pub struct DedupStore {
    pool: SqlitePool,
    /// Single-writer discipline: one batch transaction at a time.
    writer: Mutex<()>,
}

impl DedupStore {
    /// Opens (and initializes) a store at the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            writer: Mutex::new(()),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Opens an in-memory store, used by tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        // One pinned connection: in-memory databases vanish with their
        // connection, so it must never be reaped.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            writer: Mutex::new(()),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                price REAL NOT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                inserted_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_category ON products(category)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_inserted_at ON products(inserted_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // Written once; read-only thereafter.
        sqlx::query("INSERT OR IGNORE INTO store_meta (key, value) VALUES ('schema_version', ?1)")
            .bind(SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;

        tracing::debug!("store schema verified");
        Ok(())
    }

    /// Returns the recorded schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata table cannot be read.
    pub async fn schema_version(&self) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT value FROM store_meta WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<String, _>("value"))
    }

    /// Inserts every unseen record of the batch inside one transaction.
    ///
    /// Known keys are counted as skipped without a write; records failing
    /// validation are counted as invalid and excluded. Re-running the same
    /// batch yields `inserted = 0` and `skipped = |batch|`.
    ///
    /// # Errors
    ///
    /// On storage failure the whole batch rolls back; nothing is partially
    /// applied.
    pub async fn upsert_batch(&self, records: &[CatalogRecord]) -> Result<BatchOutcome, StoreError> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let _writer = self.writer.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut outcome = BatchOutcome::default();

        let mut tx = self.pool.begin().await?;
        for record in records {
            if let Err(err) = record.validate() {
                tracing::warn!(id = record.id, error = %err, "invalid record excluded from batch");
                outcome.invalid += 1;
                continue;
            }

            let result = sqlx::query(
                "INSERT OR IGNORE INTO products (id, title, price, category, description, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(record.id)
            .bind(record.title.trim())
            .bind(record.price)
            .bind(record.category.trim())
            .bind(record.description.trim())
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        tx.commit().await?;

        tracing::info!(
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            invalid = outcome.invalid,
            "batch committed"
        );
        Ok(outcome)
    }

    /// Returns every stored record ordered by external id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn fetch_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let records = sqlx::query_as::<_, StoredRecord>(
            "SELECT id, title, price, category, description, inserted_at
             FROM products ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Computes catalog-wide and per-category aggregates.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn statistics(&self) -> Result<CatalogStats, StoreError> {
        let totals = sqlx::query("SELECT COUNT(*) AS cnt, AVG(price) AS avg_price FROM products")
            .fetch_one(&self.pool)
            .await?;

        let total_products = totals.get::<i64, _>("cnt");
        let avg_price = totals.get::<Option<f64>, _>("avg_price").unwrap_or(0.0);

        let rows = sqlx::query(
            "SELECT category,
                    COUNT(*)   AS count,
                    AVG(price) AS avg_price,
                    MIN(price) AS min_price,
                    MAX(price) AS max_price
             FROM products
             GROUP BY category
             ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?;

        let categories = rows
            .into_iter()
            .map(|row| CategoryStats {
                category: row.get("category"),
                count: row.get("count"),
                avg_price: row.get::<Option<f64>, _>("avg_price").unwrap_or(0.0),
                min_price: row.get::<Option<f64>, _>("min_price").unwrap_or(0.0),
                max_price: row.get::<Option<f64>, _>("max_price").unwrap_or(0.0),
            })
            .collect();

        Ok(CatalogStats {
            total_products,
            avg_price,
            categories,
        })
    }

    /// Probes store connectivity, table presence and insertion recency.
    ///
    /// # Errors
    ///
    /// Returns an error if the connectivity probe itself fails.
    pub async fn health_check(&self) -> Result<StoreHealth, StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let table = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'products'",
        )
        .fetch_optional(&self.pool)
        .await?;

        if table.is_none() {
            return Ok(StoreHealth {
                connected: true,
                table_exists: false,
                record_count: 0,
                last_insert: None,
            });
        }

        let counts = sqlx::query(
            "SELECT COUNT(*) AS cnt, MAX(inserted_at) AS last_insert FROM products",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreHealth {
            connected: true,
            table_exists: true,
            record_count: counts.get::<i64, _>("cnt"),
            last_insert: counts.get::<Option<String>, _>("last_insert"),
        })
    }
}

/// Health probe backed by [`DedupStore::health_check`].
#[derive(Debug)]
pub struct StoreProbe {
    store: std::sync::Arc<DedupStore>,
}

impl StoreProbe {
    /// Creates a probe over the given store.
    #[must_use]
    pub fn new(store: std::sync::Arc<DedupStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl crate::health::DependencyProbe for StoreProbe {
    fn name(&self) -> &str {
        "store"
    }

    async fn probe(&self) -> Result<(), StepError> {
        let health = self
            .store
            .health_check()
            .await
            .map_err(|e| StepError::fatal(format!("store unreachable: {e}")))?;
        if !health.table_exists {
            return Err(StepError::fatal("records table missing"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn record(id: i64, category: &str, price: f64) -> CatalogRecord {
        CatalogRecord {
            id,
            title: format!("Product {id}"),
            price,
            category: category.to_string(),
            description: String::from("test item"),
        }
    }

    #[tokio::test]
    async fn test_upsert_batch_inserts_new_records() {
        let store = DedupStore::open_in_memory().await.unwrap();
        let batch = vec![record(1, "tools", 9.5), record(2, "tools", 3.0)];

        let outcome = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                inserted: 2,
                skipped: 0,
                invalid: 0
            }
        );
    }

    #[tokio::test]
    async fn test_upsert_batch_is_idempotent() {
        let store = DedupStore::open_in_memory().await.unwrap();
        let batch = vec![record(1, "tools", 9.5), record(2, "tools", 3.0), record(3, "misc", 1.0)];

        let first = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(first.inserted, 3);

        let second = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, batch.len());
    }

    #[tokio::test]
    async fn test_same_id_with_changed_payload_is_a_duplicate() {
        // Insert-only dedup: payload changes under a known id are ignored.
        let store = DedupStore::open_in_memory().await.unwrap();
        store.upsert_batch(&[record(7, "tools", 10.0)]).await.unwrap();

        let mut updated = record(7, "tools", 99.0);
        updated.title = "Renamed".to_string();
        let outcome = store.upsert_batch(&[updated]).await.unwrap();
        assert_eq!(outcome.skipped, 1);

        let stored = store.fetch_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "Product 7");
        assert!((stored[0].price - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_records_are_counted_not_fatal() {
        let store = DedupStore::open_in_memory().await.unwrap();
        let mut bad = record(0, "tools", 5.0); // id must be positive
        bad.id = 0;
        let batch = vec![bad, record(2, "tools", 3.0)];

        let outcome = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(outcome.invalid, 1);
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn test_fetch_all_ordered_by_id() {
        let store = DedupStore::open_in_memory().await.unwrap();
        store
            .upsert_batch(&[record(5, "b", 1.0), record(1, "a", 2.0), record(3, "a", 3.0)])
            .await
            .unwrap();

        let ids: Vec<i64> = store.fetch_all().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_statistics_aggregates_by_category() {
        let store = DedupStore::open_in_memory().await.unwrap();
        store
            .upsert_batch(&[
                record(1, "audio", 10.0),
                record(2, "audio", 20.0),
                record(3, "video", 40.0),
            ])
            .await
            .unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_products, 3);
        assert!((stats.avg_price - 70.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.categories.len(), 2);

        let audio = &stats.categories[0];
        assert_eq!(audio.category, "audio");
        assert_eq!(audio.count, 2);
        assert!((audio.avg_price - 15.0).abs() < 1e-9);
        assert!((audio.min_price - 10.0).abs() < 1e-9);
        assert!((audio.max_price - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_statistics_on_empty_store() {
        let store = DedupStore::open_in_memory().await.unwrap();
        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_products, 0);
        assert!((stats.avg_price - 0.0).abs() < f64::EPSILON);
        assert!(stats.categories.is_empty());
    }

    #[tokio::test]
    async fn test_schema_version_written_once() {
        let store = DedupStore::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_health_check_reports_counts() {
        let store = DedupStore::open_in_memory().await.unwrap();
        store.upsert_batch(&[record(1, "tools", 2.0)]).await.unwrap();

        let health = tokio_test::assert_ok!(store.health_check().await);
        assert!(health.connected);
        assert!(health.table_exists);
        assert_eq!(health.record_count, 1);
        assert!(health.last_insert.is_some());
    }

    #[tokio::test]
    async fn test_overlapping_batches_serialize_without_interleaving() {
        let store = Arc::new(DedupStore::open_in_memory().await.unwrap());

        let first = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert_batch(&[record(1, "a", 1.0), record(2, "a", 2.0)])
                    .await
                    .unwrap()
            })
        };
        let second = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert_batch(&[record(2, "a", 2.0), record(3, "a", 3.0)])
                    .await
                    .unwrap()
            })
        };

        let (a, b) = (first.await.unwrap(), second.await.unwrap());

        // Whichever batch committed first owns id 2; the union is stored once.
        assert_eq!(a.inserted + b.inserted, 3);
        assert_eq!(a.skipped + b.skipped, 1);
        assert_eq!(store.fetch_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.db");

        let store = DedupStore::open(&path).await.unwrap();
        store.upsert_batch(&[record(1, "tools", 2.0)]).await.unwrap();
        assert!(path.exists());
    }
}
