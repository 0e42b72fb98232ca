use crate::db::models::{InsertResult, RawRecord};
use crate::error::{AppError, Result};
use crate::models::{NormalizedActivity, RawActivity, ACTIVITY_COLUMNS};
use crate::normalizer::Normalizer;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::Path;
use tracing::{debug, info};

/// Rows per multi-row INSERT; keeps bound parameters well under SQLite's limit
const BATCH_SIZE: usize = 300;

/// Single-file store used by the incremental path.
///
/// Assumes one process at a time; there is no locking beyond SQLite's own.
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the store file and apply migrations
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_sqlite(path).await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running local store migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Local store migrations completed");
        Ok(())
    }

    /// Insert raw activities whose id is not already stored.
    ///
    /// Existing rows are never updated, so re-running with overlapping
    /// pages is a no-op for what is already there.
    pub async fn upsert_raw(&self, activities: &[RawActivity]) -> Result<InsertResult> {
        if activities.is_empty() {
            return Ok(InsertResult {
                inserted: 0,
                skipped: 0,
            });
        }

        let fetched_at = Utc::now();
        let mut inserted = 0usize;
        let mut tx = self.pool.begin().await?;

        for (batch_idx, chunk) in activities.chunks(BATCH_SIZE).enumerate() {
            debug!(
                "Inserting raw batch {}/{} ({} activities)",
                batch_idx + 1,
                activities.len().div_ceil(BATCH_SIZE),
                chunk.len()
            );

            let payloads = chunk
                .iter()
                .map(serde_json::to_string)
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut query_builder =
                sqlx::QueryBuilder::new("INSERT INTO raw_activities (id, payload, fetched_at) ");

            query_builder.push_values(chunk.iter().zip(payloads.iter()), |mut b, (activity, payload)| {
                b.push_bind(activity.id)
                    .push_bind(payload)
                    .push_bind(fetched_at);
            });

            query_builder.push(" ON CONFLICT (id) DO NOTHING");

            let result = query_builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;

        let result = InsertResult {
            inserted,
            skipped: activities.len() - inserted,
        };
        info!(
            "Raw upsert: {} inserted, {} already present",
            result.inserted, result.skipped
        );
        Ok(result)
    }

    /// Delete every cleaned row and re-derive the table from all raw rows.
    ///
    /// Cost scales with the full raw history, not with the new rows.
    pub async fn rebuild_cleaned(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM cleaned_activities")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let records = sqlx::query_as::<_, RawRecord>(
            "SELECT id, payload, fetched_at FROM raw_activities ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;

        let raws = records
            .iter()
            .map(|record| {
                serde_json::from_str::<RawActivity>(&record.payload).map_err(|e| {
                    AppError::Transform(format!(
                        "Stored payload for activity {} is unreadable: {}",
                        record.id, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (rows, stats) = Normalizer::normalize(&raws);
        insert_activities(&mut tx, "cleaned_activities", &rows).await?;

        tx.commit().await?;

        info!(
            "Rebuilt cleaned table: {} rows replaced by {} ({} malformed timestamps)",
            deleted,
            rows.len(),
            stats.malformed_timestamps
        );
        Ok(rows.len())
    }

    /// Cleaned rows, newest first
    pub async fn cleaned_activities(&self) -> Result<Vec<NormalizedActivity>> {
        let rows = sqlx::query_as::<_, NormalizedActivity>(
            "SELECT * FROM cleaned_activities \
             ORDER BY local_start_date DESC, local_start_time DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn raw_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM raw_activities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn cleaned_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cleaned_activities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Connect to a SQLite file, creating it and its directory when missing
pub(crate) async fn open_sqlite(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    debug!("Opened SQLite database at {}", path.display());
    Ok(pool)
}

/// `CREATE TABLE` for a table holding `NormalizedActivity` rows
pub(crate) fn create_activity_table_sql(table: &str) -> String {
    let columns = ACTIVITY_COLUMNS
        .iter()
        .map(|(name, ty)| {
            if *name == "id" {
                format!("\"{}\" {} PRIMARY KEY NOT NULL", name, ty.sqlite_type())
            } else {
                format!("\"{}\" {}", name, ty.sqlite_type())
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS \"{}\" ({})", table, columns)
}

/// Batched multi-row insert of activity rows into `table`
pub(crate) async fn insert_activities(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[NormalizedActivity],
) -> Result<u64> {
    let column_list = ACTIVITY_COLUMNS
        .iter()
        .map(|(name, _)| format!("\"{}\"", name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut total = 0u64;
    for chunk in rows.chunks(BATCH_SIZE) {
        let mut query_builder =
            sqlx::QueryBuilder::new(format!("INSERT INTO \"{}\" ({}) ", table, column_list));

        query_builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(&row.name)
                .push_bind(&row.activity_type)
                .push_bind(&row.subtype)
                .push_bind(row.moving_time_mins)
                .push_bind(row.elapsed_time_mins)
                .push_bind(row.distance_miles)
                .push_bind(row.total_elevation_gain)
                .push_bind(row.local_start_date)
                .push_bind(row.local_start_time)
                .push_bind(&row.timezone)
                .push_bind(&row.timezone_name)
                .push_bind(row.kudos_count)
                .push_bind(row.start_latitude)
                .push_bind(row.start_longitude)
                .push_bind(row.end_latitude)
                .push_bind(row.end_longitude)
                .push_bind(row.average_speed_mph)
                .push_bind(row.max_speed_mph)
                .push_bind(row.average_heartrate)
                .push_bind(row.max_heartrate)
                .push_bind(row.average_cadence)
                .push_bind(row.average_watts)
                .push_bind(row.kilojoules)
                .push_bind(row.elevation_high)
                .push_bind(row.elevation_low)
                .push_bind(row.elevation_gain)
                .push_bind(row.pace_min_per_mile)
                .push_bind(&row.city)
                .push_bind(&row.state)
                .push_bind(&row.country);
        });

        let result = query_builder.build().execute(&mut *conn).await?;
        total += result.rows_affected();
    }

    Ok(total)
}
