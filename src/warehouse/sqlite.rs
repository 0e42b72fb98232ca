use crate::dashboard::{DashboardFilter, DashboardRow, Domains};
use crate::db::repository::{create_activity_table_sql, insert_activities, open_sqlite};
use crate::error::{AppError, Result};
use crate::models::NormalizedActivity;
use crate::normalizer::sanitize_identifier;
use crate::warehouse::{TableRef, Warehouse};
use chrono::NaiveDate;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Warehouse backed by a local SQLite file.
///
/// Only the table part of the [`TableRef`] names the SQLite table.
pub struct SqliteWarehouse {
    pool: SqlitePool,
    path: PathBuf,
    table: String,
}

impl SqliteWarehouse {
    pub async fn open(path: &Path, table_ref: &TableRef) -> Result<Self> {
        let pool = open_sqlite(path).await?;
        let table = sanitize_identifier(&table_ref.table);

        sqlx::query(&create_activity_table_sql(&table))
            .execute(&pool)
            .await?;

        debug!("SQLite warehouse table '{}' ready", table);
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn replace_rows(&self, rows: &[NormalizedActivity]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&create_activity_table_sql(&self.table))
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(&format!("DELETE FROM \"{}\"", self.table))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = insert_activities(&mut tx, &self.table, rows).await?;

        tx.commit().await?;

        debug!("Replaced {} rows with {}", deleted, inserted);
        Ok(inserted as usize)
    }

    fn filtered_query(&self, filter: &DashboardFilter) -> QueryBuilder<'_, Sqlite> {
        let mut query_builder = QueryBuilder::new(format!(
            "SELECT local_start_date AS date, subtype, name, distance_miles, elevation_gain, \
             pace_min_per_mile, city, start_latitude, start_longitude FROM \"{}\" \
             WHERE local_start_date BETWEEN ",
            self.table
        ));
        query_builder
            .push_bind(filter.start)
            .push(" AND ")
            .push_bind(filter.end);

        if let Some(types) = filter.type_filter() {
            query_builder.push(" AND subtype IN (");
            let mut separated = query_builder.separated(", ");
            for activity_type in types {
                separated.push_bind(activity_type.clone());
            }
            separated.push_unseparated(")");
        }

        if let Some(cities) = filter.city_filter() {
            query_builder.push(" AND city IN (");
            let mut separated = query_builder.separated(", ");
            for city in cities {
                separated.push_bind(city.clone());
            }
            separated.push_unseparated(")");
        }

        query_builder.push(" ORDER BY local_start_date DESC, local_start_time DESC, id DESC");
        query_builder
    }

    async fn distinct_values(&self, column: &str) -> Result<Vec<String>> {
        let values = sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT \"{col}\" FROM \"{table}\" \
             WHERE \"{col}\" IS NOT NULL AND \"{col}\" <> '' ORDER BY \"{col}\"",
            col = column,
            table = self.table
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(values)
    }
}

impl Warehouse for SqliteWarehouse {
    async fn load_replace(&self, rows: &[NormalizedActivity]) -> Result<usize> {
        info!(
            "Replacing SQLite table '{}' with {} rows",
            self.table,
            rows.len()
        );
        self.replace_rows(rows)
            .await
            .map_err(|e| AppError::Load(format!("SQLite table '{}': {}", self.table, e)))
    }

    async fn query(&self, filter: &DashboardFilter) -> Result<Vec<DashboardRow>> {
        let mut query_builder = self.filtered_query(filter);
        query_builder
            .build_query_as::<DashboardRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Query(format!("SQLite table '{}': {}", self.table, e)))
    }

    async fn domains(&self) -> Result<Domains> {
        let lookup = async {
            let sports = self.distinct_values("subtype").await?;
            let cities = self.distinct_values("city").await?;
            let (min_date, max_date) = sqlx::query_as::<_, (Option<NaiveDate>, Option<NaiveDate>)>(
                &format!(
                    "SELECT MIN(local_start_date), MAX(local_start_date) FROM \"{}\"",
                    self.table
                ),
            )
            .fetch_one(&self.pool)
            .await?;

            Ok::<_, AppError>(Domains {
                sports,
                cities,
                min_date,
                max_date,
            })
        };

        lookup
            .await
            .map_err(|e| AppError::Query(format!("SQLite table '{}': {}", self.table, e)))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.path.display(), self.table)
    }
}
