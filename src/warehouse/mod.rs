//! Analytical table the pipeline loads into and the dashboard reads from.
//!
//! Every load is a full replace: after `load_replace` returns, the table
//! holds exactly the rows passed in.

pub mod bigquery;
pub mod sqlite;

use crate::config::{WarehouseBackend, WarehouseConfig};
use crate::dashboard::{DashboardFilter, DashboardRow, Domains};
use crate::error::{AppError, Result};
use crate::models::NormalizedActivity;
use reqwest::Client;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

pub use bigquery::BigQueryWarehouse;
pub use sqlite::SqliteWarehouse;

/// Fully-qualified `project.dataset.table` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl FromStr for TableRef {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(TableRef {
                    project: project.to_string(),
                    dataset: dataset.to_string(),
                    table: table.to_string(),
                })
            }
            _ => Err(AppError::Config(format!(
                "warehouse.table '{}' must be of the form project.dataset.table",
                s
            ))),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

pub trait Warehouse {
    /// Replace the table's contents with `rows`; returns the row count loaded
    fn load_replace(&self, rows: &[NormalizedActivity]) -> impl Future<Output = Result<usize>>;

    /// Rows matching the filter, newest date first
    fn query(&self, filter: &DashboardFilter) -> impl Future<Output = Result<Vec<DashboardRow>>>;

    /// Filter choices and the available date span
    fn domains(&self) -> impl Future<Output = Result<Domains>>;

    fn describe(&self) -> String;
}

/// Backend picked from configuration
pub enum AnyWarehouse {
    BigQuery(BigQueryWarehouse),
    Sqlite(SqliteWarehouse),
}

impl AnyWarehouse {
    /// Whether opening this backend needs a Google access token
    pub fn needs_google_token(config: &WarehouseConfig) -> bool {
        config.backend == WarehouseBackend::Bigquery
    }

    pub async fn from_config(
        config: &WarehouseConfig,
        client: &Client,
        google_token: Option<&str>,
    ) -> Result<Self> {
        let table_ref = config.table_ref()?;
        match config.backend {
            WarehouseBackend::Bigquery => {
                let token = google_token.ok_or_else(|| {
                    AppError::Config("BigQuery warehouse requires a Google access token".to_string())
                })?;
                Ok(AnyWarehouse::BigQuery(BigQueryWarehouse::new(
                    client.clone(),
                    &config.api_base_url,
                    table_ref,
                    token.to_string(),
                    config.location.clone(),
                    Duration::from_millis(config.poll_interval_ms),
                )))
            }
            WarehouseBackend::Sqlite => Ok(AnyWarehouse::Sqlite(
                SqliteWarehouse::open(&config.sqlite_path, &table_ref).await?,
            )),
        }
    }
}

impl Warehouse for AnyWarehouse {
    async fn load_replace(&self, rows: &[NormalizedActivity]) -> Result<usize> {
        match self {
            AnyWarehouse::BigQuery(w) => w.load_replace(rows).await,
            AnyWarehouse::Sqlite(w) => w.load_replace(rows).await,
        }
    }

    async fn query(&self, filter: &DashboardFilter) -> Result<Vec<DashboardRow>> {
        match self {
            AnyWarehouse::BigQuery(w) => w.query(filter).await,
            AnyWarehouse::Sqlite(w) => w.query(filter).await,
        }
    }

    async fn domains(&self) -> Result<Domains> {
        match self {
            AnyWarehouse::BigQuery(w) => w.domains().await,
            AnyWarehouse::Sqlite(w) => w.domains().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            AnyWarehouse::BigQuery(w) => w.describe(),
            AnyWarehouse::Sqlite(w) => w.describe(),
        }
    }
}
