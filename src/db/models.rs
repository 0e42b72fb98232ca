use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct RawRecord {
    pub id: i64,
    pub payload: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertResult {
    pub inserted: usize,
    pub skipped: usize,
}

impl InsertResult {
    pub fn total(&self) -> usize {
        self.inserted + self.skipped
    }
}
