use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Warehouse load error: {0}")]
    Load(String),

    #[error("Warehouse query error: {0}")]
    Query(String),

    #[error("File mirror error: {0}")]
    Mirror(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Geocode lookup miss: {0}")]
    GeocodeLookupMiss(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether the run may continue after this error.
    ///
    /// Only geocode misses degrade; everything else aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AppError::GeocodeLookupMiss(_))
    }
}
