use crate::error::{AppError, Result};
use crate::warehouse::TableRef;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub strava: StravaConfig,
    #[serde(default)]
    pub google: Option<GoogleConfig>,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub drive: Option<DriveConfig>,
    #[serde(default)]
    pub geocode: GeocodeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// OAuth client + long-lived refresh token
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StravaConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_strava_api_url")]
    pub api_base_url: String,
    #[serde(default = "default_strava_token_url")]
    pub token_url: String,
    #[serde(default = "default_per_page", deserialize_with = "deserialize_u32")]
    pub per_page: u32,
}

fn default_strava_api_url() -> String {
    "https://www.strava.com/api/v3".to_string()
}

fn default_strava_token_url() -> String {
    "https://www.strava.com/oauth/token".to_string()
}

fn default_per_page() -> u32 {
    200
}

/// Strava caps `per_page` at this value
pub const MAX_PER_PAGE: u32 = 200;

impl StravaConfig {
    pub fn credentials(&self) -> OAuthCredentials {
        OAuthCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            refresh_token: self.refresh_token.clone(),
            token_url: self.token_url.clone(),
        }
    }
}

/// Google identity used for both BigQuery and Drive
#[derive(Debug, Deserialize, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_google_token_url")]
    pub token_url: String,
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl GoogleConfig {
    pub fn credentials(&self) -> OAuthCredentials {
        OAuthCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            refresh_token: self.refresh_token.clone(),
            token_url: self.token_url.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackend {
    #[default]
    Bigquery,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub backend: WarehouseBackend,
    /// `project.dataset.table`
    pub table: String,
    #[serde(default = "default_bigquery_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_warehouse_path")]
    pub sqlite_path: PathBuf,
}

fn default_bigquery_url() -> String {
    "https://bigquery.googleapis.com".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_warehouse_path() -> PathBuf {
    PathBuf::from("data/warehouse.db")
}

impl WarehouseConfig {
    pub fn table_ref(&self) -> Result<TableRef> {
        self.table.parse()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    /// Empty or absent disables the upload
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_drive_file_name")]
    pub file_name: String,
    #[serde(default = "default_drive_url")]
    pub api_base_url: String,
}

fn default_drive_file_name() -> String {
    "strava_transformed.csv".to_string()
}

fn default_drive_url() -> String {
    "https://www.googleapis.com".to_string()
}

impl DriveConfig {
    pub fn folder(&self) -> Option<&str> {
        self.folder_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_nominatim_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_precision")]
    pub precision: u32,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_nominatim_url(),
            user_agent: default_user_agent(),
            precision: default_precision(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_nominatim_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_user_agent() -> String {
    "strava_city_lookup".to_string()
}

fn default_precision() -> u32 {
    3
}

fn default_min_interval_ms() -> u64 {
    1050 // Nominatim asks for at most one request per second
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/strava.db")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExportConfig {
    /// Directory for the dated local CSV copy
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout", deserialize_with = "deserialize_u64")]
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

/// Custom deserializer that handles numbers given as strings
///
/// Accepts:
/// - `per_page: 200` (number)
/// - `per_page: "200"` (string that parses to number)
/// - `per_page: ${STRAVA_PER_PAGE}` (env var substituted to either)
fn deserialize_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberValue {
        Number(u64),
        String(String),
    }

    match NumberValue::deserialize(deserializer)? {
        NumberValue::Number(n) => Ok(n),
        NumberValue::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid number: '{}'", s))),
    }
}

fn deserialize_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = deserialize_u64(deserializer)?;
    u32::try_from(value)
        .map_err(|_| serde::de::Error::custom(format!("Number out of range: {}", value)))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Expand environment variables, parse and validate
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Google identity, required by whichever step needs it
    pub fn google(&self) -> Result<&GoogleConfig> {
        self.google.as_ref().ok_or_else(|| {
            AppError::Config(
                "google section (GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET, GOOGLE_REFRESH_TOKEN) is required"
                    .to_string(),
            )
        })
    }

    /// Drive section, only when a folder is actually configured
    pub fn drive_target(&self) -> Option<&DriveConfig> {
        self.drive.as_ref().filter(|d| d.folder().is_some())
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Non-empty credentials
    /// - HTTPS endpoints
    /// - Page size and table name shape
    /// - Positive geocode pacing
    fn validate(&self) -> Result<()> {
        let mut secrets = vec![
            ("STRAVA_CLIENT_ID", &self.strava.client_id),
            ("STRAVA_CLIENT_SECRET", &self.strava.client_secret),
            ("STRAVA_REFRESH_TOKEN", &self.strava.refresh_token),
        ];
        if let Some(google) = &self.google {
            secrets.push(("GOOGLE_CLIENT_ID", &google.client_id));
            secrets.push(("GOOGLE_CLIENT_SECRET", &google.client_secret));
            secrets.push(("GOOGLE_REFRESH_TOKEN", &google.refresh_token));
        }

        for (field_name, value) in &secrets {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("{} cannot be empty", field_name)));
            }
        }

        if self.strava.per_page == 0 || self.strava.per_page > MAX_PER_PAGE {
            return Err(AppError::Config(format!(
                "strava.per_page must be between 1 and {}, got {}",
                MAX_PER_PAGE, self.strava.per_page
            )));
        }

        let mut urls = vec![
            ("strava.api_base_url", &self.strava.api_base_url),
            ("strava.token_url", &self.strava.token_url),
            ("geocode.base_url", &self.geocode.base_url),
        ];
        if let Some(google) = &self.google {
            urls.push(("google.token_url", &google.token_url));
        }
        if self.warehouse.backend == WarehouseBackend::Bigquery {
            urls.push(("warehouse.api_base_url", &self.warehouse.api_base_url));
        }
        if let Some(drive) = &self.drive {
            urls.push(("drive.api_base_url", &drive.api_base_url));
        }
        for (name, value) in urls {
            validate_https(name, value)?;
        }

        self.warehouse.table_ref()?;

        if self.warehouse.backend == WarehouseBackend::Bigquery && self.google.is_none() {
            return Err(AppError::Config(
                "warehouse.backend 'bigquery' requires a google section".to_string(),
            ));
        }

        if self.drive_target().is_some() && self.google.is_none() {
            return Err(AppError::Config(
                "drive.folder_id is set but the google section is missing".to_string(),
            ));
        }

        if let Some(drive) = self.drive_target() {
            if drive.file_name.trim().is_empty() {
                return Err(AppError::Config(
                    "drive.file_name cannot be empty".to_string(),
                ));
            }
        }

        if self.geocode.min_interval_ms == 0 {
            return Err(AppError::Config(
                "geocode.min_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.geocode.min_interval_ms < 1000 {
            tracing::warn!(
                "geocode.min_interval_ms of {} is below the Nominatim usage policy of 1 request/second",
                self.geocode.min_interval_ms
            );
        }

        if self.geocode.precision > 7 {
            return Err(AppError::Config(format!(
                "geocode.precision {} is too fine, maximum is 7 decimal places",
                self.geocode.precision
            )));
        }

        if self.http.timeout_seconds == 0 {
            return Err(AppError::Config(
                "http.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_https(name: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AppError::Config(format!("Invalid {} '{}': {}", name, value, e)))?;

    if parsed.scheme() != "https" {
        return Err(AppError::Config(format!(
            "{} must use HTTPS, got: {}",
            name,
            parsed.scheme()
        )));
    }

    Ok(())
}

/// Substitute `${VAR}` and `${VAR:-default}` placeholders from the environment
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").unwrap();

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let fallback = cap.get(3).map(|m| m.as_str());
        match (std::env::var(var_name), fallback) {
            (Ok(value), _) => {
                result = result.replace(&cap[0], &value);
            }
            (Err(_), Some(default)) => {
                result = result.replace(&cap[0], default);
            }
            (Err(_), None) => {
                if !missing_vars.iter().any(|v| v == var_name) {
                    missing_vars.push(var_name.to_string());
                }
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
