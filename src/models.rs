//! Activity records as they move through the pipeline.
//!
//! `RawActivity` mirrors the Strava listing payload, `NormalizedActivity` is
//! the flat warehouse row derived from it.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Activity summary as returned by `GET /athlete/activities`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawActivity {
    pub id: i64,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type", default)]
    pub activity_type: Option<String>,

    #[serde(default)]
    pub sport_type: Option<String>,

    /// Seconds
    #[serde(default)]
    pub moving_time: Option<f64>,

    /// Seconds, including pauses
    #[serde(default)]
    pub elapsed_time: Option<f64>,

    /// Meters
    #[serde(default)]
    pub distance: Option<f64>,

    /// Meters
    #[serde(default)]
    pub total_elevation_gain: Option<f64>,

    /// Local wall-clock start, e.g. `2024-01-15T07:30:00Z`
    #[serde(default)]
    pub start_date_local: Option<String>,

    /// e.g. `(GMT-08:00) America/Los_Angeles`
    #[serde(default)]
    pub timezone: Option<String>,

    /// `[lat, lng]`; Strava sends `[]` for activities without GPS
    #[serde(default)]
    pub start_latlng: Option<Vec<f64>>,

    #[serde(default)]
    pub end_latlng: Option<Vec<f64>>,

    /// m/s
    #[serde(default)]
    pub average_speed: Option<f64>,

    /// m/s
    #[serde(default)]
    pub max_speed: Option<f64>,

    #[serde(default)]
    pub average_heartrate: Option<f64>,

    #[serde(default)]
    pub max_heartrate: Option<f64>,

    #[serde(default)]
    pub average_cadence: Option<f64>,

    #[serde(default)]
    pub average_watts: Option<f64>,

    #[serde(default)]
    pub kilojoules: Option<f64>,

    /// Meters
    #[serde(default)]
    pub elev_high: Option<f64>,

    /// Meters
    #[serde(default)]
    pub elev_low: Option<f64>,

    #[serde(default)]
    pub kudos_count: Option<i64>,

    /// Everything else Strava sent, kept so stored payloads stay complete
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawActivity {
    /// Bare record with only the identifier set
    pub fn with_id(id: i64) -> Self {
        Self {
            id,
            name: None,
            activity_type: None,
            sport_type: None,
            moving_time: None,
            elapsed_time: None,
            distance: None,
            total_elevation_gain: None,
            start_date_local: None,
            timezone: None,
            start_latlng: None,
            end_latlng: None,
            average_speed: None,
            max_speed: None,
            average_heartrate: None,
            max_heartrate: None,
            average_cadence: None,
            average_watts: None,
            kilojoules: None,
            elev_high: None,
            elev_low: None,
            kudos_count: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Flat, unit-converted activity row.
///
/// Field order is the column order of the warehouse table and the CSV export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NormalizedActivity {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub activity_type: Option<String>,
    pub subtype: Option<String>,
    pub moving_time_mins: Option<f64>,
    pub elapsed_time_mins: Option<f64>,
    pub distance_miles: Option<f64>,
    /// Meters, as reported upstream
    pub total_elevation_gain: Option<f64>,
    pub local_start_date: Option<NaiveDate>,
    pub local_start_time: Option<NaiveTime>,
    pub timezone: Option<String>,
    pub timezone_name: Option<String>,
    pub kudos_count: Option<i64>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub average_speed_mph: Option<f64>,
    pub max_speed_mph: Option<f64>,
    pub average_heartrate: Option<f64>,
    pub max_heartrate: Option<f64>,
    pub average_cadence: Option<f64>,
    pub average_watts: Option<f64>,
    pub kilojoules: Option<f64>,
    /// Feet
    pub elevation_high: Option<f64>,
    /// Feet
    pub elevation_low: Option<f64>,
    /// Feet
    pub elevation_gain: Option<f64>,
    pub pace_min_per_mile: Option<f64>,
    #[sqlx(default)]
    pub city: Option<String>,
    #[sqlx(default)]
    pub state: Option<String>,
    #[sqlx(default)]
    pub country: Option<String>,
}

impl NormalizedActivity {
    pub fn set_place(&mut self, place: Option<&Place>) {
        self.city = place.and_then(|p| p.city.clone());
        self.state = place.and_then(|p| p.state.clone());
        self.country = place.and_then(|p| p.country.clone());
    }
}

/// Warehouse column types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Date,
    Time,
}

impl ColumnType {
    pub fn bigquery_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "FLOAT",
            ColumnType::String => "STRING",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
        }
    }

    pub fn sqlite_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String | ColumnType::Date | ColumnType::Time => "TEXT",
        }
    }
}

/// Column layout of `NormalizedActivity`, in serialization order.
pub const ACTIVITY_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", ColumnType::Integer),
    ("name", ColumnType::String),
    ("type", ColumnType::String),
    ("subtype", ColumnType::String),
    ("moving_time_mins", ColumnType::Float),
    ("elapsed_time_mins", ColumnType::Float),
    ("distance_miles", ColumnType::Float),
    ("total_elevation_gain", ColumnType::Float),
    ("local_start_date", ColumnType::Date),
    ("local_start_time", ColumnType::Time),
    ("timezone", ColumnType::String),
    ("timezone_name", ColumnType::String),
    ("kudos_count", ColumnType::Integer),
    ("start_latitude", ColumnType::Float),
    ("start_longitude", ColumnType::Float),
    ("end_latitude", ColumnType::Float),
    ("end_longitude", ColumnType::Float),
    ("average_speed_mph", ColumnType::Float),
    ("max_speed_mph", ColumnType::Float),
    ("average_heartrate", ColumnType::Float),
    ("max_heartrate", ColumnType::Float),
    ("average_cadence", ColumnType::Float),
    ("average_watts", ColumnType::Float),
    ("kilojoules", ColumnType::Float),
    ("elevation_high", ColumnType::Float),
    ("elevation_low", ColumnType::Float),
    ("elevation_gain", ColumnType::Float),
    ("pace_min_per_mile", ColumnType::Float),
    ("city", ColumnType::String),
    ("state", ColumnType::String),
    ("country", ColumnType::String),
];

/// Reverse-geocoded place for a rounded coordinate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Place {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl Place {
    pub fn is_empty(&self) -> bool {
        self.city.is_none() && self.state.is_none() && self.country.is_none()
    }
}
