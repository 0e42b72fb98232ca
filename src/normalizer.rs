use crate::models::{NormalizedActivity, RawActivity};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use regex_lite::Regex;
use std::sync::OnceLock;
use tracing::warn;

pub const METERS_PER_MILE: f64 = 1609.344;
pub const MPS_TO_MPH: f64 = 2.23694;
pub const METERS_TO_FEET: f64 = 3.280839;

#[derive(Debug, Clone, Default)]
pub struct NormalizeStats {
    pub total: usize,
    pub malformed_timestamps: usize,
    pub missing_timestamps: usize,
    pub missing_start_coordinates: usize,
    pub missing_pace: usize,
}

impl NormalizeStats {
    fn record(&mut self, raw: &RawActivity, row: &NormalizedActivity) {
        self.total += 1;
        match raw.start_date_local.as_deref() {
            None => self.missing_timestamps += 1,
            Some(_) if row.local_start_date.is_none() => self.malformed_timestamps += 1,
            Some(_) => {}
        }
        if row.start_latitude.is_none() || row.start_longitude.is_none() {
            self.missing_start_coordinates += 1;
        }
        if row.pace_min_per_mile.is_none() {
            self.missing_pace += 1;
        }
    }
}

pub struct Normalizer;

impl Normalizer {
    /// Normalize a batch of activities, preserving length and order
    pub fn normalize(raws: &[RawActivity]) -> (Vec<NormalizedActivity>, NormalizeStats) {
        let mut stats = NormalizeStats::default();
        let rows = raws
            .iter()
            .map(|raw| {
                let row = normalize_one(raw);
                if raw.start_date_local.is_some() && row.local_start_date.is_none() {
                    warn!(
                        "Activity {} has unparseable start_date_local {:?}",
                        raw.id, raw.start_date_local
                    );
                }
                stats.record(raw, &row);
                row
            })
            .collect();
        (rows, stats)
    }
}

pub fn normalize_one(raw: &RawActivity) -> NormalizedActivity {
    let start = raw.start_date_local.as_deref().and_then(parse_local_start);
    let average_speed_mph = mps_to_mph(raw.average_speed);

    NormalizedActivity {
        id: raw.id,
        name: raw.name.clone(),
        activity_type: raw.activity_type.clone(),
        subtype: raw.sport_type.clone(),
        moving_time_mins: seconds_to_minutes(raw.moving_time),
        elapsed_time_mins: seconds_to_minutes(raw.elapsed_time),
        distance_miles: meters_to_miles(raw.distance),
        total_elevation_gain: raw.total_elevation_gain,
        local_start_date: start.map(|dt| dt.date()),
        local_start_time: start.map(|dt| dt.time()),
        timezone: raw.timezone.clone(),
        timezone_name: raw.timezone.as_deref().and_then(timezone_name),
        kudos_count: raw.kudos_count,
        start_latitude: coordinate(raw.start_latlng.as_deref(), 0),
        start_longitude: coordinate(raw.start_latlng.as_deref(), 1),
        end_latitude: coordinate(raw.end_latlng.as_deref(), 0),
        end_longitude: coordinate(raw.end_latlng.as_deref(), 1),
        average_speed_mph,
        max_speed_mph: mps_to_mph(raw.max_speed),
        average_heartrate: raw.average_heartrate,
        max_heartrate: raw.max_heartrate,
        average_cadence: raw.average_cadence,
        average_watts: raw.average_watts,
        kilojoules: raw.kilojoules,
        elevation_high: meters_to_feet(raw.elev_high),
        elevation_low: meters_to_feet(raw.elev_low),
        elevation_gain: meters_to_feet(raw.total_elevation_gain),
        pace_min_per_mile: pace_min_per_mile(average_speed_mph),
        city: None,
        state: None,
        country: None,
    }
}

/// Two decimals, ties to even (15.625 -> 15.62)
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

pub fn seconds_to_minutes(seconds: Option<f64>) -> Option<f64> {
    seconds.map(|s| round2(s / 60.0))
}

pub fn meters_to_miles(meters: Option<f64>) -> Option<f64> {
    meters.map(|m| round2(m / METERS_PER_MILE))
}

pub fn mps_to_mph(mps: Option<f64>) -> Option<f64> {
    mps.map(|v| round2(v * MPS_TO_MPH))
}

pub fn meters_to_feet(meters: Option<f64>) -> Option<f64> {
    meters.map(|m| round2(m * METERS_TO_FEET))
}

/// Minutes per mile; absent unless speed is strictly positive
pub fn pace_min_per_mile(speed_mph: Option<f64>) -> Option<f64> {
    speed_mph
        .filter(|mph| mph.is_finite() && *mph > 0.0)
        .map(|mph| round2(60.0 / mph))
}

/// Element `index` of a coordinate pair, only when the pair is complete
pub fn coordinate(latlng: Option<&[f64]>, index: usize) -> Option<f64> {
    latlng.filter(|pair| pair.len() >= 2).map(|pair| pair[index])
}

/// Parse the local start timestamp into naive wall-clock time.
///
/// Offsets are normalized to UTC before dropping them; Strava stamps local
/// times with `Z`, so this is the identity for well-formed payloads.
pub fn parse_local_start(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Zone name from a `"(GMT-08:00) America/Los_Angeles"` style field.
///
/// Takes everything after the first `)` followed by whitespace. Without that
/// separator the trimmed input is returned as-is; blank input is absent.
pub fn timezone_name(value: &str) -> Option<String> {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    let re = SEPARATOR.get_or_init(|| Regex::new(r"\)\s+").unwrap());

    let name = match re.find(value) {
        Some(m) => &value[m.end()..],
        None => value,
    };
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Make a column identifier safe for the warehouse.
///
/// Anything outside `[0-9A-Za-z_]` becomes `_`, and runs of `_` collapse.
pub fn sanitize_identifier(value: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    static REPEATED: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^0-9a-zA-Z_]").unwrap());
    let repeated = REPEATED.get_or_init(|| Regex::new(r"_+").unwrap());

    let replaced = invalid.replace_all(value.trim(), "_");
    repeated.replace_all(&replaced, "_").into_owned()
}
