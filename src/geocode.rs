//! Reverse geocoding of activity start points.
//!
//! Lookups go to Nominatim one at a time, paced by [`Pacer`], and are
//! memoized per run by rounded coordinate so each distinct place costs a
//! single request.

use crate::error::{AppError, Result};
use crate::http::{build_client_with_agent, describe_failure};
use crate::models::{NormalizedActivity, Place};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Time source for pacing
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        tokio::time::sleep(duration)
    }
}

/// Minimum spacing between the end of one call and the start of the next
pub struct Pacer<C: Clock = TokioClock> {
    interval: Duration,
    last_finished: Option<Instant>,
    clock: C,
}

impl Pacer<TokioClock> {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, TokioClock)
    }
}

impl<C: Clock> Pacer<C> {
    pub fn with_clock(interval: Duration, clock: C) -> Self {
        Self {
            interval,
            last_finished: None,
            clock,
        }
    }

    /// Sleep until the interval since the last finished call has elapsed.
    ///
    /// Returns how long it slept.
    pub async fn wait(&mut self) -> Duration {
        let Some(last) = self.last_finished else {
            return Duration::ZERO;
        };

        let elapsed = self.clock.now().saturating_duration_since(last);
        if elapsed >= self.interval {
            return Duration::ZERO;
        }

        let remaining = self.interval - elapsed;
        self.clock.sleep(remaining).await;
        remaining
    }

    /// Record that a call just finished
    pub fn mark(&mut self) {
        self.last_finished = Some(self.clock.now());
    }
}

/// Coordinate → place lookup
pub trait ReverseGeocoder {
    /// `Ok(None)` when the service has nothing for this point
    fn reverse(&self, lat: f64, lon: f64) -> impl Future<Output = Result<Option<Place>>>;
}

pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    #[serde(default)]
    address: Option<NominatimAddress>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

impl From<NominatimAddress> for Place {
    fn from(addr: NominatimAddress) -> Self {
        Place {
            city: addr.city.or(addr.town).or(addr.village).or(addr.hamlet),
            state: addr.state,
            country: addr.country,
        }
    }
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str, timeout_seconds: u64) -> Result<Self> {
        Ok(Self {
            client: build_client_with_agent(user_agent, timeout_seconds)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse(&self, lat: f64, lon: f64) -> Result<Option<Place>> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("zoom", "10".to_string()),
                ("accept-language", "en".to_string()),
            ])
            .send()
            .await
            .map_err(|e| AppError::GeocodeLookupMiss(format!("({}, {}): {}", lat, lon, e)))?;

        if !response.status().is_success() {
            return Err(AppError::GeocodeLookupMiss(format!(
                "({}, {}): {}",
                lat,
                lon,
                describe_failure(response).await
            )));
        }

        let body: NominatimResponse = response
            .json()
            .await
            .map_err(|e| AppError::GeocodeLookupMiss(format!("({}, {}): {}", lat, lon, e)))?;

        if let Some(error) = body.error {
            debug!("Nominatim has no result for ({}, {}): {}", lat, lon, error);
            return Ok(None);
        }

        Ok(body.address.map(Place::from).filter(|p| !p.is_empty()))
    }
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    // + 0.0 folds -0.0 into 0.0 so both map to the same key
    (value * factor).round() / factor + 0.0
}

/// Cache key for a coordinate, e.g. `40.713|-74.006`
pub fn round_key(lat: f64, lon: f64, places: u32) -> String {
    format!("{}|{}", round_to(lat, places), round_to(lon, places))
}

/// Key plus the rounded point that gets looked up for it
fn row_key(row: &NormalizedActivity, places: u32) -> Option<(String, (f64, f64))> {
    match (row.start_latitude, row.start_longitude) {
        (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((
            round_key(lat, lon, places),
            (round_to(lat, places), round_to(lon, places)),
        )),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub unique_keys: usize,
    pub lookups: usize,
    pub misses: usize,
    pub enriched_rows: usize,
    /// A non-recoverable error ended the lookups early
    pub stopped: bool,
}

/// Fill city/state/country on every row from its start coordinates.
///
/// Issues exactly one lookup per distinct rounded key. Failed or empty
/// lookups leave the fields absent; they never fail the run. An error that
/// is not a lookup miss stops further lookups, and the keys not yet looked
/// up stay empty.
pub async fn enrich<G, C>(
    rows: &mut [NormalizedActivity],
    geocoder: &G,
    pacer: &mut Pacer<C>,
    places: u32,
) -> EnrichStats
where
    G: ReverseGeocoder,
    C: Clock,
{
    let keyed: Vec<Option<(String, (f64, f64))>> =
        rows.iter().map(|row| row_key(row, places)).collect();

    let unique: BTreeMap<&str, (f64, f64)> = keyed
        .iter()
        .flatten()
        .map(|(key, point)| (key.as_str(), *point))
        .collect();

    let mut stats = EnrichStats {
        unique_keys: unique.len(),
        ..EnrichStats::default()
    };

    if unique.is_empty() {
        info!("No start coordinates to geocode");
        for row in rows.iter_mut() {
            row.set_place(None);
        }
        return stats;
    }

    info!(
        "Reverse geocoding {} unique locations for {} activities",
        unique.len(),
        rows.len()
    );

    let mut cache: HashMap<&str, Option<Place>> = HashMap::with_capacity(unique.len());
    for (key, (lat, lon)) in &unique {
        pacer.wait().await;
        let result = geocoder.reverse(*lat, *lon).await;
        pacer.mark();
        stats.lookups += 1;

        let place = match result {
            Ok(Some(place)) => Some(place),
            Ok(None) => {
                warn!("No place found for {}", key);
                stats.misses += 1;
                None
            }
            Err(e) if e.is_recoverable() => {
                warn!("Geocode lookup failed for {}: {}", key, e);
                stats.misses += 1;
                None
            }
            Err(e) => {
                error!("Geocoding stopped at {}: {}", key, e);
                stats.misses += 1;
                stats.stopped = true;
                break;
            }
        };
        cache.insert(*key, place);
    }

    for (row, keyed) in rows.iter_mut().zip(keyed.iter()) {
        let place = keyed
            .as_ref()
            .and_then(|(key, _)| cache.get(key.as_str()))
            .and_then(Option::as_ref);
        if place.is_some() {
            stats.enriched_rows += 1;
        }
        row.set_place(place);
    }

    info!(
        "Geocoding complete: {} lookups, {} misses, {} activities enriched",
        stats.lookups, stats.misses, stats.enriched_rows
    );
    stats
}
