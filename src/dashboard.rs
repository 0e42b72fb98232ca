//! Read-only views over the warehouse table: filters, KPIs and series.

use crate::error::{AppError, Result};
use crate::normalizer::round2;
use crate::warehouse::Warehouse;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

/// Sentinel choice meaning "no restriction"
pub const ALL: &str = "(All)";

/// Cities shown in the by-city breakdown
const TOP_CITIES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardFilter {
    pub start: NaiveDate,
    pub end: NaiveDate,
    activity_types: Vec<String>,
    cities: Vec<String>,
}

impl DashboardFilter {
    /// Inclusive date range; `start > end` is rejected
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(AppError::Config(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            activity_types: Vec::new(),
            cities: Vec::new(),
        })
    }

    /// Restrict to these activity types; empty or containing `(All)` means all
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activity_types = selection(types);
        self
    }

    /// Restrict to these cities; empty or containing `(All)` means all
    pub fn with_cities<I, S>(mut self, cities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cities = selection(cities);
        self
    }

    pub fn type_filter(&self) -> Option<&[String]> {
        non_empty(&self.activity_types)
    }

    pub fn city_filter(&self) -> Option<&[String]> {
        non_empty(&self.cities)
    }
}

fn selection<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut values: Vec<String> = values
        .into_iter()
        .map(Into::into)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.iter().any(|v| v == ALL) {
        return Vec::new();
    }
    values.sort();
    values.dedup();
    values
}

fn non_empty(values: &[String]) -> Option<&[String]> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Projection of an activity used by the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DashboardRow {
    pub date: NaiveDate,
    pub subtype: Option<String>,
    pub name: Option<String>,
    pub distance_miles: Option<f64>,
    /// Feet
    pub elevation_gain: Option<f64>,
    pub pace_min_per_mile: Option<f64>,
    pub city: Option<String>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
}

/// Choices offered to the filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Domains {
    pub sports: Vec<String>,
    pub cities: Vec<String>,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

impl Domains {
    /// Type choices with the `(All)` sentinel first
    pub fn sport_choices(&self) -> Vec<String> {
        std::iter::once(ALL.to_string())
            .chain(self.sports.iter().cloned())
            .collect()
    }

    pub fn city_choices(&self) -> Vec<String> {
        std::iter::once(ALL.to_string())
            .chain(self.cities.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub activities: usize,
    /// Rounded to one decimal
    pub total_miles: f64,
    pub median_pace: Option<f64>,
    /// Whole feet
    pub total_elevation_ft: i64,
}

impl Summary {
    pub fn from_rows(rows: &[DashboardRow]) -> Self {
        let total_miles: f64 = rows.iter().filter_map(|r| r.distance_miles).sum();
        let paces: Vec<f64> = rows.iter().filter_map(|r| r.pace_min_per_mile).collect();
        let total_elevation: f64 = rows.iter().filter_map(|r| r.elevation_gain).sum();

        Self {
            activities: rows.len(),
            total_miles: (total_miles * 10.0).round_ties_even() / 10.0,
            median_pace: median(&paces).map(round2),
            total_elevation_ft: total_elevation.trunc() as i64,
        }
    }
}

/// Median of the values; `None` when there are none
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Total miles per day, ascending by date
pub fn miles_by_day(rows: &[DashboardRow]) -> Vec<(NaiveDate, f64)> {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in rows {
        *by_day.entry(row.date).or_default() += row.distance_miles.unwrap_or(0.0);
    }
    by_day.into_iter().collect()
}

/// Median pace per day, skipping days without any pace
pub fn median_pace_by_day(rows: &[DashboardRow]) -> Vec<(NaiveDate, f64)> {
    let mut by_day: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for row in rows {
        if let Some(pace) = row.pace_min_per_mile {
            by_day.entry(row.date).or_default().push(pace);
        }
    }
    by_day
        .into_iter()
        .filter_map(|(day, paces)| median(&paces).map(|m| (day, m)))
        .collect()
}

/// Total elevation gain (feet) per day, ascending by date
pub fn elevation_by_day(rows: &[DashboardRow]) -> Vec<(NaiveDate, f64)> {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in rows {
        *by_day.entry(row.date).or_default() += row.elevation_gain.unwrap_or(0.0);
    }
    by_day.into_iter().collect()
}

/// Ten cities with the most miles, descending; rows without a city are left out
pub fn top_cities_by_miles(rows: &[DashboardRow]) -> Vec<(String, f64)> {
    let mut by_city: HashMap<&str, f64> = HashMap::new();
    for row in rows {
        if let Some(city) = row.city.as_deref() {
            *by_city.entry(city).or_default() += row.distance_miles.unwrap_or(0.0);
        }
    }
    let mut cities: Vec<(String, f64)> = by_city
        .into_iter()
        .map(|(city, miles)| (city.to_string(), miles))
        .collect();
    cities.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    cities.truncate(TOP_CITIES);
    cities
}

/// Start coordinates of rows that have both
pub fn map_points(rows: &[DashboardRow]) -> Vec<(f64, f64)> {
    rows.iter()
        .filter_map(|r| Some((r.start_latitude?, r.start_longitude?)))
        .collect()
}

/// Everything the dashboard shows for one filter
#[derive(Debug, Clone)]
pub struct DashboardView {
    pub filter: DashboardFilter,
    pub rows: Vec<DashboardRow>,
}

impl DashboardView {
    pub fn render(&self) -> String {
        render(&self.filter, &self.rows)
    }
}

/// Query the warehouse for the filter
pub async fn load_view<W: Warehouse>(warehouse: &W, filter: DashboardFilter) -> Result<DashboardView> {
    let rows = warehouse.query(&filter).await?;
    Ok(DashboardView { filter, rows })
}

/// Plain-text rendering for the terminal
pub fn render(filter: &DashboardFilter, rows: &[DashboardRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Strava activities {} to {}",
        filter.start, filter.end
    );
    let _ = writeln!(
        out,
        "Types: {}   Cities: {}",
        describe_selection(filter.type_filter()),
        describe_selection(filter.city_filter())
    );
    out.push('\n');

    if rows.is_empty() {
        out.push_str("No data for the current filters.\n");
        return out;
    }

    let summary = Summary::from_rows(rows);
    let _ = writeln!(out, "{:<20} {}", "Activities", summary.activities);
    let _ = writeln!(out, "{:<20} {:.1}", "Total miles", summary.total_miles);
    let _ = writeln!(
        out,
        "{:<20} {}",
        "Median pace",
        summary
            .median_pace
            .map(|p| format!("{:.2} min/mi", p))
            .unwrap_or_else(|| "-".to_string())
    );
    let _ = writeln!(
        out,
        "{:<20} {} ft",
        "Total elevation", summary.total_elevation_ft
    );

    section(&mut out, "Miles by day");
    for (day, miles) in miles_by_day(rows) {
        let _ = writeln!(out, "  {}  {:>8.2}", day, miles);
    }

    section(&mut out, "Median pace by day");
    for (day, pace) in median_pace_by_day(rows) {
        let _ = writeln!(out, "  {}  {:>8.2}", day, pace);
    }

    section(&mut out, "Top cities by miles");
    for (city, miles) in top_cities_by_miles(rows) {
        let _ = writeln!(out, "  {:<24} {:>8.2}", truncate(&city, 24), miles);
    }

    section(&mut out, "Elevation gain by day (ft)");
    for (day, feet) in elevation_by_day(rows) {
        let _ = writeln!(out, "  {}  {:>8.0}", day, feet);
    }

    section(&mut out, "Map");
    let _ = writeln!(
        out,
        "  {} activities with start coordinates",
        map_points(rows).len()
    );

    section(&mut out, "Activities");
    let _ = writeln!(
        out,
        "  {:<10}  {:<12} {:<18} {:<30} {:>7} {:>6} {:>7}",
        "Date", "Type", "City", "Name", "Miles", "Pace", "Elev"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "  {:<10}  {:<12} {:<18} {:<30} {:>7} {:>6} {:>7}",
            row.date,
            truncate(row.subtype.as_deref().unwrap_or("-"), 12),
            truncate(row.city.as_deref().unwrap_or("-"), 18),
            truncate(row.name.as_deref().unwrap_or("-"), 30),
            fmt_opt(row.distance_miles, 2),
            fmt_opt(row.pace_min_per_mile, 2),
            fmt_opt(row.elevation_gain, 0),
        );
    }

    out
}

/// The values each filter accepts, `(All)` first
pub fn render_choices(domains: &Domains) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Available types: {}", domains.sport_choices().join(", "));
    let _ = writeln!(out, "Available cities: {}", domains.city_choices().join(", "));
    out
}

fn describe_selection(values: Option<&[String]>) -> String {
    match values {
        Some(values) => values.join(", "),
        None => ALL.to_string(),
    }
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{}", title);
    let _ = writeln!(out, "{}", "-".repeat(title.len()));
}

fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", decimals, v),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
        cut.push('~');
        cut
    }
}
