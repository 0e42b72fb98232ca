//! One end-to-end run: fetch, normalize, enrich, load, mirror.

use crate::auth::refresh_access_token;
use crate::config::Config;
use crate::db::LocalStore;
use crate::error::Result;
use crate::fetcher::ActivityFetcher;
use crate::geocode::{enrich, EnrichStats, NominatimGeocoder, Pacer};
use crate::http::build_client;
use crate::mirror::{to_csv_bytes, write_local_csv, DriveMirror, MirrorOutcome};
use crate::models::{NormalizedActivity, RawActivity};
use crate::normalizer::Normalizer;
use crate::warehouse::{AnyWarehouse, Warehouse};
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_geocode: bool,
    pub skip_mirror: bool,
    /// Stop before anything is written to the warehouse or mirrored
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub fetched: usize,
    pub normalized: usize,
    /// Incremental mode only
    pub raw_inserted: Option<usize>,
    pub geocode: Option<EnrichStats>,
    pub loaded: Option<usize>,
    pub local_csv: Option<PathBuf>,
    pub drive: Option<MirrorOutcome>,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    client: Client,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config) -> Result<Self> {
        Ok(Self {
            config,
            client: build_client(config.http.timeout_seconds)?,
        })
    }

    /// Run every step in order; the first fatal error aborts the rest
    pub async fn run(config: &'a Config, options: RunOptions) -> Result<RunReport> {
        let pipeline = Self::new(config)?;
        let mut report = RunReport::default();

        info!("Starting pipeline run");
        let raws = pipeline.fetch().await?;
        report.fetched = raws.len();

        let mut rows = if config.store.enabled {
            let (rows, inserted) = pipeline.incremental(&raws).await?;
            report.raw_inserted = Some(inserted);
            rows
        } else {
            pipeline.normalize(&raws)
        };
        report.normalized = rows.len();

        if !options.skip_geocode {
            report.geocode = pipeline.geocode(&mut rows).await?;
        } else {
            info!("Geocoding skipped by request");
        }

        if options.dry_run {
            info!(
                "Dry run: {} activities prepared, nothing written",
                rows.len()
            );
            return Ok(report);
        }

        let google_token = pipeline.google_token(&options).await?;

        let warehouse =
            AnyWarehouse::from_config(&config.warehouse, &pipeline.client, google_token.as_deref())
                .await?;
        let loaded = warehouse.load_replace(&rows).await?;
        info!("Loaded {} rows into {}", loaded, warehouse.describe());
        report.loaded = Some(loaded);

        if options.skip_mirror {
            info!("Mirror skipped by request");
        } else {
            report.local_csv = pipeline.mirror_local(&rows)?;
            report.drive = pipeline.mirror_drive(&rows, google_token.as_deref()).await?;
            if let Some(outcome) = &report.drive {
                info!("Drive mirror file id: {}", outcome.file_id());
            }
        }

        info!(
            "Pipeline run complete: {} fetched, {} loaded",
            report.fetched, loaded
        );
        Ok(report)
    }

    /// Fetch and normalize (optionally geocode) without touching any store
    pub async fn extract(config: &'a Config, skip_geocode: bool) -> Result<Vec<NormalizedActivity>> {
        let pipeline = Self::new(config)?;
        let raws = pipeline.fetch().await?;
        let mut rows = pipeline.normalize(&raws);
        if !skip_geocode {
            pipeline.geocode(&mut rows).await?;
        }
        Ok(rows)
    }

    async fn fetch(&self) -> Result<Vec<RawActivity>> {
        let strava = &self.config.strava;
        let token = refresh_access_token(&self.client, &strava.credentials()).await?;

        let fetcher =
            ActivityFetcher::with_client(self.client.clone(), &strava.api_base_url, strava.per_page);
        fetcher.fetch_all(&token).await
    }

    fn normalize(&self, raws: &[RawActivity]) -> Vec<NormalizedActivity> {
        let (rows, stats) = Normalizer::normalize(raws);
        info!(
            "Normalized {} activities ({} without start time, {} without start coordinates)",
            stats.total,
            stats.missing_timestamps + stats.malformed_timestamps,
            stats.missing_start_coordinates
        );
        rows
    }

    /// Persist new raw rows, rebuild the cleaned table and return it
    async fn incremental(&self, raws: &[RawActivity]) -> Result<(Vec<NormalizedActivity>, usize)> {
        let store = LocalStore::open(&self.config.store.path).await?;
        let inserted = store.upsert_raw(raws).await?;
        let rebuilt = store.rebuild_cleaned().await?;
        info!(
            "Local store at {}: {} new raw rows, {} cleaned rows",
            self.config.store.path.display(),
            inserted.inserted,
            rebuilt
        );
        Ok((store.cleaned_activities().await?, inserted.inserted))
    }

    async fn geocode(&self, rows: &mut [NormalizedActivity]) -> Result<Option<EnrichStats>> {
        let settings = &self.config.geocode;
        if !settings.enabled {
            info!("Geocoding disabled");
            return Ok(None);
        }

        let geocoder = NominatimGeocoder::new(
            &settings.base_url,
            &settings.user_agent,
            self.config.http.timeout_seconds,
        )?;
        let mut pacer = Pacer::new(Duration::from_millis(settings.min_interval_ms));
        let stats = enrich(rows, &geocoder, &mut pacer, settings.precision).await;
        Ok(Some(stats))
    }

    /// One Google token per run, only when a step needs it
    async fn google_token(&self, options: &RunOptions) -> Result<Option<String>> {
        let drive_needed = !options.skip_mirror && self.config.drive_target().is_some();
        if !drive_needed && !AnyWarehouse::needs_google_token(&self.config.warehouse) {
            return Ok(None);
        }

        let google = self.config.google()?;
        let token = refresh_access_token(&self.client, &google.credentials()).await?;
        Ok(Some(token))
    }

    fn mirror_local(&self, rows: &[NormalizedActivity]) -> Result<Option<PathBuf>> {
        match &self.config.export.local_dir {
            Some(dir) => {
                let today = chrono::Utc::now().date_naive();
                Ok(Some(write_local_csv(dir, rows, today)?))
            }
            None => Ok(None),
        }
    }

    async fn mirror_drive(
        &self,
        rows: &[NormalizedActivity],
        google_token: Option<&str>,
    ) -> Result<Option<MirrorOutcome>> {
        let (Some(drive), Some(token)) = (self.config.drive_target(), google_token) else {
            info!("No Drive folder configured, skipping upload");
            return Ok(None);
        };
        let Some(folder_id) = drive.folder() else {
            return Ok(None);
        };

        let mirror = DriveMirror::new(self.client.clone(), &drive.api_base_url, token.to_string());
        let content = to_csv_bytes(rows)?;
        let outcome = mirror
            .upload_overwrite(folder_id, &drive.file_name, &content)
            .await?;
        Ok(Some(outcome))
    }
}
