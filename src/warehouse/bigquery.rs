use crate::dashboard::{DashboardFilter, DashboardRow, Domains};
use crate::error::{AppError, Result};
use crate::http::{describe_failure, multipart_related};
use crate::models::{NormalizedActivity, ACTIVITY_COLUMNS};
use crate::normalizer::sanitize_identifier;
use crate::warehouse::{TableRef, Warehouse};
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on job status polls before a job is reported as stuck
const MAX_POLLS: u32 = 600;

/// BigQuery REST client for one table.
///
/// Loads go through a multipart load job with `WRITE_TRUNCATE`, so the
/// table holds either the old or the new rows, never a mix.
pub struct BigQueryWarehouse {
    client: Client,
    base_url: String,
    table: TableRef,
    access_token: String,
    location: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        format!(
            "{} ({})",
            self.message.as_deref().unwrap_or("unknown error"),
            self.reason.as_deref().unwrap_or("no reason")
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    #[serde(default)]
    v: Value,
}

impl BigQueryWarehouse {
    pub fn new(
        client: Client,
        base_url: &str,
        table: TableRef,
        access_token: String,
        location: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            table,
            access_token,
            location,
            poll_interval,
        }
    }

    fn load_metadata(&self) -> Value {
        let fields: Vec<Value> = ACTIVITY_COLUMNS
            .iter()
            .map(|(name, ty)| {
                let mode = if *name == "id" { "REQUIRED" } else { "NULLABLE" };
                json!({
                    "name": sanitize_identifier(name),
                    "type": ty.bigquery_type(),
                    "mode": mode,
                })
            })
            .collect();

        let mut job_reference = json!({ "projectId": self.table.project });
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }

        json!({
            "jobReference": job_reference,
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.table.project,
                        "datasetId": self.table.dataset,
                        "tableId": self.table.table,
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_TRUNCATE",
                    "createDisposition": "CREATE_IF_NEEDED",
                    "schema": { "fields": fields },
                }
            }
        })
    }

    async fn submit_load(&self, rows: &[NormalizedActivity]) -> Result<Job> {
        let mut ndjson = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut ndjson, row)?;
            ndjson.push(b'\n');
        }

        let (content_type, body) =
            multipart_related(&self.load_metadata(), "application/octet-stream", &ndjson);
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url, self.table.project
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Load(format!("load job submission failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Load(format!(
                "load job rejected: {}",
                describe_failure(response).await
            )));
        }

        response
            .json::<Job>()
            .await
            .map_err(|e| AppError::Load(format!("unreadable load job response: {}", e)))
    }

    async fn job_status(&self, reference: &JobReference) -> Result<Job> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.base_url, self.table.project, reference.job_id
        );
        let mut request = self.client.get(&url).bearer_auth(&self.access_token);
        if let Some(location) = reference.location.as_ref().or(self.location.as_ref()) {
            request = request.query(&[("location", location)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Load(format!("job status request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Load(format!(
                "job status for {} failed: {}",
                reference.job_id,
                describe_failure(response).await
            )));
        }

        response
            .json::<Job>()
            .await
            .map_err(|e| AppError::Load(format!("unreadable job status: {}", e)))
    }

    async fn wait_for_job(&self, mut job: Job) -> Result<()> {
        let mut polls = 0;
        loop {
            if let Some(status) = &job.status {
                if let Some(error) = &status.error_result {
                    return Err(AppError::Load(format!(
                        "job {} failed: {}",
                        job.job_reference.job_id,
                        error.describe()
                    )));
                }
                if status.state == "DONE" {
                    return Ok(());
                }
                debug!("Job {} is {}", job.job_reference.job_id, status.state);
            }

            polls += 1;
            if polls > MAX_POLLS {
                return Err(AppError::Load(format!(
                    "job {} did not finish after {} polls",
                    job.job_reference.job_id, MAX_POLLS
                )));
            }

            tokio::time::sleep(self.poll_interval).await;
            job = self.job_status(&job.job_reference).await?;
        }
    }

    /// Run a standard-SQL query and collect every result row as raw cell values
    async fn run_query(&self, sql: &str, parameters: Vec<Value>) -> Result<Vec<Vec<Value>>> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": parameters,
            "timeoutMs": 10_000,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let url = format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.base_url, self.table.project
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Query(format!("query request failed: {}", e)))?;

        let mut page = self.read_query_response(response).await?;
        let mut rows = Vec::new();
        let mut polls = 0;

        loop {
            if !page.errors.is_empty() && !page.job_complete {
                let messages: Vec<String> = page.errors.iter().map(ErrorProto::describe).collect();
                return Err(AppError::Query(messages.join("; ")));
            }

            if page.job_complete {
                rows.extend(
                    page.rows
                        .drain(..)
                        .map(|row| row.f.into_iter().map(|cell| cell.v).collect()),
                );
                if page.page_token.is_none() {
                    return Ok(rows);
                }
            } else {
                polls += 1;
                if polls > MAX_POLLS {
                    return Err(AppError::Query(format!(
                        "query did not finish after {} polls",
                        MAX_POLLS
                    )));
                }
                tokio::time::sleep(self.poll_interval).await;
            }

            let reference = page.job_reference.as_ref().ok_or_else(|| {
                AppError::Query("query response is missing its job reference".to_string())
            })?;
            page = self
                .query_results(reference, page.page_token.as_deref())
                .await?;
        }
    }

    async fn query_results(
        &self,
        reference: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries/{}",
            self.base_url, self.table.project, reference.job_id
        );
        let mut request = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("timeoutMs", "10000")]);
        if let Some(location) = reference.location.as_ref().or(self.location.as_ref()) {
            request = request.query(&[("location", location)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Query(format!("query results request failed: {}", e)))?;
        self.read_query_response(response).await
    }

    async fn read_query_response(&self, response: reqwest::Response) -> Result<QueryResponse> {
        if !response.status().is_success() {
            return Err(AppError::Query(describe_failure(response).await));
        }
        response
            .json::<QueryResponse>()
            .await
            .map_err(|e| AppError::Query(format!("unreadable query response: {}", e)))
    }

    fn quoted_table(&self) -> String {
        format!("`{}`", self.table)
    }
}

impl Warehouse for BigQueryWarehouse {
    async fn load_replace(&self, rows: &[NormalizedActivity]) -> Result<usize> {
        info!(
            "Loading {} rows into {} (WRITE_TRUNCATE)",
            rows.len(),
            self.table
        );

        let job = self.submit_load(rows).await?;
        debug!("Submitted load job {}", job.job_reference.job_id);
        self.wait_for_job(job).await?;

        info!("Load into {} completed", self.table);
        Ok(rows.len())
    }

    async fn query(&self, filter: &DashboardFilter) -> Result<Vec<DashboardRow>> {
        let sql = format!(
            "SELECT local_start_date, subtype, name, distance_miles, elevation_gain, \
             pace_min_per_mile, city, start_latitude, start_longitude \
             FROM {} \
             WHERE local_start_date BETWEEN @start_d AND @end_d \
             AND (ARRAY_LENGTH(@types) = 0 OR subtype IN UNNEST(@types)) \
             AND (ARRAY_LENGTH(@cities) = 0 OR city IN UNNEST(@cities)) \
             ORDER BY local_start_date DESC, local_start_time DESC, id DESC",
            self.quoted_table()
        );
        let parameters = vec![
            date_param("start_d", filter.start),
            date_param("end_d", filter.end),
            string_array_param("types", filter.type_filter().unwrap_or_default()),
            string_array_param("cities", filter.city_filter().unwrap_or_default()),
        ];

        let rows = self.run_query(&sql, parameters).await?;
        rows.iter().map(|cells| dashboard_row(cells)).collect()
    }

    async fn domains(&self) -> Result<Domains> {
        let sql = format!(
            "SELECT \
             ARRAY(SELECT DISTINCT subtype FROM {t} WHERE subtype IS NOT NULL AND subtype != '' ORDER BY subtype), \
             ARRAY(SELECT DISTINCT city FROM {t} WHERE city IS NOT NULL AND city != '' ORDER BY city), \
             (SELECT MIN(local_start_date) FROM {t}), \
             (SELECT MAX(local_start_date) FROM {t})",
            t = self.quoted_table()
        );

        let rows = self.run_query(&sql, Vec::new()).await?;
        let cells = rows
            .first()
            .ok_or_else(|| AppError::Query("domain query returned no rows".to_string()))?;

        Ok(Domains {
            sports: string_array_cell(cells.first()),
            cities: string_array_cell(cells.get(1)),
            min_date: date_cell(cells.get(2))?,
            max_date: date_cell(cells.get(3))?,
        })
    }

    fn describe(&self) -> String {
        format!("bigquery:{}", self.table)
    }
}

fn date_param(name: &str, value: NaiveDate) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": "DATE" },
        "parameterValue": { "value": value.format("%Y-%m-%d").to_string() },
    })
}

fn string_array_param(name: &str, values: &[String]) -> Value {
    let values: Vec<Value> = values.iter().map(|v| json!({ "value": v })).collect();
    json!({
        "name": name,
        "parameterType": { "type": "ARRAY", "arrayType": { "type": "STRING" } },
        "parameterValue": { "arrayValues": values },
    })
}

fn string_cell(cell: Option<&Value>) -> Option<String> {
    cell.and_then(Value::as_str).map(str::to_string)
}

/// BigQuery returns FLOAT cells as strings
fn float_cell(cell: Option<&Value>) -> Option<f64> {
    match cell? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn date_cell(cell: Option<&Value>) -> Result<Option<NaiveDate>> {
    match string_cell(cell) {
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| AppError::Query(format!("unexpected DATE value '{}': {}", s, e))),
        None => Ok(None),
    }
}

fn string_array_cell(cell: Option<&Value>) -> Vec<String> {
    cell.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| string_cell(item.get("v")))
                .collect()
        })
        .unwrap_or_default()
}

fn dashboard_row(cells: &[Value]) -> Result<DashboardRow> {
    let date = date_cell(cells.first())?
        .ok_or_else(|| AppError::Query("result row without a date".to_string()))?;

    if cells.len() < 9 {
        warn!("Short result row with {} cells", cells.len());
    }

    Ok(DashboardRow {
        date,
        subtype: string_cell(cells.get(1)),
        name: string_cell(cells.get(2)),
        distance_miles: float_cell(cells.get(3)),
        elevation_gain: float_cell(cells.get(4)),
        pace_min_per_mile: float_cell(cells.get(5)),
        city: string_cell(cells.get(6)),
        start_latitude: float_cell(cells.get(7)),
        start_longitude: float_cell(cells.get(8)),
    })
}
