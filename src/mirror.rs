//! CSV export of the cleaned table and its mirror in a Drive folder.

use crate::error::{AppError, Result};
use crate::http::{describe_failure, multipart_related};
use crate::models::{NormalizedActivity, ACTIVITY_COLUMNS};
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SHORTCUT_MIME: &str = "application/vnd.google-apps.shortcut";
const CSV_MIME: &str = "text/csv";

/// Write rows as CSV with a header, in warehouse column order
pub fn write_csv<W: Write>(rows: &[NormalizedActivity], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    if rows.is_empty() {
        csv_writer.write_record(ACTIVITY_COLUMNS.iter().map(|(name, _)| *name))?;
    }
    for row in rows {
        csv_writer.serialize(row)?;
    }

    csv_writer.flush()?;
    Ok(())
}

pub fn to_csv_bytes(rows: &[NormalizedActivity]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_csv(rows, &mut buffer)?;
    Ok(buffer)
}

/// Write `strava_transformed_YYYYMMDD.csv` into `dir`
pub fn write_local_csv(dir: &Path, rows: &[NormalizedActivity], date: NaiveDate) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("strava_transformed_{}.csv", date.format("%Y%m%d")));

    let file = std::fs::File::create(&path)?;
    write_csv(rows, std::io::BufWriter::new(file))?;

    info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Updated { file_id: String },
    Created { file_id: String },
}

impl MirrorOutcome {
    pub fn file_id(&self) -> &str {
        match self {
            MirrorOutcome::Updated { file_id } | MirrorOutcome::Created { file_id } => file_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    shortcut_details: Option<ShortcutDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShortcutDetails {
    #[serde(default)]
    target_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Drive v3 client that keeps a single named file per folder
pub struct DriveMirror {
    client: Client,
    base_url: String,
    access_token: String,
}

impl DriveMirror {
    pub fn new(client: Client, base_url: &str, access_token: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    /// Upload `content` as `file_name` in the folder, replacing the content
    /// of an existing file with that name instead of adding a duplicate.
    pub async fn upload_overwrite(
        &self,
        folder_id: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<MirrorOutcome> {
        let folder = self.resolve_folder(folder_id).await?;
        if folder != folder_id {
            debug!("Folder {} is a shortcut to {}", folder_id, folder);
        }

        match self.find_file(&folder, file_name).await? {
            Some(file_id) => {
                self.update_content(&file_id, content).await?;
                info!("Updated {} ({}) in Drive folder {}", file_name, file_id, folder);
                Ok(MirrorOutcome::Updated { file_id })
            }
            None => {
                let file_id = self.create_file(&folder, file_name, content).await?;
                info!("Created {} ({}) in Drive folder {}", file_name, file_id, folder);
                Ok(MirrorOutcome::Created { file_id })
            }
        }
    }

    /// Folder id, following a single shortcut hop
    pub async fn resolve_folder(&self, folder_id: &str) -> Result<String> {
        let file = self.metadata(folder_id).await?;
        match file.mime_type.as_deref() {
            Some(FOLDER_MIME) => Ok(file.id),
            Some(SHORTCUT_MIME) => {
                let target_id = file
                    .shortcut_details
                    .and_then(|d| d.target_id)
                    .ok_or_else(|| {
                        AppError::Config(format!("Drive shortcut {} has no target", folder_id))
                    })?;
                let target = self.metadata(&target_id).await?;
                if target.mime_type.as_deref() == Some(FOLDER_MIME) {
                    Ok(target.id)
                } else {
                    Err(AppError::Config(format!(
                        "Drive shortcut {} does not point to a folder (target {} is {})",
                        folder_id,
                        target_id,
                        target.mime_type.as_deref().unwrap_or("unknown")
                    )))
                }
            }
            other => Err(AppError::Config(format!(
                "Drive id {} is not a folder ({})",
                folder_id,
                other.unwrap_or("unknown")
            ))),
        }
    }

    async fn metadata(&self, file_id: &str) -> Result<DriveFile> {
        let url = format!("{}/drive/v3/files/{}", self.base_url, file_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("fields", "id,name,mimeType,shortcutDetails"),
                ("supportsAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Mirror(format!("metadata request for {} failed: {}", file_id, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::Config(format!(
                "Drive folder {} not found or not shared with this account",
                file_id
            )));
        }
        if !response.status().is_success() {
            return Err(AppError::Mirror(format!(
                "metadata for {}: {}",
                file_id,
                describe_failure(response).await
            )));
        }

        response
            .json::<DriveFile>()
            .await
            .map_err(|e| AppError::Mirror(format!("unreadable metadata for {}: {}", file_id, e)))
    }

    /// Id of a non-trashed file with this exact name directly in the folder
    async fn find_file(&self, folder_id: &str, file_name: &str) -> Result<Option<String>> {
        let q = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(file_name),
            escape_query(folder_id)
        );
        let url = format!("{}/drive/v3/files", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("q", q.as_str()),
                ("fields", "files(id,name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Mirror(format!("file listing failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Mirror(format!(
                "file listing: {}",
                describe_failure(response).await
            )));
        }

        let list = response
            .json::<FileList>()
            .await
            .map_err(|e| AppError::Mirror(format!("unreadable file listing: {}", e)))?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn update_content(&self, file_id: &str, content: &[u8]) -> Result<()> {
        let url = format!("{}/upload/drive/v3/files/{}", self.base_url, file_id);
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
            .header(reqwest::header::CONTENT_TYPE, CSV_MIME)
            .body(content.to_vec())
            .send()
            .await
            .map_err(|e| AppError::Mirror(format!("update of {} failed: {}", file_id, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Mirror(format!(
                "update of {}: {}",
                file_id,
                describe_failure(response).await
            )));
        }
        Ok(())
    }

    async fn create_file(&self, folder_id: &str, file_name: &str, content: &[u8]) -> Result<String> {
        let metadata = json!({
            "name": file_name,
            "parents": [folder_id],
            "mimeType": CSV_MIME,
        });
        let (content_type, body) = multipart_related(&metadata, CSV_MIME, content);

        let url = format!("{}/upload/drive/v3/files", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("uploadType", "multipart"),
                ("fields", "id"),
                ("supportsAllDrives", "true"),
            ])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Mirror(format!("create of {} failed: {}", file_name, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Mirror(format!(
                "create of {}: {}",
                file_name,
                describe_failure(response).await
            )));
        }

        let file = response
            .json::<DriveFile>()
            .await
            .map_err(|e| AppError::Mirror(format!("unreadable create response: {}", e)))?;
        Ok(file.id)
    }
}

/// Escape a literal for a Drive `q` expression
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
