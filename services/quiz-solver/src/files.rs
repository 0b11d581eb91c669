//! Linked file download and best-effort content extraction
//!
//! Files land in the configured download directory so generated analysis code
//! can read them by path. Extraction only covers what can be done without
//! external tooling: text-like formats, JSON and image base64. PDF, audio,
//! archive and spreadsheet payloads are kept on disk unextracted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use provider::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Csv,
    Json,
    Text,
    Xml,
    Html,
    Markdown,
    Pdf,
    Image,
    Audio,
    Archive,
    Spreadsheet,
    Other,
}

impl FileType {
    /// Detect from a file name or URL path by extension.
    pub fn from_name(name: &str) -> Self {
        match extension(name).as_deref() {
            Some("csv") => FileType::Csv,
            Some("json") => FileType::Json,
            Some("txt" | "log") => FileType::Text,
            Some("xml") => FileType::Xml,
            Some("html" | "htm") => FileType::Html,
            Some("md") => FileType::Markdown,
            Some("pdf") => FileType::Pdf,
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg") => FileType::Image,
            Some("mp3" | "wav" | "ogg" | "opus" | "m4a") => FileType::Audio,
            Some("zip" | "tar" | "gz") => FileType::Archive,
            Some("xlsx" | "xls") => FileType::Spreadsheet,
            _ => FileType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Csv => "csv",
            FileType::Json => "json",
            FileType::Text => "text",
            FileType::Xml => "xml",
            FileType::Html => "html",
            FileType::Markdown => "markdown",
            FileType::Pdf => "pdf",
            FileType::Image => "image",
            FileType::Audio => "audio",
            FileType::Archive => "archive",
            FileType::Spreadsheet => "spreadsheet",
            FileType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `data:<mime>;base64,...` URL for images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedFile {
    pub url: String,
    pub filename: String,
    pub local_path: PathBuf,
    pub file_type: FileType,
    pub content: ExtractedContent,
}

/// Downloads one URL and extracts what it can.
pub trait FileProcessor: Send + Sync {
    fn process<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProcessedFile>>;
}

pub struct HttpFileProcessor {
    client: reqwest::Client,
    download_dir: PathBuf,
    timeout: Duration,
}

impl HttpFileProcessor {
    pub fn new(client: reqwest::Client, download_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            client,
            download_dir,
            timeout,
        }
    }

    #[instrument(skip(self), fields(dir = %self.download_dir.display()))]
    async fn download(&self, url: &str) -> Result<ProcessedFile> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::FileProcessing(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FileProcessing(format!("{url}: HTTP {}", status.as_u16())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::FileProcessing(format!("{url}: {e}")))?;

        let filename = filename_from_url(url);
        let file_type = FileType::from_name(&filename);
        let local_path = self.write(&filename, &bytes).await?;
        let content = extract(file_type, &filename, &bytes);

        info!(
            filename = %filename,
            file_type = file_type.as_str(),
            size = bytes.len(),
            has_text = content.text.is_some(),
            "file downloaded"
        );

        Ok(ProcessedFile {
            url: url.to_string(),
            filename,
            local_path,
            file_type,
            content,
        })
    }

    async fn write(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| Error::FileProcessing(format!("create {}: {e}", self.download_dir.display())))?;
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let path = self
            .download_dir
            .join(format!("{}_{filename}", &unique[..8]));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::FileProcessing(format!("write {}: {e}", path.display())))?;
        // Generated code reads by absolute path.
        Ok(std::path::absolute(&path).unwrap_or(path))
    }
}

impl FileProcessor for HttpFileProcessor {
    fn process<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProcessedFile>> {
        Box::pin(self.download(url))
    }
}

/// Last path segment of `url`, or `download` when there is none.
pub fn filename_from_url(url: &str) -> String {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let name = path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download");
    sanitize(name)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

fn extension(name: &str) -> Option<String> {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    let file = name.rsplit('/').next().unwrap_or(name);
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn image_mime(name: &str) -> &'static str {
    match extension(name).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "image/png",
    }
}

/// Best-effort extraction from downloaded bytes.
pub fn extract(file_type: FileType, filename: &str, bytes: &[u8]) -> ExtractedContent {
    match file_type {
        FileType::Csv | FileType::Text | FileType::Xml | FileType::Html | FileType::Markdown => {
            ExtractedContent {
                text: Some(String::from_utf8_lossy(bytes).into_owned()),
                ..Default::default()
            }
        }
        FileType::Json => {
            let raw = String::from_utf8_lossy(bytes).into_owned();
            match serde_json::from_str::<Value>(&raw) {
                Ok(data) => ExtractedContent {
                    text: Some(serde_json::to_string_pretty(&data).unwrap_or(raw)),
                    data: Some(data),
                    ..Default::default()
                },
                Err(e) => {
                    debug!(filename, error = %e, "JSON file did not parse, keeping raw text");
                    ExtractedContent {
                        text: Some(raw),
                        ..Default::default()
                    }
                }
            }
        }
        FileType::Image => ExtractedContent {
            base64: Some(format!(
                "data:{};base64,{}",
                image_mime(filename),
                STANDARD.encode(bytes)
            )),
            ..Default::default()
        },
        FileType::Other => ExtractedContent {
            text: std::str::from_utf8(bytes).ok().map(str::to_string),
            ..Default::default()
        },
        FileType::Pdf | FileType::Audio | FileType::Archive | FileType::Spreadsheet => {
            ExtractedContent::default()
        }
    }
}

/// Remove a session's downloaded files. Missing directories are fine.
pub async fn cleanup(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %path.display(), error = %e, "failed to remove downloaded file");
        }
    }
}
