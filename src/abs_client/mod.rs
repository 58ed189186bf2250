use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::rate_gate::RateGate;

/// Read-side collaborator: reports per-item consumption progress.
#[async_trait::async_trait]
pub trait LibraryService: Send + Sync {
    async fn get_libraries(&self) -> anyhow::Result<Vec<Library>>;
    async fn get_items_in_progress(&self) -> anyhow::Result<Vec<LibraryItem>>;
    async fn get_library_items(
        &self,
        library_id: &Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<LibraryItem>>;
    async fn get_item_details(&self, item_id: &Uuid) -> anyhow::Result<LibraryItem>;
    /// 404 is a normal "no progress" signal, not an error.
    async fn get_user_progress(&self, item_id: &Uuid) -> anyhow::Result<Option<MediaProgress>>;
}

#[derive(Clone, Debug)]
pub struct AbsClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    gate: Arc<RateGate>,
}

impl AbsClient {
    /// Create a new client with the given base URL (e.g. "http://localhost:13378").
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let base_url_str = base_url.into();
        tracing::debug!(base_url = %base_url_str, "creating AbsClient");
        Ok(AbsClient {
            base_url: base_url_str.trim_end_matches('/').to_string(),
            api_key: None,
            client,
            gate: Arc::new(RateGate::new("audiobookshelf", 5, 600)),
        })
    }

    /// Return a client with the provided API key set (Bearer)
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_rate_gate(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = gate;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn auth_header(&self) -> Option<(String, String)> {
        self.api_key
            .as_ref()
            .map(|k| ("Authorization".to_string(), format!("Bearer {}", k)))
    }

    /// GET the given path through the rate gate and return the body text.
    async fn get_text(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<String> {
        let _permit = self.gate.acquire().await?;
        let url = self.url(path);
        let mut req = self.client.get(&url);
        if let Some((k, v)) = self.auth_header() {
            req = req.header(&k, &v);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        let resp = req.send().await?;
        let status = resp.error_for_status()?;
        Ok(status.text().await?)
    }

    /// GET /status (no auth required)
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_status(&self) -> anyhow::Result<StatusResponse> {
        let body = self.get_text("/status", &[]).await?;
        parse_json(&body, "StatusResponse")
    }
}

#[async_trait::async_trait]
impl LibraryService for AbsClient {
    /// GET /api/libraries
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_libraries(&self) -> anyhow::Result<Vec<Library>> {
        let body = self.get_text("/api/libraries", &[]).await?;
        let parsed: LibrariesResponse = parse_json(&body, "LibrariesResponse")?;
        Ok(parsed.libraries)
    }

    /// GET /api/me/items-in-progress
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_items_in_progress(&self) -> anyhow::Result<Vec<LibraryItem>> {
        let body = self.get_text("/api/me/items-in-progress", &[]).await?;
        let parsed: ItemsInProgressResponse = parse_json(&body, "ItemsInProgressResponse")?;
        Ok(parsed.library_items)
    }

    /// GET /api/libraries/{lib_id}/items
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_library_items(
        &self,
        library_id: &Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<LibraryItem>> {
        let path = format!("/api/libraries/{}/items", library_id);
        let q = [
            ("limit", limit.to_string()),
            ("include", "media,media.metadata".to_string()),
        ];
        let body = self.get_text(&path, &q).await?;
        let parsed: LibraryItemsResponse = parse_json(&body, "LibraryItemsResponse")?;
        Ok(parsed.results)
    }

    /// GET /api/items/{item_id}?expanded=1
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_item_details(&self, item_id: &Uuid) -> anyhow::Result<LibraryItem> {
        let path = format!("/api/items/{}", item_id);
        let q = [("expanded", "1".to_string())];
        let body = self.get_text(&path, &q).await?;
        parse_json(&body, "LibraryItem")
    }

    /// GET /api/me/progress/{item_id}
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_user_progress(&self, item_id: &Uuid) -> anyhow::Result<Option<MediaProgress>> {
        let _permit = self.gate.acquire().await?;
        let url = self.url(&format!("/api/me/progress/{}", item_id));
        let mut req = self.client.get(&url);
        if let Some((k, v)) = self.auth_header() {
            req = req.header(&k, &v);
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(%item_id, "no progress recorded for item");
            return Ok(None);
        }
        let status = resp.error_for_status()?;
        let body = status.text().await?;
        let parsed: MediaProgress = parse_json(&body, "MediaProgress")?;
        Ok(Some(parsed))
    }
}

/// Parse a response body, logging a bounded snippet when the shape is not
/// what we expect.
fn parse_json<T: DeserializeOwned>(body: &str, what: &str) -> anyhow::Result<T> {
    match serde_json::from_str::<T>(body) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            let snippet_len = body.len().min(2000);
            let snippet = &body[..snippet_len];
            tracing::error!(error = %e, body_snippet = %snippet, "failed to parse {}", what);
            Err(anyhow::Error::new(e)).with_context(|| format!("malformed {} response", what))
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub app: Option<String>,
    #[serde(rename = "serverVersion")]
    pub server_version: Option<String>,
    #[serde(rename = "isInit")]
    pub is_init: Option<bool>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct LibrariesResponse {
    pub libraries: Vec<Library>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub id: Uuid,
    pub name: String,
    pub media_type: Option<String>,
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItemsResponse {
    pub results: Vec<LibraryItem>,
    pub total: i64,
    pub limit: i64,
    pub page: i64,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemsInProgressResponse {
    pub library_items: Vec<LibraryItem>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: Uuid,
    pub library_id: Option<String>,
    pub media_type: Option<String>,
    pub media: Media,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl LibraryItem {
    pub fn title(&self) -> &str {
        self.media.metadata.title.as_deref().unwrap_or("Untitled")
    }

    pub fn author(&self) -> &str {
        self.media.metadata.author_name.as_deref().unwrap_or("")
    }

    /// Audiobooks report a duration; ebooks do not.
    pub fn is_audio(&self) -> bool {
        self.media.duration > 0.0
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: Option<String>,
    pub metadata: BookMetadata,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub num_audio_files: i64,
    pub ebook_format: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub author_name: Option<String>,
    pub narrator_name: Option<String>,
    #[serde(
        deserialize_with = "crate::abs_client::de::opt_i64_from_str_or_num",
        default
    )]
    pub published_year: Option<i64>,
    pub publisher: Option<String>,
    pub isbn: Option<String>,
    pub asin: Option<String>,
    pub language: Option<String>,
    pub explicit: Option<bool>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A user's progress for one library item.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaProgress {
    pub id: Option<String>,
    pub library_item_id: Option<Uuid>,
    #[serde(default)]
    pub duration: f64,
    /// 0.0 - 1.0 fraction
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub is_finished: bool,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub last_update: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl MediaProgress {
    pub fn progress_percent(&self) -> f64 {
        (self.progress * 100.0).clamp(0.0, 100.0)
    }

    pub fn started_date(&self) -> Option<chrono::NaiveDate> {
        self.started_at
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|dt| dt.date_naive())
    }

    pub fn finished_date(&self) -> Option<chrono::NaiveDate> {
        self.finished_at
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|dt| dt.date_naive())
    }
}

/// Internal serde helpers
pub mod de {
    use serde::{Deserialize, Deserializer};

    /// Accept Option<i64> from either a number or a string like "2011"; null/"" -> None.
    pub fn opt_i64_from_str_or_num<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum NumOrStr<'a> {
            Num(i64),
            Str(&'a str),
        }

        let val: Option<NumOrStr> = Option::deserialize(deserializer)?;
        Ok(match val {
            None => None,
            Some(NumOrStr::Num(n)) => Some(n),
            Some(NumOrStr::Str(s)) => s.trim().parse::<i64>().ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_deserialize() {
        let json = r#"{ "app": "audiobookshelf", "serverVersion": "2.3.4", "isInit": true }"#;
        let s: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(s.app.unwrap(), "audiobookshelf");
        assert_eq!(s.server_version.unwrap(), "2.3.4");
    }

    #[test]
    fn media_progress_deserialize() {
        let json = r#"{
            "id": "li_abc123",
            "libraryItemId": "075ebcee-d657-4b01-a96d-b94fadb1898c",
            "duration": 33854.9,
            "progress": 0.5124,
            "currentTime": 17348.2,
            "isFinished": false,
            "hideFromContinueListening": false,
            "lastUpdate": 1668120246620,
            "startedAt": 1667326662087,
            "finishedAt": null
        }"#;
        let p: MediaProgress = serde_json::from_str(json).unwrap();
        assert!(!p.is_finished);
        assert!((p.progress_percent() - 51.24).abs() < 1e-9);
        assert_eq!(p.current_time, 17348.2);
        assert!(p.started_date().is_some());
        assert!(p.finished_date().is_none());
    }

    #[test]
    fn items_in_progress_deserialize() {
        let json = r#"{
            "libraryItems": [
                {
                    "id": "075ebcee-d657-4b01-a96d-b94fadb1898c",
                    "libraryId": "55b8b4f3-2ec7-460b-8178-e02b8b619c03",
                    "mediaType": "book",
                    "media": {
                        "id": "8f7a211c-767a-40bd-9e96-659a5c5fb6c0",
                        "metadata": {
                            "title": "Project Hail Mary",
                            "authorName": "Andy Weir",
                            "narratorName": "Ray Porter",
                            "publishedYear": "2021",
                            "isbn": null,
                            "asin": "B08G9PRS1K",
                            "language": "English",
                            "explicit": false
                        },
                        "duration": 58266.4,
                        "numAudioFiles": 1
                    },
                    "progressLastUpdate": 1668120246620
                }
            ]
        }"#;
        let parsed: ItemsInProgressResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.library_items.len(), 1);
        let item = &parsed.library_items[0];
        assert_eq!(item.title(), "Project Hail Mary");
        assert_eq!(item.author(), "Andy Weir");
        assert_eq!(item.media.metadata.asin.as_deref(), Some("B08G9PRS1K"));
        assert_eq!(item.media.metadata.published_year, Some(2021));
        assert!(item.is_audio());
    }

    #[test]
    fn library_items_deserialize_example() {
        let json = r#"{
            "results": [
                {
                    "id": "075ebcee-d657-4b01-a96d-b94fadb1898c",
                    "libraryId": "55b8b4f3-2ec7-460b-8178-e02b8b619c03",
                    "mediaType": "book",
                    "media": {
                        "id": "8f7a211c-767a-40bd-9e96-659a5c5fb6c0",
                        "metadata": {
                            "title": "Player's Handbook",
                            "authorName": "James Wyatt",
                            "publishedYear": null,
                            "isbn": null,
                            "asin": null
                        },
                        "duration": 0,
                        "numAudioFiles": 0,
                        "ebookFormat": "pdf"
                    }
                }
            ],
            "total": 136,
            "limit": 1,
            "page": 0,
            "sortDesc": false,
            "mediaType": "book"
        }"#;
        let parsed: LibraryItemsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.total, 136);
        assert_eq!(parsed.limit, 1);
        assert_eq!(parsed.page, 0);
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].title(), "Player's Handbook");
    }

    #[test]
    fn ebook_item_has_no_duration() {
        let json = r#"{
            "id": "175ebcee-d657-4b01-a96d-b94fadb1898c",
            "mediaType": "book",
            "media": {
                "metadata": { "title": "Dune", "authorName": "Frank Herbert", "isbn": "9780441013593" },
                "duration": 0,
                "ebookFormat": "epub"
            }
        }"#;
        let item: LibraryItem = serde_json::from_str(json).unwrap();
        assert!(!item.is_audio());
        assert_eq!(item.media.ebook_format.as_deref(), Some("epub"));
    }
}
