use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::NaiveDate;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::rate_gate::RateGate;

pub const STATUS_WANT_TO_READ: i32 = 1;
pub const STATUS_READING: i32 = 2;
pub const STATUS_READ: i32 = 3;

const USER_BOOKS_PAGE_SIZE: usize = 100;

/// Write-side collaborator: the user's book list, reading sessions, and
/// statuses, behind a GraphQL endpoint.
#[async_trait::async_trait]
pub trait CatalogService: Send + Sync {
    async fn get_user_books(&self) -> anyhow::Result<Vec<UserBook>>;
    async fn get_book_current_progress(&self, user_book_id: i64)
    -> anyhow::Result<CurrentProgress>;
    async fn insert_reading_session(
        &self,
        user_book_id: i64,
        value: i64,
        edition_id: Option<i64>,
        started_at: Option<NaiveDate>,
        finished_at: Option<NaiveDate>,
        use_seconds: bool,
    ) -> anyhow::Result<Option<SessionRecord>>;
    /// `started_at = None` preserves the session's original start date.
    async fn update_reading_session(
        &self,
        session_id: i64,
        value: i64,
        edition_id: Option<i64>,
        started_at: Option<NaiveDate>,
        finished_at: Option<NaiveDate>,
        use_seconds: bool,
    ) -> anyhow::Result<Option<SessionRecord>>;
    /// Returns false when the catalog did not confirm the new status.
    async fn update_book_status(&self, user_book_id: i64, status_id: i32) -> anyhow::Result<bool>;
    async fn search_by_isbn(&self, isbn: &str) -> anyhow::Result<Vec<Edition>>;
    async fn search_by_asin(&self, asin: &str) -> anyhow::Result<Vec<Edition>>;
    async fn add_book_to_library(
        &self,
        book_id: i64,
        status_id: i32,
        edition_id: Option<i64>,
    ) -> anyhow::Result<Option<i64>>;
}

#[derive(Clone, Debug)]
pub struct HardcoverClient {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
    gate: Arc<RateGate>,
}

impl HardcoverClient {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let endpoint_str = endpoint.into();
        tracing::debug!(endpoint = %endpoint_str, "creating HardcoverClient");
        Ok(HardcoverClient {
            endpoint: endpoint_str,
            token: None,
            client,
            gate: Arc::new(RateGate::new("hardcover", 1, 55)),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_rate_gate(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = gate;
        self
    }

    /// POST one GraphQL operation through the rate gate and return the
    /// `data` payload. GraphQL-level errors are reported as failures, never
    /// coerced into a partial result.
    async fn post_graphql(&self, query: &str, variables: Value) -> anyhow::Result<Value> {
        let _permit = self.gate.acquire().await?;
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        let resp = req.send().await?;
        let status = resp.error_for_status()?;
        let body = status.text().await?;
        decode_envelope(&body)
    }

    fn field<T: DeserializeOwned>(data: &Value, name: &str) -> anyhow::Result<T> {
        let value = data.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).with_context(|| format!("malformed {} payload", name))
    }

    /// query { me }: cheap authenticated probe, also resolves the account.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_me(&self) -> anyhow::Result<MeUser> {
        let query = "query Me { me { id username } }";
        let data = self.post_graphql(query, json!({})).await?;
        // `me` comes back as an object or an array of one depending on the
        // API version; normalize here.
        let me: OneOrMany<MeUser> = Self::field(&data, "me")?;
        me.into_vec()
            .into_iter()
            .next()
            .context("me query returned no account")
    }
}

#[async_trait::async_trait]
impl CatalogService for HardcoverClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_user_books(&self) -> anyhow::Result<Vec<UserBook>> {
        let query = "query UserBooks($offset: Int!, $limit: Int!) {
            user_books(offset: $offset, limit: $limit, order_by: {id: asc}) {
                id
                status_id
                edition { id book_id isbn_10 isbn_13 asin pages audio_seconds }
                book {
                    id
                    title
                    contributions { author { name } }
                    editions { id book_id isbn_10 isbn_13 asin pages audio_seconds }
                }
            }
        }";
        let mut all = Vec::new();
        let mut offset = 0usize;
        loop {
            let data = self
                .post_graphql(
                    query,
                    json!({ "offset": offset, "limit": USER_BOOKS_PAGE_SIZE }),
                )
                .await?;
            let page: Vec<UserBook> = Self::field(&data, "user_books")?;
            let fetched = page.len();
            all.extend(page);
            if fetched < USER_BOOKS_PAGE_SIZE {
                break;
            }
            offset += USER_BOOKS_PAGE_SIZE;
        }
        tracing::debug!(count = all.len(), "fetched user books");
        Ok(all)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_book_current_progress(
        &self,
        user_book_id: i64,
    ) -> anyhow::Result<CurrentProgress> {
        let query = "query CurrentProgress($id: Int!) {
            user_book_reads(
                where: {user_book_id: {_eq: $id}},
                order_by: {id: desc},
                limit: 1
            ) {
                id user_book_id progress_pages progress_seconds edition_id started_at finished_at
            }
            user_books_by_pk(id: $id) { id status_id }
        }";
        let data = self.post_graphql(query, json!({ "id": user_book_id })).await?;
        let reads: Vec<SessionRecord> = Self::field(&data, "user_book_reads")?;
        let user_book: Option<UserBook> = Self::field(&data, "user_books_by_pk")?;
        let latest_read = reads.into_iter().next();
        Ok(CurrentProgress {
            has_progress: latest_read.is_some(),
            latest_read,
            user_book,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn insert_reading_session(
        &self,
        user_book_id: i64,
        value: i64,
        edition_id: Option<i64>,
        started_at: Option<NaiveDate>,
        finished_at: Option<NaiveDate>,
        use_seconds: bool,
    ) -> anyhow::Result<Option<SessionRecord>> {
        let query = "mutation InsertRead($id: Int!, $read: DatesReadInput!) {
            insert_user_book_read(user_book_id: $id, user_book_read: $read) {
                user_book_read {
                    id user_book_id progress_pages progress_seconds edition_id started_at finished_at
                }
            }
        }";
        let read = session_input(value, edition_id, started_at, finished_at, use_seconds);
        let data = self
            .post_graphql(query, json!({ "id": user_book_id, "read": read }))
            .await?;
        let result = data
            .get("insert_user_book_read")
            .and_then(|v| v.get("user_book_read"))
            .cloned()
            .unwrap_or(Value::Null);
        decode_session_record(result)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_reading_session(
        &self,
        session_id: i64,
        value: i64,
        edition_id: Option<i64>,
        started_at: Option<NaiveDate>,
        finished_at: Option<NaiveDate>,
        use_seconds: bool,
    ) -> anyhow::Result<Option<SessionRecord>> {
        let query = "mutation UpdateRead($id: Int!, $read: DatesReadInput!) {
            update_user_book_read(id: $id, object: $read) {
                user_book_read {
                    id user_book_id progress_pages progress_seconds edition_id started_at finished_at
                }
            }
        }";
        let read = session_input(value, edition_id, started_at, finished_at, use_seconds);
        let data = self
            .post_graphql(query, json!({ "id": session_id, "read": read }))
            .await?;
        let result = data
            .get("update_user_book_read")
            .and_then(|v| v.get("user_book_read"))
            .cloned()
            .unwrap_or(Value::Null);
        decode_session_record(result)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_book_status(&self, user_book_id: i64, status_id: i32) -> anyhow::Result<bool> {
        let query = "mutation UpdateStatus($id: Int!, $object: UserBookUpdateInput!) {
            update_user_book(id: $id, object: $object) {
                user_book { id status_id }
            }
        }";
        let data = self
            .post_graphql(
                query,
                json!({ "id": user_book_id, "object": { "status_id": status_id } }),
            )
            .await?;
        let confirmed = data
            .get("update_user_book")
            .and_then(|v| v.get("user_book"))
            .is_some_and(|v| !v.is_null());
        if !confirmed {
            tracing::warn!(user_book_id, status_id, "status update not confirmed by catalog");
        }
        Ok(confirmed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn search_by_isbn(&self, isbn: &str) -> anyhow::Result<Vec<Edition>> {
        let query = "query EditionsByIsbn($isbn: String!) {
            editions(
                where: {_or: [{isbn_13: {_eq: $isbn}}, {isbn_10: {_eq: $isbn}}]},
                limit: 5
            ) {
                id book_id isbn_10 isbn_13 asin pages audio_seconds
            }
        }";
        let data = self.post_graphql(query, json!({ "isbn": isbn })).await?;
        Self::field(&data, "editions")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn search_by_asin(&self, asin: &str) -> anyhow::Result<Vec<Edition>> {
        let query = "query EditionsByAsin($asin: String!) {
            editions(where: {asin: {_eq: $asin}}, limit: 5) {
                id book_id isbn_10 isbn_13 asin pages audio_seconds
            }
        }";
        let data = self.post_graphql(query, json!({ "asin": asin })).await?;
        Self::field(&data, "editions")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn add_book_to_library(
        &self,
        book_id: i64,
        status_id: i32,
        edition_id: Option<i64>,
    ) -> anyhow::Result<Option<i64>> {
        let query = "mutation AddBook($object: UserBookCreateInput!) {
            insert_user_book(object: $object) {
                id
                user_book { id }
            }
        }";
        let mut object = serde_json::Map::new();
        object.insert("book_id".into(), json!(book_id));
        object.insert("status_id".into(), json!(status_id));
        if let Some(e) = edition_id {
            object.insert("edition_id".into(), json!(e));
        }
        let data = self
            .post_graphql(query, json!({ "object": Value::Object(object) }))
            .await?;
        let inserted = data.get("insert_user_book").cloned().unwrap_or(Value::Null);
        let id = inserted
            .get("id")
            .and_then(Value::as_i64)
            .or_else(|| {
                inserted
                    .get("user_book")
                    .and_then(|v| v.get("id"))
                    .and_then(Value::as_i64)
            });
        Ok(id)
    }
}

/// Build the DatesReadInput object. Absent keys are left out entirely so the
/// catalog preserves existing values on update.
fn session_input(
    value: i64,
    edition_id: Option<i64>,
    started_at: Option<NaiveDate>,
    finished_at: Option<NaiveDate>,
    use_seconds: bool,
) -> Value {
    let mut read = serde_json::Map::new();
    let progress_key = if use_seconds {
        "progress_seconds"
    } else {
        "progress_pages"
    };
    read.insert(progress_key.into(), json!(value));
    if let Some(e) = edition_id {
        read.insert("edition_id".into(), json!(e));
    }
    if let Some(d) = started_at {
        read.insert("started_at".into(), json!(d.to_string()));
    }
    if let Some(d) = finished_at {
        read.insert("finished_at".into(), json!(d.to_string()));
    }
    Value::Object(read)
}

/// Parse the GraphQL envelope; errors in the response body are failures.
fn decode_envelope(body: &str) -> anyhow::Result<Value> {
    #[derive(Deserialize)]
    struct Envelope {
        data: Option<Value>,
        #[serde(default)]
        errors: Vec<GraphqlError>,
    }
    #[derive(Deserialize, Debug)]
    struct GraphqlError {
        message: String,
    }

    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(e) => {
            let snippet_len = body.len().min(2000);
            let snippet = &body[..snippet_len];
            tracing::error!(error = %e, body_snippet = %snippet, "failed to parse GraphQL envelope");
            return Err(anyhow::Error::new(e)).context("malformed GraphQL response");
        }
    };
    if !envelope.errors.is_empty() {
        let messages: Vec<String> = envelope.errors.into_iter().map(|e| e.message).collect();
        bail!("GraphQL error: {}", messages.join("; "));
    }
    envelope.data.context("GraphQL response missing data")
}

/// The mutations return the affected row as an object or an array of one.
fn decode_session_record(value: Value) -> anyhow::Result<Option<SessionRecord>> {
    if value.is_null() {
        return Ok(None);
    }
    let normalized: OneOrMany<SessionRecord> =
        serde_json::from_value(value).context("malformed user_book_read payload")?;
    Ok(normalized.into_vec().into_iter().next())
}

/// Normalization for remote shapes that are sometimes a single object and
/// sometimes an array of one. Business logic never branches on this.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MeUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UserBook {
    pub id: i64,
    pub status_id: Option<i32>,
    pub edition: Option<Edition>,
    pub book: Option<CatalogBook>,
}

impl UserBook {
    pub fn title(&self) -> &str {
        self.book
            .as_ref()
            .and_then(|b| b.title.as_deref())
            .unwrap_or("")
    }

    pub fn author_name(&self) -> &str {
        self.book
            .as_ref()
            .map(|b| b.author_name())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatalogBook {
    pub id: i64,
    pub title: Option<String>,
    #[serde(default)]
    pub contributions: Vec<Contribution>,
    #[serde(default)]
    pub editions: Vec<Edition>,
}

impl CatalogBook {
    pub fn author_name(&self) -> &str {
        self.contributions
            .first()
            .and_then(|c| c.author.as_ref())
            .and_then(|a| a.name.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Contribution {
    pub author: Option<Author>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Author {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Edition {
    pub id: i64,
    pub book_id: Option<i64>,
    pub isbn_10: Option<String>,
    pub isbn_13: Option<String>,
    pub asin: Option<String>,
    pub pages: Option<i64>,
    pub audio_seconds: Option<i64>,
}

/// One read/listen attempt recorded in the catalog. `progress_pages` and
/// `progress_seconds` are mutually exclusive by format.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub user_book_id: Option<i64>,
    pub progress_pages: Option<i64>,
    pub progress_seconds: Option<i64>,
    pub edition_id: Option<i64>,
    pub started_at: Option<NaiveDate>,
    pub finished_at: Option<NaiveDate>,
}

impl SessionRecord {
    pub fn progress_value(&self) -> Option<i64> {
        self.progress_seconds.or(self.progress_pages)
    }

    /// A session with a finish date is closed; further progress is a re-read.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentProgress {
    pub latest_read: Option<SessionRecord>,
    pub user_book: Option<UserBook>,
    pub has_progress: bool,
}
