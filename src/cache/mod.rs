//! Durable last-known sync state, keyed by (user, identifier, identifier
//! type, title). The orchestrator consults this before doing any remote
//! work; a lookup failure must degrade toward re-syncing, never toward
//! silently skipping a book.

use std::fmt;

use chrono::Utc;
use entities::books::{self, Entity as Books};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, Statement,
};

/// Progress deltas at or below this many percentage points are noise.
const PROGRESS_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierType {
    Isbn,
    Asin,
    TitleAuthor,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Isbn => "isbn",
            IdentifierType::Asin => "asin",
            IdentifierType::TitleAuthor => "title_author",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cache lookup key. A single item can be cached under several of
/// these over its lifetime (e.g. title_author first, isbn later).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub identifier: String,
    pub kind: IdentifierType,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedInfo {
    pub exists: bool,
    pub edition_id: Option<String>,
    pub progress_percent: Option<f64>,
    pub status_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncChanges {
    pub progress_changed: bool,
    pub status_changed: bool,
    pub edition_changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncCheck {
    pub needs_sync: bool,
    pub reason: String,
    pub changes: SyncChanges,
}

#[derive(Debug, Clone, Default)]
pub struct StoreSyncData {
    pub user_id: String,
    pub identifier: String,
    pub kind: Option<IdentifierType>,
    pub title: String,
    pub author: Option<String>,
    pub edition_id: Option<String>,
    pub progress_percent: Option<f64>,
    pub status_id: Option<i32>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub total: u64,
    /// Rows updated within the last 7 days.
    pub recent: u64,
    pub size_on_disk_bytes: i64,
}

pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct ProgressCache {
    db: DatabaseConnection,
}

impl ProgressCache {
    pub fn new(db: DatabaseConnection) -> Self {
        ProgressCache { db }
    }

    async fn lookup(
        &self,
        user_id: &str,
        identifier: &str,
        title: &str,
        kind: IdentifierType,
    ) -> anyhow::Result<Option<books::Model>> {
        let found = Books::find()
            .filter(books::Column::UserId.eq(user_id))
            .filter(books::Column::Identifier.eq(identifier))
            .filter(books::Column::IdentifierType.eq(kind.as_str()))
            .filter(books::Column::Title.eq(normalize_title(title)))
            .one(&self.db)
            .await?;
        Ok(found)
    }

    /// Never fails: storage errors degrade to "not cached".
    pub async fn get_cached_info(
        &self,
        user_id: &str,
        identifier: &str,
        title: &str,
        kind: IdentifierType,
    ) -> CachedInfo {
        match self.lookup(user_id, identifier, title, kind).await {
            Ok(Some(model)) => CachedInfo {
                exists: true,
                edition_id: model.edition_id,
                progress_percent: model.progress_percent,
                status_id: model.status_id,
            },
            Ok(None) => CachedInfo::default(),
            Err(e) => {
                tracing::warn!(error = %e, identifier, kind = %kind, "cache lookup failed");
                CachedInfo::default()
            }
        }
    }

    /// Check every applicable key before deciding "not cached". Returns the
    /// first hit in the order given.
    pub async fn find_any(
        &self,
        user_id: &str,
        title: &str,
        keys: &[CacheKey],
    ) -> Option<(CacheKey, CachedInfo)> {
        for key in keys {
            let info = self
                .get_cached_info(user_id, &key.identifier, title, key.kind)
                .await;
            if info.exists {
                return Some((key.clone(), info));
            }
        }
        None
    }

    /// Upsert by the unique (user, identifier, type, title) key. On the
    /// update path, fields not supplied keep their stored values.
    pub async fn store_sync_data(&self, data: StoreSyncData) -> anyhow::Result<()> {
        let kind = data.kind.unwrap_or(IdentifierType::TitleAuthor);
        let title = normalize_title(&data.title);
        let now = Utc::now();
        let existing = self
            .lookup(&data.user_id, &data.identifier, &title, kind)
            .await?;

        match existing {
            Some(model) => {
                let mut active: books::ActiveModel = model.into();
                if data.author.is_some() {
                    active.author = Set(data.author);
                }
                if data.edition_id.is_some() {
                    active.edition_id = Set(data.edition_id);
                }
                if data.progress_percent.is_some() {
                    active.progress_percent = Set(data.progress_percent);
                }
                if data.status_id.is_some() {
                    active.status_id = Set(data.status_id);
                }
                if data.started_at.is_some() {
                    active.started_at = Set(data.started_at);
                }
                if data.finished_at.is_some() {
                    active.finished_at = Set(data.finished_at);
                }
                active.last_sync = Set(now);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = books::ActiveModel {
                    user_id: Set(data.user_id),
                    identifier: Set(data.identifier),
                    identifier_type: Set(kind.as_str().to_string()),
                    title: Set(title),
                    author: Set(data.author),
                    edition_id: Set(data.edition_id),
                    progress_percent: Set(data.progress_percent),
                    status_id: Set(data.status_id),
                    started_at: Set(data.started_at),
                    finished_at: Set(data.finished_at),
                    last_sync: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    /// Changed iff the delta exceeds 0.01 percentage points. A missing
    /// record counts as changed.
    pub async fn has_progress_changed(
        &self,
        user_id: &str,
        identifier: &str,
        title: &str,
        new_progress: f64,
        kind: IdentifierType,
    ) -> bool {
        let info = self.get_cached_info(user_id, identifier, title, kind).await;
        if !info.exists {
            return true;
        }
        match info.progress_percent {
            Some(cached) => (cached - new_progress).abs() > PROGRESS_EPSILON,
            None => true,
        }
    }

    /// Decide whether a book needs a remote sync pass. A NULL cached status
    /// or edition never triggers its change flag on its own, and storage
    /// errors fail open toward re-checking.
    pub async fn needs_sync_check(
        &self,
        user_id: &str,
        identifier: &str,
        title: &str,
        new_progress: f64,
        kind: IdentifierType,
        new_edition_id: Option<&str>,
        new_status_id: Option<i32>,
    ) -> SyncCheck {
        let model = match self.lookup(user_id, identifier, title, kind).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, identifier, "cache check failed, forcing sync");
                return SyncCheck {
                    needs_sync: true,
                    reason: "cache lookup failed, re-checking".into(),
                    changes: SyncChanges {
                        progress_changed: true,
                        ..Default::default()
                    },
                };
            }
        };

        let Some(model) = model else {
            return SyncCheck {
                needs_sync: true,
                reason: "not cached yet".into(),
                changes: SyncChanges {
                    progress_changed: true,
                    ..Default::default()
                },
            };
        };

        let progress_changed = match model.progress_percent {
            Some(cached) => (cached - new_progress).abs() > PROGRESS_EPSILON,
            None => true,
        };
        let status_changed = match (model.status_id, new_status_id) {
            (Some(cached), Some(new)) => cached != new,
            _ => false,
        };
        let edition_changed = match (model.edition_id.as_deref(), new_edition_id) {
            (Some(cached), Some(new)) => cached != new,
            _ => false,
        };

        let needs_sync = progress_changed || status_changed || edition_changed;
        let reason = if progress_changed {
            format!(
                "progress changed {} -> {:.2}",
                model
                    .progress_percent
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "none".into()),
                new_progress
            )
        } else if status_changed {
            "status changed".into()
        } else if edition_changed {
            "edition changed".into()
        } else {
            "no observable change".into()
        };

        SyncCheck {
            needs_sync,
            reason,
            changes: SyncChanges {
                progress_changed,
                status_changed,
                edition_changed,
            },
        }
    }

    pub async fn clear(&self) -> anyhow::Result<u64> {
        let result = Books::delete_many().exec(&self.db).await?;
        tracing::info!(rows = result.rows_affected, "cleared progress cache");
        Ok(result.rows_affected)
    }

    pub async fn stats(&self) -> anyhow::Result<CacheStats> {
        let total = Books::find().count(&self.db).await?;
        let recent = Books::find()
            .filter(books::Column::UpdatedAt.gt(Utc::now() - chrono::Duration::days(7)))
            .count(&self.db)
            .await?;
        let size_on_disk_bytes = self.size_on_disk().await.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "could not read cache size");
            0
        });
        Ok(CacheStats {
            total,
            recent,
            size_on_disk_bytes,
        })
    }

    async fn size_on_disk(&self) -> anyhow::Result<i64> {
        let stmt = Statement::from_string(
            DatabaseBackend::Sqlite,
            "SELECT page_count * page_size AS size FROM pragma_page_count(), pragma_page_size()",
        );
        let row = self.db.query_one(stmt).await?;
        Ok(row.map(|r| r.try_get::<i64>("", "size").unwrap_or(0)).unwrap_or(0))
    }
}
