//! Top-level sync run: pull the user's in-progress library items, skip the
//! ones the cache says are unchanged, resolve the rest against the catalog
//! and write progress or completion. Failures are isolated per book; only
//! the initial item-list fetches are run-fatal.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::abs_client::{LibraryItem, LibraryService, MediaProgress};
use crate::cache::{CacheKey, ProgressCache, StoreSyncData};
use crate::completion::CompletionCoordinator;
use crate::config::Config;
use crate::hardcover_client::{CatalogService, STATUS_READ, STATUS_READING};
use crate::matcher::{BookMatcher, CatalogMatch, Identity, UserBookIndex, extract_identity};
use crate::session::{ProgressUpdate, ReadingSessionManager, SessionDecision, SessionThresholds};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub user_id: String,
    pub workers: usize,
    pub force_sync: bool,
    pub dry_run: bool,
    pub auto_add_books: bool,
    /// Percent at or above which a book counts as finished.
    pub completion_threshold: f64,
    pub thresholds: SessionThresholds,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            user_id: "default".into(),
            workers: 3,
            force_sync: false,
            dry_run: false,
            auto_add_books: false,
            completion_threshold: 100.0,
            thresholds: SessionThresholds::default(),
        }
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        SyncOptions {
            user_id: config.user_id.clone(),
            workers: config.workers,
            force_sync: config.force_sync,
            dry_run: config.dry_run,
            auto_add_books: config.auto_add_books,
            completion_threshold: config.completion_threshold,
            thresholds: config.session_thresholds(),
        }
    }
}

/// Typed in-flight key; two books must never collide because their parts
/// happen to stringify alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub user_id: String,
    pub item_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSyncStatus {
    Synced,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for BookSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookSyncStatus::Synced => "synced",
            BookSyncStatus::Completed => "completed",
            BookSyncStatus::Skipped => "skipped",
            BookSyncStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BookDetail {
    pub title: String,
    pub status: BookSyncStatus,
    pub isbn: Option<String>,
    pub asin: Option<String>,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub timing: Duration,
    pub auto_added: bool,
}

impl BookDetail {
    fn new(title: String) -> Self {
        BookDetail {
            title,
            status: BookSyncStatus::Skipped,
            isbn: None,
            asin: None,
            actions: Vec::new(),
            errors: Vec::new(),
            timing: Duration::ZERO,
            auto_added: false,
        }
    }
}

/// Aggregate of one run, immutable once returned.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub books_processed: usize,
    pub books_synced: usize,
    pub books_completed: usize,
    pub books_auto_added: usize,
    pub books_skipped: usize,
    pub duplicates_removed: usize,
    pub errors: Vec<String>,
    pub book_details: Vec<BookDetail>,
}

impl SyncResult {
    fn record(&mut self, detail: BookDetail) {
        self.books_processed += 1;
        match detail.status {
            BookSyncStatus::Synced => self.books_synced += 1,
            BookSyncStatus::Completed => self.books_completed += 1,
            BookSyncStatus::Skipped => self.books_skipped += 1,
            BookSyncStatus::Failed => {
                for e in &detail.errors {
                    self.errors.push(format!("{}: {}", detail.title, e));
                }
            }
        }
        if detail.auto_added {
            self.books_auto_added += 1;
        }
        self.book_details.push(detail);
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    library: Arc<dyn LibraryService>,
    catalog: Arc<dyn CatalogService>,
    cache: Arc<ProgressCache>,
    matcher: Arc<BookMatcher>,
    sessions: Arc<ReadingSessionManager>,
    completion: Arc<CompletionCoordinator>,
    options: Arc<SyncOptions>,
    in_flight: Arc<Mutex<HashSet<BookKey>>>,
}

impl SyncOrchestrator {
    pub fn new(
        library: Arc<dyn LibraryService>,
        catalog: Arc<dyn CatalogService>,
        cache: Arc<ProgressCache>,
        options: SyncOptions,
    ) -> Self {
        let matcher = Arc::new(BookMatcher::new(
            catalog.clone(),
            cache.clone(),
            options.user_id.clone(),
            options.auto_add_books,
        ));
        let sessions = Arc::new(ReadingSessionManager::new(
            catalog.clone(),
            options.thresholds,
        ));
        let completion = Arc::new(CompletionCoordinator::new(catalog.clone()));
        SyncOrchestrator {
            library,
            catalog,
            cache,
            matcher,
            sessions,
            completion,
            options: Arc::new(options),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn run(&self) -> anyhow::Result<SyncResult> {
        let run_started = Instant::now();

        let items = self
            .library
            .get_items_in_progress()
            .await
            .context("could not fetch in-progress items from library service")?;
        let user_books = self
            .catalog
            .get_user_books()
            .await
            .context("could not fetch user books from catalog service")?;
        let index = Arc::new(UserBookIndex::build(user_books));

        let (unique, duplicates_removed) = dedup_items(items);
        if duplicates_removed > 0 {
            tracing::info!(duplicates_removed, "removed duplicate library items");
        }
        tracing::info!(
            items = unique.len(),
            catalog_books = index.len(),
            workers = self.options.workers,
            dry_run = self.options.dry_run,
            "starting sync run"
        );

        let mut result = SyncResult {
            duplicates_removed,
            ..Default::default()
        };

        if self.options.workers <= 1 {
            for item in unique {
                let detail = self.process_item(item, &index).await;
                result.record(detail);
            }
        } else {
            let pool = Arc::new(Semaphore::new(self.options.workers));
            let mut tasks = JoinSet::new();
            for item in unique {
                let permit = pool
                    .clone()
                    .acquire_owned()
                    .await
                    .context("worker pool closed")?;
                let this = self.clone();
                let index = index.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    this.process_item(item, index.as_ref()).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(detail) => result.record(detail),
                    Err(e) => result.errors.push(format!("worker task failed: {}", e)),
                }
            }
        }

        tracing::info!(
            processed = result.books_processed,
            synced = result.books_synced,
            completed = result.books_completed,
            skipped = result.books_skipped,
            auto_added = result.books_auto_added,
            errors = result.errors.len(),
            elapsed_ms = run_started.elapsed().as_millis() as u64,
            "sync run finished"
        );
        Ok(result)
    }

    /// Process one item, trapping every failure into the detail so one bad
    /// book never aborts the run.
    async fn process_item(&self, item: LibraryItem, index: &UserBookIndex) -> BookDetail {
        let started = Instant::now();
        let mut detail = BookDetail::new(item.title().to_string());
        let key = BookKey {
            user_id: self.options.user_id.clone(),
            item_id: item.id,
        };

        if !self.claim(&key) {
            detail.actions.push("already being processed".into());
            detail.timing = started.elapsed();
            return detail;
        }

        match self.sync_one(&item, index, &mut detail).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!(title = %detail.title, error = %format!("{:#}", e), "book sync failed");
                detail.status = BookSyncStatus::Failed;
                detail.errors.push(format!("{:#}", e));
            }
        }

        self.release(&key);
        detail.timing = started.elapsed();
        detail
    }

    async fn sync_one(
        &self,
        item: &LibraryItem,
        index: &UserBookIndex,
        detail: &mut BookDetail,
    ) -> anyhow::Result<()> {
        let Some(progress) = self.library.get_user_progress(&item.id).await? else {
            detail.actions.push("no progress signal".into());
            return Ok(());
        };
        let percent = progress.progress_percent();
        let finished = progress.is_finished || percent >= self.options.completion_threshold;
        let target_status = if finished { STATUS_READ } else { STATUS_READING };

        let identity = extract_identity(item);
        detail.isbn = identity.isbn.clone();
        detail.asin = identity.asin.clone();

        // The cache may hold this book under an older key type; check them
        // all and keep using whichever key the book lives under.
        let keys = identity.cache_keys();
        let cached_key = self
            .cache
            .find_any(&self.options.user_id, &identity.title, &keys)
            .await
            .map(|(key, _)| key);
        let check_key = cached_key.unwrap_or_else(|| identity.preferred());

        if !self.options.force_sync {
            let check = self
                .cache
                .needs_sync_check(
                    &self.options.user_id,
                    &check_key.identifier,
                    &identity.title,
                    percent,
                    check_key.kind,
                    None,
                    Some(target_status),
                )
                .await;
            if !check.needs_sync {
                detail.actions.push(format!("skipped: {}", check.reason));
                return Ok(());
            }
            detail.actions.push(check.reason);
        } else {
            detail.actions.push("forced".into());
        }

        let resolution = self.matcher.resolve(item, index).await?;
        let Some(matched) = resolution.matched else {
            detail.actions.push("no catalog match".into());
            return Ok(());
        };
        // From here on, use the resolver's view of the identity.
        let identity = resolution.identity;
        tracing::debug!(
            book_id = ?matched.book_id,
            edition_id = ?matched.edition_id,
            source = %matched.source,
            "resolved catalog match"
        );
        detail.actions.push(format!("matched via {}", matched.source));
        if matched.auto_added {
            detail.auto_added = true;
            detail.actions.push("auto-added to catalog".into());
        }
        let Some(user_book_id) = matched.user_book_id else {
            detail
                .actions
                .push("not in catalog library (auto-add disabled)".into());
            return Ok(());
        };

        let use_seconds = item.is_audio();
        let value = progress_value(&progress, percent, use_seconds, &matched);

        if self.options.dry_run {
            let action = if finished {
                "dry-run: would mark completed"
            } else {
                "dry-run: would sync progress"
            };
            detail.actions.push(action.into());
            return Ok(());
        }

        if finished {
            let total_value = completion_total(&progress, use_seconds, value, &matched);
            self.completion
                .mark_completed(
                    user_book_id,
                    matched.edition_id,
                    total_value,
                    use_seconds,
                    progress.finished_date(),
                    progress.started_date(),
                )
                .await?;
            detail.status = BookSyncStatus::Completed;
            detail.actions.push("marked completed".into());
            self.store_cache(&check_key, &identity, &matched, 100.0, STATUS_READ, &progress)
                .await;
            return Ok(());
        }

        let current = self.catalog.get_book_current_progress(user_book_id).await?;
        let edition_total = if use_seconds {
            matched
                .edition_seconds
                .or((progress.duration > 0.0).then(|| progress.duration.round() as i64))
        } else {
            matched.edition_pages
        };
        let mut update = ProgressUpdate {
            user_book_id,
            new_percent: percent,
            value,
            use_seconds,
            edition_id: matched.edition_id,
            edition_total,
            started_at: progress.started_date(),
        };
        let decision = self
            .sessions
            .decide(current.latest_read.as_ref(), &update);
        match &decision {
            SessionDecision::CreateNew { reason } => {
                detail.actions.push(format!("new session: {}", reason));
            }
            SessionDecision::UpdateExisting { is_regression, .. } => {
                // Keep the session's original start date.
                update.started_at = None;
                if *is_regression {
                    detail.actions.push("regression warning".into());
                }
                detail.actions.push("updated session".into());
            }
        }
        self.sessions.apply(decision, &update).await?;
        detail.status = BookSyncStatus::Synced;
        self.store_cache(
            &check_key,
            &identity,
            &matched,
            percent,
            STATUS_READING,
            &progress,
        )
        .await;
        Ok(())
    }

    /// Cache write failures degrade to a warning; the remote sync already
    /// happened and must still be reported as a success.
    async fn store_cache(
        &self,
        key: &CacheKey,
        identity: &Identity,
        matched: &CatalogMatch,
        percent: f64,
        status_id: i32,
        progress: &MediaProgress,
    ) {
        let data = StoreSyncData {
            user_id: self.options.user_id.clone(),
            identifier: key.identifier.clone(),
            kind: Some(key.kind),
            title: identity.title.clone(),
            author: (!identity.author.is_empty()).then(|| identity.author.clone()),
            edition_id: matched.edition_id.map(|e| e.to_string()),
            progress_percent: Some(percent),
            status_id: Some(status_id),
            started_at: progress.started_date().map(|d| d.to_string()),
            finished_at: progress.finished_date().map(|d| d.to_string()),
        };
        if let Err(e) = self.cache.store_sync_data(data).await {
            tracing::warn!(identifier = %key.identifier, error = %e, "could not update progress cache");
        }
    }

    fn claim(&self, key: &BookKey) -> bool {
        let mut guard = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(key.clone())
    }

    fn release(&self, key: &BookKey) {
        let mut guard = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(key);
    }
}

fn dedup_items(items: Vec<LibraryItem>) -> (Vec<LibraryItem>, usize) {
    let before = items.len();
    let mut seen = HashSet::new();
    let unique: Vec<LibraryItem> = items.into_iter().filter(|i| seen.insert(i.id)).collect();
    let removed = before - unique.len();
    (unique, removed)
}

/// Raw progress value for the write: seconds for audio, otherwise pages
/// derived from the edition total, falling back to the bare percent when no
/// total is known.
fn progress_value(
    progress: &MediaProgress,
    percent: f64,
    use_seconds: bool,
    matched: &CatalogMatch,
) -> i64 {
    if use_seconds {
        progress.current_time.round() as i64
    } else if let Some(pages) = matched.edition_pages {
        ((percent / 100.0) * pages as f64).round() as i64
    } else {
        percent.round() as i64
    }
}

/// The 100%-equivalent value for a completion write.
fn completion_total(
    progress: &MediaProgress,
    use_seconds: bool,
    value: i64,
    matched: &CatalogMatch,
) -> i64 {
    if use_seconds {
        matched
            .edition_seconds
            .or((progress.duration > 0.0).then(|| progress.duration.round() as i64))
            .unwrap_or(value)
            .max(value)
    } else {
        matched.edition_pages.unwrap_or(value).max(value)
    }
}
