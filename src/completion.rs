//! The two-step "mark finished" operation: write 100%-equivalent progress
//! with a finish date, then set the book's status to Read. Both steps must
//! succeed or the whole call reports failure; the status write is never
//! attempted when the progress write fails.

use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{NaiveDate, Utc};

use crate::hardcover_client::{CatalogService, STATUS_READ, SessionRecord};

pub struct CompletionCoordinator {
    catalog: Arc<dyn CatalogService>,
}

impl CompletionCoordinator {
    pub fn new(catalog: Arc<dyn CatalogService>) -> Self {
        CompletionCoordinator { catalog }
    }

    /// Returns the finished session only when both remote writes succeeded.
    /// A failure after the progress write leaves remote state inconsistent
    /// (progress at 100%, status stale); that possibility is logged loudly
    /// and the call still reports failure so nothing caches a completion
    /// that did not fully happen.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn mark_completed(
        &self,
        user_book_id: i64,
        edition_id: Option<i64>,
        total_value: i64,
        use_seconds: bool,
        finished_at: Option<NaiveDate>,
        started_at: Option<NaiveDate>,
    ) -> anyhow::Result<SessionRecord> {
        let current = self
            .catalog
            .get_book_current_progress(user_book_id)
            .await
            .context("could not read current progress before completion")?;

        let finished = finished_at.unwrap_or_else(|| Utc::now().date_naive());

        let session = match current.latest_read {
            Some(latest) if !latest.is_finished() => self
                .catalog
                .update_reading_session(
                    latest.id,
                    total_value,
                    edition_id,
                    started_at,
                    Some(finished),
                    use_seconds,
                )
                .await
                .context("completion progress write failed")?,
            _ => self
                .catalog
                .insert_reading_session(
                    user_book_id,
                    total_value,
                    edition_id,
                    Some(started_at.unwrap_or(finished)),
                    Some(finished),
                    use_seconds,
                )
                .await
                .context("completion progress write failed")?,
        };

        let Some(session) = session else {
            bail!("completion progress write returned no session record");
        };

        let status_confirmed = match self.catalog.update_book_status(user_book_id, STATUS_READ).await
        {
            Ok(confirmed) => confirmed,
            Err(e) => {
                tracing::error!(
                    user_book_id,
                    error = %e,
                    "progress written but status update errored; remote state may be inconsistent"
                );
                return Err(e.context(
                    "progress written but status update failed; remote state may be inconsistent",
                ));
            }
        };
        if !status_confirmed {
            tracing::error!(
                user_book_id,
                "progress written but status update was not confirmed; remote state may be inconsistent"
            );
            bail!("progress written but status update failed; remote state may be inconsistent");
        }

        tracing::info!(user_book_id, session_id = session.id, "book marked completed");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardcover_client::{CurrentProgress, Edition, UserBook};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubCatalog {
        latest_read: Mutex<Option<SessionRecord>>,
        progress_write_succeeds: bool,
        status_result: anyhow::Result<bool>,
        inserts: AtomicUsize,
        updates: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl StubCatalog {
        fn new(
            latest_read: Option<SessionRecord>,
            progress_write_succeeds: bool,
            status_result: anyhow::Result<bool>,
        ) -> Self {
            StubCatalog {
                latest_read: Mutex::new(latest_read),
                progress_write_succeeds,
                status_result,
                inserts: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                status_calls: AtomicUsize::new(0),
            }
        }

        fn progress_writes(&self) -> usize {
            self.inserts.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
        }
    }

    fn record(id: i64, finished: bool) -> SessionRecord {
        SessionRecord {
            id,
            user_book_id: Some(88),
            progress_pages: Some(360),
            progress_seconds: None,
            edition_id: Some(4455),
            started_at: NaiveDate::from_ymd_opt(2025, 7, 1),
            finished_at: finished.then(|| NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()),
        }
    }

    #[async_trait::async_trait]
    impl CatalogService for StubCatalog {
        async fn get_user_books(&self) -> anyhow::Result<Vec<UserBook>> {
            Ok(Vec::new())
        }
        async fn get_book_current_progress(&self, _: i64) -> anyhow::Result<CurrentProgress> {
            let latest = self.latest_read.lock().unwrap().clone();
            Ok(CurrentProgress {
                has_progress: latest.is_some(),
                latest_read: latest,
                user_book: None,
            })
        }
        async fn insert_reading_session(
            &self,
            user_book_id: i64,
            value: i64,
            edition_id: Option<i64>,
            started_at: Option<NaiveDate>,
            finished_at: Option<NaiveDate>,
            _use_seconds: bool,
        ) -> anyhow::Result<Option<SessionRecord>> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            if !self.progress_write_succeeds {
                return Ok(None);
            }
            Ok(Some(SessionRecord {
                id: 9000,
                user_book_id: Some(user_book_id),
                progress_pages: Some(value),
                progress_seconds: None,
                edition_id,
                started_at,
                finished_at,
            }))
        }
        async fn update_reading_session(
            &self,
            session_id: i64,
            value: i64,
            edition_id: Option<i64>,
            started_at: Option<NaiveDate>,
            finished_at: Option<NaiveDate>,
            _use_seconds: bool,
        ) -> anyhow::Result<Option<SessionRecord>> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if !self.progress_write_succeeds {
                return Ok(None);
            }
            Ok(Some(SessionRecord {
                id: session_id,
                user_book_id: Some(88),
                progress_pages: Some(value),
                progress_seconds: None,
                edition_id,
                started_at,
                finished_at,
            }))
        }
        async fn update_book_status(&self, _: i64, _: i32) -> anyhow::Result<bool> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            match &self.status_result {
                Ok(v) => Ok(*v),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
        async fn search_by_isbn(&self, _: &str) -> anyhow::Result<Vec<Edition>> {
            Ok(Vec::new())
        }
        async fn search_by_asin(&self, _: &str) -> anyhow::Result<Vec<Edition>> {
            Ok(Vec::new())
        }
        async fn add_book_to_library(
            &self,
            _: i64,
            _: i32,
            _: Option<i64>,
        ) -> anyhow::Result<Option<i64>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn both_steps_succeed() {
        let catalog = Arc::new(StubCatalog::new(None, true, Ok(true)));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let session = coordinator
            .mark_completed(88, Some(4455), 412, false, None, None)
            .await
            .unwrap();
        assert!(session.finished_at.is_some());
        assert_eq!(catalog.progress_writes(), 1);
        assert_eq!(catalog.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_failure_fails_the_whole_operation() {
        let catalog = Arc::new(StubCatalog::new(None, true, Ok(false)));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let err = coordinator
            .mark_completed(88, Some(4455), 412, false, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inconsistent"));
        // Both remote writes were attempted exactly once.
        assert_eq!(catalog.progress_writes(), 1);
        assert_eq!(catalog.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_error_fails_the_whole_operation() {
        let catalog = Arc::new(StubCatalog::new(
            None,
            true,
            Err(anyhow::anyhow!("network down")),
        ));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let err = coordinator
            .mark_completed(88, Some(4455), 412, false, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inconsistent"));
        assert_eq!(catalog.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_failure_never_reaches_the_status_write() {
        let catalog = Arc::new(StubCatalog::new(None, false, Ok(true)));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let err = coordinator
            .mark_completed(88, Some(4455), 412, false, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no session record"));
        assert_eq!(catalog.progress_writes(), 1);
        assert_eq!(catalog.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_session_is_closed_in_place() {
        let catalog = Arc::new(StubCatalog::new(Some(record(51, false)), true, Ok(true)));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let session = coordinator
            .mark_completed(88, Some(4455), 412, false, None, None)
            .await
            .unwrap();
        assert_eq!(session.id, 51);
        assert_eq!(catalog.updates.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn already_finished_session_gets_a_fresh_record() {
        let catalog = Arc::new(StubCatalog::new(Some(record(51, true)), true, Ok(true)));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let session = coordinator
            .mark_completed(88, Some(4455), 412, false, None, None)
            .await
            .unwrap();
        assert_eq!(session.id, 9000);
        assert_eq!(catalog.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_finish_date_is_used() {
        let catalog = Arc::new(StubCatalog::new(None, true, Ok(true)));
        let coordinator = CompletionCoordinator::new(catalog.clone());
        let finished = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let session = coordinator
            .mark_completed(88, Some(4455), 412, false, Some(finished), None)
            .await
            .unwrap();
        assert_eq!(session.finished_at, Some(finished));
    }
}
