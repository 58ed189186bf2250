//! Decides whether a progress update mutates the latest reading session or
//! starts a new one, then performs the write. Re-reads are detected two
//! ways: the previous session carries a finish date, or progress dropped
//! from near-complete back to an early position.

use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};

use crate::hardcover_client::{CatalogService, SessionRecord};

/// Configuration-supplied decision thresholds, in percentage points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionThresholds {
    pub high_progress: f64,
    pub reread: f64,
    pub regression_warning: f64,
}

impl Default for SessionThresholds {
    fn default() -> Self {
        SessionThresholds {
            high_progress: 85.0,
            reread: 30.0,
            regression_warning: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionDecision {
    CreateNew { reason: String },
    UpdateExisting { session_id: i64, is_regression: bool },
}

/// One progress write request against the catalog.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub user_book_id: i64,
    pub new_percent: f64,
    /// Raw progress value, pages or seconds depending on format.
    pub value: i64,
    pub use_seconds: bool,
    pub edition_id: Option<i64>,
    /// Total pages or seconds for the edition, when known.
    pub edition_total: Option<i64>,
    /// Explicit start date; None keeps an existing session's start date and
    /// defaults a new session to today.
    pub started_at: Option<NaiveDate>,
}

pub struct ReadingSessionManager {
    catalog: Arc<dyn CatalogService>,
    thresholds: SessionThresholds,
}

impl ReadingSessionManager {
    pub fn new(catalog: Arc<dyn CatalogService>, thresholds: SessionThresholds) -> Self {
        ReadingSessionManager {
            catalog,
            thresholds,
        }
    }

    /// Evaluated in order; first match wins.
    pub fn decide(
        &self,
        latest: Option<&SessionRecord>,
        update: &ProgressUpdate,
    ) -> SessionDecision {
        let Some(latest) = latest else {
            return SessionDecision::CreateNew {
                reason: "no existing session".into(),
            };
        };

        if latest.is_finished() {
            return SessionDecision::CreateNew {
                reason: "previous session finished, starting re-read".into(),
            };
        }

        let previous_percent =
            estimate_previous_percent(latest.progress_value(), update.edition_total, update.value);

        if let Some(prev) = previous_percent {
            if prev >= self.thresholds.high_progress && update.new_percent <= self.thresholds.reread
            {
                return SessionDecision::CreateNew {
                    reason: format!(
                        "re-read detected (previous {:.0}%, new {:.0}%)",
                        prev, update.new_percent
                    ),
                };
            }
            if prev >= self.thresholds.high_progress
                && prev - update.new_percent > self.thresholds.regression_warning
            {
                return SessionDecision::UpdateExisting {
                    session_id: latest.id,
                    is_regression: true,
                };
            }
        }

        SessionDecision::UpdateExisting {
            session_id: latest.id,
            is_regression: false,
        }
    }

    /// Perform the write the decision calls for.
    #[tracing::instrument(level = "debug", skip(self, update), fields(user_book_id = update.user_book_id))]
    pub async fn apply(
        &self,
        decision: SessionDecision,
        update: &ProgressUpdate,
    ) -> anyhow::Result<SessionRecord> {
        match decision {
            SessionDecision::CreateNew { reason } => {
                tracing::info!(%reason, "creating new reading session");
                let started = update
                    .started_at
                    .unwrap_or_else(|| Utc::now().date_naive());
                self.catalog
                    .insert_reading_session(
                        update.user_book_id,
                        update.value,
                        update.edition_id,
                        Some(started),
                        None,
                        update.use_seconds,
                    )
                    .await?
                    .context("catalog returned no session record on insert")
            }
            SessionDecision::UpdateExisting {
                session_id,
                is_regression,
            } => {
                if is_regression {
                    tracing::warn!(
                        session_id,
                        new_percent = update.new_percent,
                        "large progress drop on a nearly-finished book, updating anyway"
                    );
                }
                self.catalog
                    .update_reading_session(
                        session_id,
                        update.value,
                        update.edition_id,
                        update.started_at,
                        None,
                        update.use_seconds,
                    )
                    .await?
                    .context("catalog returned no session record on update")
            }
        }
    }
}

/// Previous progress as a percent. Exact when the edition total is known;
/// otherwise a best-effort guess from the ratio of previous to new raw
/// value, usable only when the previous value dwarfs the new one.
fn estimate_previous_percent(
    previous_value: Option<i64>,
    edition_total: Option<i64>,
    new_value: i64,
) -> Option<f64> {
    let previous = previous_value? as f64;
    if let Some(total) = edition_total.filter(|t| *t > 0) {
        return Some((previous / total as f64 * 100.0).clamp(0.0, 100.0));
    }
    if new_value > 0 {
        let ratio = previous / new_value as f64;
        if ratio > 3.0 {
            return Some((ratio * 25.0).min(95.0));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardcover_client::{CurrentProgress, Edition, UserBook};
    use std::sync::Mutex;

    fn session(id: i64, pages: Option<i64>, finished: bool) -> SessionRecord {
        SessionRecord {
            id,
            user_book_id: Some(88),
            progress_pages: pages,
            progress_seconds: None,
            edition_id: Some(4455),
            started_at: NaiveDate::from_ymd_opt(2025, 7, 1),
            finished_at: finished.then(|| NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()),
        }
    }

    fn update(percent: f64, value: i64, total: Option<i64>) -> ProgressUpdate {
        ProgressUpdate {
            user_book_id: 88,
            new_percent: percent,
            value,
            use_seconds: false,
            edition_id: Some(4455),
            edition_total: total,
            started_at: None,
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Insert {
            started_at: Option<NaiveDate>,
        },
        Update {
            session_id: i64,
            started_at: Option<NaiveDate>,
        },
    }

    #[derive(Default)]
    struct RecordingCatalog {
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait::async_trait]
    impl CatalogService for RecordingCatalog {
        async fn get_user_books(&self) -> anyhow::Result<Vec<UserBook>> {
            Ok(Vec::new())
        }
        async fn get_book_current_progress(&self, _: i64) -> anyhow::Result<CurrentProgress> {
            Ok(CurrentProgress::default())
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
            self.calls.lock().unwrap().push(Call::Insert { started_at });
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
            self.calls
                .lock()
                .unwrap()
                .push(Call::Update {
                    session_id,
                    started_at,
                });
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
            Ok(true)
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

    fn manager() -> (Arc<RecordingCatalog>, ReadingSessionManager) {
        let catalog = Arc::new(RecordingCatalog::default());
        let mgr = ReadingSessionManager::new(catalog.clone(), SessionThresholds::default());
        (catalog, mgr)
    }

    #[test]
    fn no_session_creates_new() {
        let (_, mgr) = manager();
        let d = mgr.decide(None, &update(10.0, 40, Some(400)));
        assert!(matches!(d, SessionDecision::CreateNew { .. }));
    }

    #[test]
    fn finished_session_always_creates_new() {
        let (_, mgr) = manager();
        // Previously completed at 90%; even a high new progress starts fresh.
        let latest = session(51, Some(360), true);
        let d = mgr.decide(Some(&latest), &update(92.0, 368, Some(400)));
        assert!(matches!(d, SessionDecision::CreateNew { .. }));
    }

    #[test]
    fn high_previous_and_low_new_is_a_reread() {
        let (_, mgr) = manager();
        let latest = session(51, Some(360), false); // 90% of 400
        let d = mgr.decide(Some(&latest), &update(25.0, 100, Some(400)));
        match d {
            SessionDecision::CreateNew { reason } => assert!(reason.contains("re-read")),
            other => panic!("expected CreateNew, got {:?}", other),
        }
    }

    #[test]
    fn large_drop_above_reread_threshold_is_a_regression_warning() {
        let (_, mgr) = manager();
        let latest = session(51, Some(360), false); // 90%
        // Drop of 20 points, but new progress is above the re-read cutoff.
        let d = mgr.decide(Some(&latest), &update(70.0, 280, Some(400)));
        assert_eq!(
            d,
            SessionDecision::UpdateExisting {
                session_id: 51,
                is_regression: true
            }
        );
    }

    #[test]
    fn forward_progress_updates_existing() {
        let (_, mgr) = manager();
        let latest = session(51, Some(200), false); // 50%
        let d = mgr.decide(Some(&latest), &update(60.0, 240, Some(400)));
        assert_eq!(
            d,
            SessionDecision::UpdateExisting {
                session_id: 51,
                is_regression: false
            }
        );
    }

    #[test]
    fn small_drop_from_high_progress_is_not_flagged() {
        let (_, mgr) = manager();
        let latest = session(51, Some(360), false); // 90%
        let d = mgr.decide(Some(&latest), &update(82.0, 328, Some(400)));
        assert_eq!(
            d,
            SessionDecision::UpdateExisting {
                session_id: 51,
                is_regression: false
            }
        );
    }

    #[test]
    fn ratio_heuristic_detects_reread_without_totals() {
        let (_, mgr) = manager();
        // No edition total: previous raw value 400 vs new 100 gives ratio 4,
        // estimated previous min(95, 100) = 95.
        let latest = session(51, Some(400), false);
        let d = mgr.decide(Some(&latest), &update(20.0, 100, None));
        assert!(matches!(d, SessionDecision::CreateNew { .. }));
    }

    #[test]
    fn ratio_heuristic_stays_quiet_below_threshold() {
        let (_, mgr) = manager();
        let latest = session(51, Some(250), false);
        // Ratio 2.5: no estimate, so no re-read call.
        let d = mgr.decide(Some(&latest), &update(20.0, 100, None));
        assert_eq!(
            d,
            SessionDecision::UpdateExisting {
                session_id: 51,
                is_regression: false
            }
        );
    }

    #[test]
    fn estimate_is_exact_with_totals() {
        assert_eq!(
            estimate_previous_percent(Some(360), Some(400), 100),
            Some(90.0)
        );
        assert_eq!(estimate_previous_percent(None, Some(400), 100), None);
    }

    #[test]
    fn estimate_caps_heuristic_at_95() {
        let est = estimate_previous_percent(Some(1000), None, 100).unwrap();
        assert_eq!(est, 95.0);
    }

    #[tokio::test]
    async fn create_new_defaults_start_date_to_today() {
        let (catalog, mgr) = manager();
        let u = update(10.0, 40, Some(400));
        let record = mgr
            .apply(
                SessionDecision::CreateNew {
                    reason: "no existing session".into(),
                },
                &u,
            )
            .await
            .unwrap();
        assert_eq!(record.started_at, Some(Utc::now().date_naive()));
        let calls = catalog.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Insert { started_at: Some(_) }));
    }

    #[tokio::test]
    async fn update_existing_preserves_start_date() {
        let (catalog, mgr) = manager();
        let u = update(60.0, 240, Some(400));
        mgr.apply(
            SessionDecision::UpdateExisting {
                session_id: 51,
                is_regression: false,
            },
            &u,
        )
        .await
        .unwrap();
        let calls = catalog.calls.lock().unwrap();
        // started_at stays unset so the catalog keeps the original date.
        assert_eq!(
            calls[0],
            Call::Update {
                session_id: 51,
                started_at: None
            }
        );
    }

    #[tokio::test]
    async fn explicit_start_date_is_passed_through() {
        let (catalog, mgr) = manager();
        let mut u = update(60.0, 240, Some(400));
        let explicit = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        u.started_at = Some(explicit);
        mgr.apply(
            SessionDecision::UpdateExisting {
                session_id: 51,
                is_regression: false,
            },
            &u,
        )
        .await
        .unwrap();
        let calls = catalog.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            Call::Update {
                session_id: 51,
                started_at: Some(explicit)
            }
        );
    }
}
