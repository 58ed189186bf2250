//! Outbound call admission control, one gate per remote collaborator.
//!
//! Two composed limits: a bounded number of in-flight calls (FIFO queue via
//! the semaphore) and a sliding one-minute request window. Both are checked
//! on `acquire`; the concurrency slot is released when the returned permit
//! drops, so release happens on every exit path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep};

const WINDOW: Duration = Duration::from_secs(60);
/// Slack added to a computed window wait so the retry lands after the
/// oldest entry has actually expired.
const WAIT_SLACK: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct RateGate {
    name: String,
    semaphore: Arc<Semaphore>,
    max_per_minute: u32,
    window: Mutex<VecDeque<Instant>>,
}

/// Held for the duration of one remote call. Dropping it frees the
/// concurrency slot.
#[derive(Debug)]
pub struct RateGatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateGate {
    pub fn new(name: impl Into<String>, max_concurrency: usize, max_per_minute: u32) -> Self {
        RateGate {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            max_per_minute: max_per_minute.max(1),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for a concurrency slot and for room in the one-minute window,
    /// then record the request. Callers queue FIFO on the slot.
    pub async fn acquire(&self) -> anyhow::Result<RateGatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .with_context(|| format!("{} rate gate closed", self.name))?;

        let mut attempt: u32 = 0;
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= WINDOW)
                {
                    window.pop_front();
                }
                if (window.len() as u32) < self.max_per_minute {
                    window.push_back(now);
                    None
                } else {
                    let oldest = window.front().copied().unwrap_or(now);
                    Some(WINDOW.saturating_sub(now.duration_since(oldest)) + WAIT_SLACK)
                }
            };
            match wait {
                None => break,
                Some(delay) => {
                    attempt += 1;
                    tracing::warn!(
                        gate = %self.name,
                        attempt,
                        wait_ms = delay.as_millis() as u64,
                        "request budget exhausted, waiting for window"
                    );
                    sleep(delay).await;
                }
            }
        }

        Ok(RateGatePermit { _permit: permit })
    }

    #[cfg(test)]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let gate = Arc::new(RateGate::new("test", 2, 1000));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.available_slots(), 2);
    }

    #[tokio::test]
    async fn slot_released_on_drop() {
        let gate = RateGate::new("test", 1, 1000);
        {
            let _permit = gate.acquire().await.unwrap();
            assert_eq!(gate.available_slots(), 0);
        }
        assert_eq!(gate.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_blocks_until_budget_frees() {
        let gate = RateGate::new("test", 4, 2);
        let start = Instant::now();

        let _a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        // Third request exceeds the per-minute budget and must wait for
        // the oldest entry to leave the window.
        let _c = gate.acquire().await.unwrap();

        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn window_admits_within_budget_without_wait() {
        let gate = RateGate::new("test", 4, 10);
        let start = Instant::now();
        for _ in 0..5 {
            let _p = gate.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
