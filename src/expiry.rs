use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::store::ContentStore;

/// Fires entry deletions when their wall-clock lifetime elapses.
///
/// One background task drives a min-heap ordered by fire time; there is
/// never a timer primitive per entry, so the scheduler scales to the whole
/// keyspace being live at once. `cancel` is an O(1) removal from the
/// pending map — superseded heap entries are skipped lazily when they
/// surface at the top.
#[derive(Clone)]
pub struct ExpiryScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    notify: Notify,
}

struct SchedulerState {
    // Reverse turns the max-heap into earliest-deadline-first
    queue: BinaryHeap<Reverse<(OffsetDateTime, u64, String)>>,
    pending: HashMap<String, u64>,
    next_token: u64,
}

enum Wakeup {
    Fire(String),
    Sleep(Duration),
    Idle,
}

impl Default for ExpiryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    queue: BinaryHeap::new(),
                    pending: HashMap::new(),
                    next_token: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Arm (or re-arm) the expiry for a code. A later `schedule` for the
    /// same code supersedes the earlier one.
    pub fn schedule(&self, code: &str, fire_at: OffsetDateTime) {
        {
            let mut state = self.inner.state.lock();
            let token = state.next_token;
            state.next_token += 1;
            state.pending.insert(code.to_string(), token);
            state.queue.push(Reverse((fire_at, token, code.to_string())));
        }
        self.inner.notify.notify_one();
    }

    /// Disarm the pending expiry for a code, if any. Returns whether one
    /// was pending.
    pub fn cancel(&self, code: &str) -> bool {
        self.inner.state.lock().pending.remove(code).is_some()
    }

    /// Number of codes with an armed expiry.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Drive expiries until the token is cancelled, then drain whatever is
    /// still armed without firing it.
    pub async fn run(self, store: Arc<ContentStore>, shutdown: CancellationToken) {
        info!(target: "expiry", "expiry scheduler started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.next_wakeup() {
                Wakeup::Fire(code) => {
                    store.expire(&code).await;
                }
                Wakeup::Sleep(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.inner.notify.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Wakeup::Idle => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        let drained = self.drain();
        info!(target: "expiry", pending = drained, "expiry scheduler stopped");
    }

    /// Decide what the loop should do next. Overdue entries fire
    /// immediately; stale heap entries (cancelled or superseded) are
    /// dropped on the way.
    fn next_wakeup(&self) -> Wakeup {
        let mut state = self.inner.state.lock();
        let now = OffsetDateTime::now_utc();

        while let Some(Reverse((fire_at, token, code))) = state.queue.peek().cloned() {
            if state.pending.get(&code) != Some(&token) {
                state.queue.pop();
                continue;
            }

            if fire_at <= now {
                state.queue.pop();
                state.pending.remove(&code);
                return Wakeup::Fire(code);
            }

            let wait = (fire_at - now)
                .try_into()
                .unwrap_or(Duration::from_millis(10));
            return Wakeup::Sleep(wait);
        }

        Wakeup::Idle
    }

    fn drain(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.queue.clear();
        let drained = state.pending.len();
        state.pending.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_disarms_a_pending_expiry() {
        let scheduler = ExpiryScheduler::new();
        let soon = OffsetDateTime::now_utc() + time::Duration::minutes(5);

        scheduler.schedule("ab", soon);
        assert_eq!(scheduler.pending_count(), 1);

        assert!(scheduler.cancel("ab"));
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.cancel("ab"));
    }

    #[test]
    fn rescheduling_supersedes_the_earlier_deadline() {
        let scheduler = ExpiryScheduler::new();
        let now = OffsetDateTime::now_utc();

        scheduler.schedule("ab", now + time::Duration::minutes(1));
        scheduler.schedule("ab", now + time::Duration::minutes(10));
        assert_eq!(scheduler.pending_count(), 1);

        // the superseded heap entry must not resurface as a firing
        match scheduler.next_wakeup() {
            Wakeup::Sleep(wait) => assert!(wait > Duration::from_secs(60)),
            Wakeup::Fire(_) | Wakeup::Idle => panic!("expected a sleep until the later deadline"),
        }
    }

    #[test]
    fn overdue_entries_fire_immediately() {
        let scheduler = ExpiryScheduler::new();
        scheduler.schedule("zz", OffsetDateTime::now_utc() - time::Duration::hours(1));

        match scheduler.next_wakeup() {
            Wakeup::Fire(code) => assert_eq!(code, "zz"),
            Wakeup::Sleep(_) | Wakeup::Idle => panic!("expected an immediate firing"),
        }
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn drain_clears_everything() {
        let scheduler = ExpiryScheduler::new();
        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        scheduler.schedule("aa", later);
        scheduler.schedule("bb", later);

        assert_eq!(scheduler.drain(), 2);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(matches!(scheduler.next_wakeup(), Wakeup::Idle));
    }
}
