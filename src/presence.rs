#![forbid(unsafe_code)]

// Grace-period controller for the reconnection state machine.
//
// A disconnect arms a timer instead of committing the departure. The timer is
// advisory: when it fires, the expiry future re-reads current state (via the
// orchestrator) before acting, so a reconnect that races the timer wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tracing::{debug, info};

struct GraceEntry {
    connection_id: String,
    timer: tokio::task::JoinHandle<()>,
}

/// Pending-disconnect map, keyed by user identity.
pub struct GraceController {
    inner: Arc<StdRwLock<HashMap<String, GraceEntry>>>,
    grace_period: Duration,
}

impl GraceController {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(StdRwLock::new(HashMap::new())),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Arms (or re-arms) the grace timer for a user. `on_expire` runs after
    /// the grace period unless the timer is cancelled first; it is expected
    /// to re-check liveness before committing anything.
    pub fn arm<F, Fut>(&self, user_id: &str, connection_id: &str, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let map = Arc::clone(&self.inner);
        let user = user_id.to_string();
        let grace = self.grace_period;

        let timer = tokio::spawn({
            let user = user.clone();
            async move {
                tokio::time::sleep(grace).await;
                {
                    let mut entries = map.write().unwrap_or_else(|e| e.into_inner());
                    entries.remove(&user);
                }
                info!("Grace period expired for user {}", user);
                on_expire().await;
            }
        });

        let mut entries = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = entries.insert(
            user,
            GraceEntry {
                connection_id: connection_id.to_string(),
                timer,
            },
        ) {
            old.timer.abort();
        }
    }

    /// Cancels the pending departure for a user. Returns `true` if a timer
    /// was armed, i.e. the user was in the grace window.
    pub fn cancel(&self, user_id: &str) -> bool {
        let mut entries = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match entries.remove(user_id) {
            Some(entry) => {
                entry.timer.abort();
                debug!(
                    "Cancelled grace timer for user {} (was connection {})",
                    user_id, entry.connection_id
                );
                true
            }
            None => false,
        }
    }

    /// Whether a user currently sits in the grace window.
    pub fn in_grace(&self, user_id: &str) -> bool {
        let entries = self.inner.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_grace_period() {
        let controller = GraceController::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        controller.arm("user", "c1", move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(controller.in_grace("user"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!controller.in_grace("user"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_expiry() {
        let controller = GraceController::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        controller.arm("user", "c1", move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(controller.cancel("user"));
        assert!(!controller.cancel("user"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let controller = GraceController::new(Duration::from_secs(5));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = Arc::clone(&first);
        controller.arm("user", "c1", move || async move {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(3)).await;

        let second_clone = Arc::clone(&second);
        controller.arm("user", "c2", move || async move {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
