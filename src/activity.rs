//! Activity monitor: idle-timeout detection for auto-logout.
//!
//! Interaction listeners call [`ActivityMonitor::record`]; a fixed-interval
//! task compares the elapsed idle span against the inactivity threshold and
//! fires the logout callback at most once per idle episode. The cadence is
//! independent of event volume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

/// The fixed set of interaction signals that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    PointerDown,
    PointerMove,
    KeyDown,
    Scroll,
    TouchStart,
    Click,
}

struct Inner {
    last_activity: Mutex<Instant>,
    threshold: Duration,
    /// Set when the logout callback has fired for the current idle episode;
    /// re-armed by [`ActivityMonitor::record`], never by the poll loop.
    fired: AtomicBool,
}

impl Inner {
    fn idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }
}

pub struct ActivityMonitor {
    inner: Arc<Inner>,
    check_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityMonitor {
    /// Monitor using the configured inactivity threshold and check cadence.
    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self::new(config.inactivity_timeout, config.activity_check_interval)
    }

    pub fn new(threshold: Duration, check_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                last_activity: Mutex::new(Instant::now()),
                threshold,
                fired: AtomicBool::new(false),
            }),
            check_interval,
            task: Mutex::new(None),
        }
    }

    /// Non-blocking listener entry point. Also re-arms the logout callback,
    /// so a new idle episode can fire even if no poll tick ever observed the
    /// gap between episodes.
    pub fn record(&self, kind: ActivityKind) {
        debug!(?kind, "activity");
        *self.inner.last_activity.lock().expect("activity lock poisoned") = Instant::now();
        self.inner.fired.store(false, Ordering::SeqCst);
    }

    pub fn idle_time(&self) -> Duration {
        self.inner.idle_time()
    }

    /// Time remaining before the idle threshold elapses; zero once it has.
    pub fn time_until_logout(&self) -> Duration {
        self.inner.threshold.saturating_sub(self.inner.idle_time())
    }

    /// Spawn the periodic idle check. The callback fires at most once per
    /// idle episode; it re-arms only after activity resumes. Calling `start`
    /// again replaces any previous check task.
    pub fn start<F>(&self, on_logout: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let period = self.check_interval;
        let handle = tokio::spawn(async move {
            // First tick one full period out, not immediately.
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let idle = inner.idle_time();
                if idle >= inner.threshold && !inner.fired.swap(true, Ordering::SeqCst) {
                    info!(idle_secs = idle.as_secs(), "idle threshold exceeded; forcing logout");
                    on_logout();
                }
            }
        });
        if let Some(old) = self.task.lock().expect("task lock poisoned").replace(handle) {
            old.abort();
        }
    }

    /// Tear down the check task synchronously. Listeners hold no resources of
    /// their own, so this is the whole cleanup.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
