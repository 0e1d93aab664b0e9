//! Lease ledger and visibility renewal for in-flight messages.
//!
//! A claimed message stays invisible to other consumers only for its
//! visibility window. Processing can run far longer than one window, so the
//! renewer keeps extending it on a timer until the worker resolves the
//! message, and evicts messages that exceed the hard processing ceiling.
//!
//! The ledger lock is never held across a queue call: a sweep snapshots the
//! handles, calls the queue, then re-locks to record the result. Extensions
//! and [`LeaseRenewer::finish`] take a separate async gate, so once `finish`
//! returns no extension for that message can still reach the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vproc_models::JobPayload;
use vproc_queue::{QueueMessage, WorkQueue};

use crate::metrics;

/// Lease renewal configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    /// Visibility window requested on registration and on each extension
    pub default_timeout: Duration,
    /// Extend once this long has passed since the last extension
    pub extension_interval: Duration,
    /// Hard ceiling on total processing time per message
    pub max_processing_time: Duration,
    /// How often the renewer checks the ledger
    pub sweep_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            extension_interval: Duration::from_secs(240),
            max_processing_time: Duration::from_secs(5400), // 90 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl LeaseConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            default_timeout: Duration::from_secs(
                std::env::var("LEASE_DEFAULT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            extension_interval: Duration::from_secs(
                std::env::var("LEASE_EXTENSION_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(240),
            ),
            max_processing_time: Duration::from_secs(
                std::env::var("LEASE_MAX_PROCESSING_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5400),
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("LEASE_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|s: &u64| *s > 0)
                    .unwrap_or(60),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Processing => "processing",
            LeaseStatus::Completed => "completed",
            LeaseStatus::Failed => "failed",
            LeaseStatus::TimedOut => "timed_out",
        }
    }
}

/// Ownership record of one in-flight message.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub handle: String,
    pub job_id: String,
    pub started_at: Instant,
    pub last_extended_at: Instant,
    pub visibility_window: Duration,
    pub extension_count: u32,
    pub status: LeaseStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseStats {
    pub active: usize,
    pub total_registered: u64,
    pub total_extensions: u64,
    pub total_timed_out: u64,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub extended: usize,
    pub timed_out: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    leases: HashMap<String, Lease>,
    total_registered: u64,
    total_extensions: u64,
    total_timed_out: u64,
}

/// Keeps registered messages invisible while they are processed.
///
/// Cheap to clone; clones share the same ledger.
#[derive(Clone)]
pub struct LeaseRenewer {
    queue: Arc<dyn WorkQueue>,
    config: LeaseConfig,
    ledger: Arc<Mutex<Ledger>>,
    visibility_gate: Arc<AsyncMutex<()>>,
}

impl LeaseRenewer {
    pub fn new(queue: Arc<dyn WorkQueue>, config: LeaseConfig) -> Self {
        Self {
            queue,
            config,
            ledger: Arc::new(Mutex::new(Ledger::default())),
            visibility_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Start tracking a claimed message and request its first visibility window.
    ///
    /// A failed visibility request is logged; the lease is kept either way.
    pub async fn register(&self, handle: &str, job_id: &str, estimated_duration: Option<Duration>) {
        let window = estimated_duration.unwrap_or(self.config.default_timeout);
        let now = Instant::now();

        {
            let mut ledger = self.lock();
            let previous = ledger.leases.insert(
                handle.to_string(),
                Lease {
                    handle: handle.to_string(),
                    job_id: job_id.to_string(),
                    started_at: now,
                    last_extended_at: now,
                    visibility_window: window,
                    extension_count: 0,
                    status: LeaseStatus::Processing,
                },
            );
            if previous.is_some() {
                warn!(job_id, "Message registered twice, replacing lease");
            }
            ledger.total_registered += 1;
        }

        match self.queue.change_visibility(handle, window).await {
            Ok(()) => {
                let mut ledger = self.lock();
                if let Some(lease) = ledger.leases.get_mut(handle) {
                    lease.last_extended_at = Instant::now();
                }
                debug!(job_id, window_secs = window.as_secs(), "Lease registered");
            }
            Err(e) => {
                warn!(job_id, "Failed to set initial visibility: {}", e);
            }
        }
    }

    /// Ask the queue for a new visibility window of `additional`, counted from now.
    ///
    /// Returns whether the window was extended. On failure the recorded
    /// window is left unchanged.
    pub async fn extend(&self, handle: &str, additional: Duration) -> bool {
        let _gate = self.visibility_gate.lock().await;
        let job_id = match self.lock().leases.get(handle) {
            Some(lease) => lease.job_id.clone(),
            None => {
                warn!("Cannot extend unknown lease");
                return false;
            }
        };

        if let Err(e) = self.queue.change_visibility(handle, additional).await {
            warn!(job_id = %job_id, "Failed to extend visibility: {}", e);
            return false;
        }

        let mut ledger = self.lock();
        let extension_count = match ledger.leases.get_mut(handle) {
            Some(lease) => {
                lease.last_extended_at = Instant::now();
                lease.visibility_window = additional;
                lease.extension_count += 1;
                lease.extension_count
            }
            // Resolved while the call was in flight.
            None => return false,
        };
        ledger.total_extensions += 1;
        drop(ledger);
        metrics::record_lease_extension();

        info!(
            job_id = %job_id,
            extension_count,
            window_secs = additional.as_secs(),
            "Extended message visibility"
        );
        true
    }

    /// Extend leases that are due and evict those over the processing ceiling.
    pub async fn sweep(&self) -> SweepReport {
        let snapshot: Vec<(String, Instant, Instant)> = self
            .lock()
            .leases
            .values()
            .map(|l| (l.handle.clone(), l.started_at, l.last_extended_at))
            .collect();

        let mut report = SweepReport::default();
        let now = Instant::now();

        for (handle, started_at, last_extended_at) in snapshot {
            if now.duration_since(started_at) > self.config.max_processing_time {
                if let Some(lease) = self.unregister(&handle, LeaseStatus::TimedOut) {
                    self.lock().total_timed_out += 1;
                    metrics::record_lease_timeout();
                    error!(
                        job_id = %lease.job_id,
                        elapsed_secs = now.duration_since(started_at).as_secs(),
                        max_secs = self.config.max_processing_time.as_secs(),
                        "Processing exceeded maximum time, lease evicted"
                    );
                    report.timed_out += 1;
                }
            } else if now.duration_since(last_extended_at) >= self.config.extension_interval
                && self.extend(&handle, self.config.default_timeout).await
            {
                report.extended += 1;
            }
        }

        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let renewer = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(renewer.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = renewer.config.sweep_interval.as_secs(),
                "Lease renewer started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let report = renewer.sweep().await;
                        metrics::set_active_leases(renewer.active_count());
                        if report.extended > 0 || report.timed_out > 0 {
                            debug!(
                                extended = report.extended,
                                timed_out = report.timed_out,
                                "Lease sweep complete"
                            );
                        }
                    }
                }
            }

            info!("Lease renewer stopped");
        })
    }

    /// Stop tracking a message before it is deleted or released.
    ///
    /// Waits for an extension already in flight, so no later visibility
    /// change can undo the caller's release.
    pub async fn finish(&self, handle: &str, status: LeaseStatus) -> Option<Lease> {
        let _gate = self.visibility_gate.lock().await;
        self.unregister(handle, status)
    }

    /// Stop tracking a message. Returns the removed lease, if it was still present.
    pub fn unregister(&self, handle: &str, status: LeaseStatus) -> Option<Lease> {
        let removed = self.lock().leases.remove(handle);

        match removed {
            Some(mut lease) => {
                lease.status = status;
                info!(
                    job_id = %lease.job_id,
                    status = status.as_str(),
                    duration_secs = lease.started_at.elapsed().as_secs(),
                    extension_count = lease.extension_count,
                    "Lease released"
                );
                Some(lease)
            }
            None => {
                debug!(status = status.as_str(), "Lease already released");
                None
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().leases.len()
    }

    pub fn lease(&self, handle: &str) -> Option<Lease> {
        self.lock().leases.get(handle).cloned()
    }

    pub fn stats(&self) -> LeaseStats {
        let ledger = self.lock();
        LeaseStats {
            active: ledger.leases.len(),
            total_registered: ledger.total_registered,
            total_extensions: ledger.total_extensions,
            total_timed_out: ledger.total_timed_out,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ledger key for a claimed message: its video id when the body names one,
/// else the queue message id.
pub fn lease_job_id(message: &QueueMessage) -> String {
    JobPayload::from_message(&message.body, &message.attributes, None)
        .ok()
        .and_then(|payload| payload.video_id)
        .map(|id| id.to_string())
        .unwrap_or_else(|| message.message_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{queue_message, FakeQueue};

    fn renewer(queue: Arc<FakeQueue>) -> LeaseRenewer {
        LeaseRenewer::new(queue, LeaseConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_then_unregister_leaves_ledger_empty() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());

        renewer.register("rh-1", "video-1", None).await;
        assert_eq!(renewer.active_count(), 1);
        assert_eq!(
            queue.visibility_calls(),
            vec![("rh-1".to_string(), Duration::from_secs(300))]
        );

        let lease = renewer.unregister("rh-1", LeaseStatus::Completed).unwrap();
        assert_eq!(lease.status, LeaseStatus::Completed);
        assert_eq!(renewer.active_count(), 0);
        assert!(renewer.unregister("rh-1", LeaseStatus::Completed).is_none());

        let stats = renewer.stats();
        assert_eq!(stats.total_registered, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_uses_estimated_duration() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());

        renewer
            .register("rh-1", "video-1", Some(Duration::from_secs(3600)))
            .await;

        let lease = renewer.lease("rh-1").unwrap();
        assert_eq!(lease.visibility_window, Duration::from_secs(3600));
        assert_eq!(queue.visibility_calls()[0].1, Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_survives_visibility_failure() {
        let queue = Arc::new(FakeQueue::default());
        queue.fail_visibility(true);
        let renewer = renewer(queue.clone());

        renewer.register("rh-1", "video-1", None).await;
        assert_eq!(renewer.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_unknown_handle() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());

        assert!(!renewer.extend("missing", Duration::from_secs(300)).await);
        assert!(queue.visibility_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_extension_keeps_window() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());
        renewer.register("rh-1", "video-1", None).await;

        queue.fail_visibility(true);
        assert!(!renewer.extend("rh-1", Duration::from_secs(900)).await);

        let lease = renewer.lease("rh-1").unwrap();
        assert_eq!(lease.visibility_window, Duration::from_secs(300));
        assert_eq!(lease.extension_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_extends_after_interval() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());
        renewer.register("rh-1", "video-1", None).await;

        tokio::time::advance(Duration::from_secs(239)).await;
        assert_eq!(renewer.sweep().await, SweepReport::default());
        assert_eq!(renewer.lease("rh-1").unwrap().extension_count, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = renewer.sweep().await;
        assert_eq!(report.extended, 1);

        let lease = renewer.lease("rh-1").unwrap();
        assert_eq!(lease.extension_count, 1);
        assert_eq!(lease.last_extended_at.duration_since(lease.started_at), Duration::from_secs(240));
        assert_eq!(renewer.stats().total_extensions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_after_max_processing_time() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = LeaseRenewer::new(
            queue.clone(),
            LeaseConfig {
                max_processing_time: Duration::from_secs(600),
                ..LeaseConfig::default()
            },
        );
        renewer.register("rh-1", "video-1", None).await;

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = renewer.sweep().await;

        assert_eq!(report.timed_out, 1);
        assert_eq!(renewer.active_count(), 0);
        assert_eq!(renewer.stats().total_timed_out, 1);
        // Resolution after eviction is a no-op.
        assert!(renewer.unregister("rh-1", LeaseStatus::Completed).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_renewer_extends_long_running_message() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        renewer.register("rh-1", "video-1", None).await;
        let handle = renewer.spawn(shutdown_rx);

        // Sweeps run at 0, 60, 120, 180, 240 and 300 seconds.
        tokio::time::sleep(Duration::from_secs(300)).await;

        let lease = renewer.lease("rh-1").unwrap();
        assert_eq!(lease.extension_count, 1);
        assert_eq!(
            lease.last_extended_at.duration_since(lease.started_at),
            Duration::from_secs(240)
        );
        assert_eq!(queue.visibility_calls().len(), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_estimate_is_extended_by_default_timeout() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());
        renewer
            .register("rh-1", "video-1", Some(Duration::from_secs(120)))
            .await;

        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(renewer.sweep().await.extended, 1);

        let calls = queue.visibility_calls();
        assert_eq!(calls[0].1, Duration::from_secs(120));
        assert_eq!(calls[1].1, Duration::from_secs(300));
        assert_eq!(
            renewer.lease("rh-1").unwrap().visibility_window,
            Duration::from_secs(300)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_waits_for_inflight_extension() {
        let queue = Arc::new(FakeQueue::default());
        let renewer = renewer(queue.clone());
        renewer.register("rh-1", "video-1", None).await;
        queue.delay_visibility(Duration::from_secs(2), Duration::ZERO);
        tokio::time::advance(Duration::from_secs(240)).await;

        let sweeper = renewer.clone();
        let sweep = tokio::spawn(async move { sweeper.sweep().await });
        tokio::task::yield_now().await;

        let started = Instant::now();
        let lease = renewer.finish("rh-1", LeaseStatus::Failed).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(lease.extension_count, 1);
        assert_eq!(sweep.await.unwrap().extended, 1);

        // Nothing left to extend.
        assert!(!renewer.extend("rh-1", Duration::from_secs(300)).await);
        assert_eq!(queue.visibility_calls().len(), 2);
    }

    #[test]
    fn test_lease_job_id_prefers_video_id() {
        assert_eq!(lease_job_id(&queue_message("m-1", 103)), "103");

        let mut message = queue_message("m-2", 104);
        message.body = "not json".to_string();
        assert_eq!(lease_job_id(&message), "m-2");
    }
}
