//! Long-running worker loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vproc_queue::{QueueMessage, WorkQueue};

use crate::config::WorkerConfig;
use crate::error_tracker::ErrorSummary;
use crate::lease::{lease_job_id, LeaseRenewer, LeaseStats};
use crate::metrics;
use crate::processor::VideoPipeline;
use crate::resolution::{resolve, Resolution};
use crate::retry::{ErrorSeverity, FailureTracker};

/// Consecutive receive failures logged before suppression.
const MAX_LOGGED_RECEIVE_FAILURES: u32 = 3;

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerReport {
    pub succeeded: u64,
    pub failed: u64,
    pub system_fatal: u64,
    pub resolution_failures: u64,
    /// Set once any message failed with a system-fatal error.
    pub operator_attention: bool,
    pub errors: ErrorSummary,
    #[serde(skip)]
    pub leases: LeaseStats,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    system_fatal: AtomicU64,
    resolution_failures: AtomicU64,
    operator_attention: AtomicBool,
}

/// Claims one message at a time, processes it and resolves it, until shutdown.
pub struct WorkerLoop {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue>,
    pipeline: Arc<VideoPipeline>,
    renewer: LeaseRenewer,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl WorkerLoop {
    pub fn new(config: WorkerConfig, queue: Arc<dyn WorkQueue>, pipeline: Arc<VideoPipeline>) -> Self {
        let renewer = LeaseRenewer::new(queue.clone(), config.lease.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            queue,
            pipeline,
            renewer,
            shutdown,
            counters: Counters::default(),
        }
    }

    /// Ask the loop to stop after the in-flight message.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Sender for wiring shutdown into a signal handler.
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    pub fn renewer(&self) -> &LeaseRenewer {
        &self.renewer
    }

    /// Run until shutdown is requested.
    pub async fn run(&self) -> WorkerReport {
        info!(
            wait_secs = self.config.wait_time.as_secs(),
            visibility_secs = self.config.visibility_timeout.as_secs(),
            "Starting worker loop"
        );

        let renewer_task = self.renewer.spawn(self.shutdown.subscribe());
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut receive_failures = FailureTracker::new(MAX_LOGGED_RECEIVE_FAILURES);
        let mut empty_polls = 0u32;
        let request = self.config.receive_request();

        while !*shutdown_rx.borrow() {
            let received = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = self.queue.receive(request) => result,
            };

            let messages = match received {
                Ok(messages) => {
                    receive_failures.record_success();
                    messages
                }
                Err(e) => {
                    metrics::record_receive_error();
                    if receive_failures.record_failure() {
                        warn!("Failed to receive messages: {}", e);
                    }
                    self.pause(&mut shutdown_rx, self.config.error_backoff).await;
                    continue;
                }
            };

            if messages.is_empty() {
                metrics::record_empty_poll();
                empty_polls += 1;
                if empty_polls >= self.config.max_empty_polls {
                    debug!(
                        empty_polls,
                        pause_secs = self.config.idle_pause.as_secs(),
                        "Queue idle, pausing"
                    );
                    empty_polls = 0;
                    self.pause(&mut shutdown_rx, self.config.idle_pause).await;
                }
                continue;
            }

            empty_polls = 0;
            metrics::record_messages_received(messages.len());

            let mut messages = messages.into_iter();
            let Some(message) = messages.next() else {
                continue;
            };
            for extra in messages {
                // Asked for one; anything more would sit unleased.
                self.release_unstarted(&extra).await;
            }

            if *shutdown_rx.borrow() {
                self.release_unstarted(&message).await;
                break;
            }
            self.handle_message(&message).await;
        }

        info!("Shutdown requested, stopping worker loop");
        self.shutdown.send_replace(true);
        if let Err(e) = renewer_task.await {
            warn!("Lease renewer task failed: {}", e);
        }

        let report = self.report();
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            system_fatal = report.system_fatal,
            resolution_failures = report.resolution_failures,
            total_errors = report.errors.total_errors,
            most_frequent_error = report.errors.most_frequent_kind.as_deref().unwrap_or("none"),
            leases_registered = report.leases.total_registered,
            lease_extensions = report.leases.total_extensions,
            leases_timed_out = report.leases.total_timed_out,
            "Worker loop stopped"
        );
        if report.operator_attention {
            error!("System-fatal failures occurred during this run, operator attention required");
        }
        report
    }

    /// Hand a claimed message back without processing it.
    async fn release_unstarted(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.release(&message.receipt_handle).await {
            warn!(message_id = %message.message_id, "Failed to release message: {}", e);
        }
    }

    async fn handle_message(&self, message: &QueueMessage) {
        self.renewer
            .register(&message.receipt_handle, &lease_job_id(message), None)
            .await;

        let outcome = self.pipeline.process_message(message).await;
        let resolution = resolve(
            self.queue.as_ref(),
            &self.renewer,
            self.pipeline.errors(),
            message,
            &outcome,
        )
        .await;

        match resolution {
            Resolution::Completed => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Resolution::Unresolved { severity: None } => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.counters.resolution_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(resolution, Resolution::Unresolved { .. }) {
                    self.counters.resolution_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if resolution.severity() == Some(ErrorSeverity::SystemFatal) {
            self.counters.system_fatal.fetch_add(1, Ordering::Relaxed);
            self.counters.operator_attention.store(true, Ordering::Relaxed);
            metrics::record_operator_attention();
        }
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, shutdown_rx: &mut watch::Receiver<bool>, duration: std::time::Duration) {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Snapshot of the counters so far.
    pub fn report(&self) -> WorkerReport {
        WorkerReport {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            system_fatal: self.counters.system_fatal.load(Ordering::Relaxed),
            resolution_failures: self.counters.resolution_failures.load(Ordering::Relaxed),
            operator_attention: self.counters.operator_attention.load(Ordering::Relaxed),
            errors: self.pipeline.errors().summary(),
            leases: self.renewer.stats(),
        }
    }
}
