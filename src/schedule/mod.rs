//! Delayed background reconciliation work.
//!
//! The orchestrator hands a [`ReconcileTask`] to a [`ReconcileScheduler`]
//! and moves on; the Tokio-backed implementation sleeps out the delay and
//! then drives the reconciliation with bounded retry on transport failures
//! and lost write races.
//! Delivery is at-least-once - the ledger's gateway-reference idempotency
//! guard is what makes that safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::reconciliation::{ReconcileKind, ReconciliationService};

/// One deferred reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileTask {
    pub transaction_id: Uuid,
    pub kind: ReconcileKind,
}

impl ReconcileTask {
    pub fn new(transaction_id: Uuid, kind: ReconcileKind) -> Self {
        Self {
            transaction_id,
            kind,
        }
    }
}

/// Accepts delayed reconciliation work.
pub trait ReconcileScheduler: Send + Sync {
    fn schedule(&self, task: ReconcileTask, delay: Duration);
}

/// Tokio-backed scheduler: one dispatcher task fans scheduled work out to
/// per-task sleepers.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<(ReconcileTask, Duration)>,
}

impl TokioScheduler {
    pub fn start(service: Arc<ReconciliationService>, max_attempts: u32) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(ReconcileTask, Duration)>();

        tokio::spawn(async move {
            while let Some((task, delay)) = rx.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    run_task(service, task, delay, max_attempts).await;
                });
            }
            tracing::info!("Reconcile scheduler channel closed");
        });

        Self { tx }
    }
}

impl ReconcileScheduler for TokioScheduler {
    fn schedule(&self, task: ReconcileTask, delay: Duration) {
        tracing::info!(
            transaction_id = %task.transaction_id,
            kind = ?task.kind,
            delay_secs = delay.as_secs(),
            "Reconciliation scheduled"
        );
        if self.tx.send((task, delay)).is_err() {
            tracing::error!(
                transaction_id = %task.transaction_id,
                "Reconcile scheduler is gone; task dropped"
            );
        }
    }
}

async fn run_task(
    service: Arc<ReconciliationService>,
    task: ReconcileTask,
    delay: Duration,
    max_attempts: u32,
) {
    tokio::time::sleep(delay).await;

    for attempt in 1..=max_attempts {
        match service.reconcile(task.transaction_id, task.kind).await {
            Ok(()) => return,
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    transaction_id = %task.transaction_id,
                    attempt = attempt,
                    error = %err,
                    "Reconciliation attempt failed retryably; backing off"
                );
                tokio::time::sleep(Duration::from_secs(30 * attempt as u64)).await;
            }
            Err(err) => {
                tracing::error!(
                    transaction_id = %task.transaction_id,
                    attempt = attempt,
                    error = %err,
                    "Reconciliation abandoned"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scheduler double that records instead of spawning sleepers.
    #[derive(Default)]
    pub struct RecordingScheduler {
        pub tasks: Mutex<Vec<(ReconcileTask, Duration)>>,
    }

    impl ReconcileScheduler for RecordingScheduler {
        fn schedule(&self, task: ReconcileTask, delay: Duration) {
            self.tasks.lock().unwrap().push((task, delay));
        }
    }

    #[test]
    fn test_recording_scheduler_captures_delay() {
        let scheduler = RecordingScheduler::default();
        let task = ReconcileTask::new(Uuid::new_v4(), ReconcileKind::Debit);
        scheduler.schedule(task, Duration::from_secs(300));

        let tasks = scheduler.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, task);
        assert_eq!(tasks[0].1, Duration::from_secs(300));
    }
}
