//! Queue workers and crash recovery.
//!
//! Workers poll the operational store for runnable requests (lowest
//! unprocessed ordinal per session) and drive them through the agent flow.
//! Delivery is at-least-once; the flow treats settled redeliveries as
//! no-ops. A scheduled monitor fails requests whose worker died mid-flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::services::agent::flow::AgentFlow;
use crate::services::agent::repository::AgentRepository;
use crate::services::events::{EventHub, SessionEvent};
use crate::utils::scheduled_executor::ScheduledTask;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One polling worker. Spawn several for horizontal throughput; the claim
/// query keeps them from stepping on each other.
pub struct QueueWorker {
    repository: Arc<AgentRepository>,
    flow: Arc<AgentFlow>,
    shutdown: Arc<AtomicBool>,
}

impl QueueWorker {
    pub fn new(repository: Arc<AgentRepository>, flow: Arc<AgentFlow>) -> Self {
        Self { repository, flow, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn run(self, worker_id: usize) {
        tracing::info!("Queue worker {} started", worker_id);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match self.repository.claim_next_request().await {
                Ok(Some(request)) => {
                    tracing::debug!(
                        "Worker {} claimed request {} (session {}, seq {})",
                        worker_id,
                        request.id,
                        request.session_id,
                        request.sequence_number
                    );
                    self.flow.process(request).await;
                },
                Ok(None) => {
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                },
                Err(e) => {
                    tracing::error!("Worker {} failed to claim work: {}", worker_id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                },
            }
        }
        tracing::info!("Queue worker {} stopped", worker_id);
    }
}

/// Spawn `count` workers onto the runtime; returns their shutdown handles
pub fn spawn_workers(
    repository: Arc<AgentRepository>,
    flow: Arc<AgentFlow>,
    count: usize,
) -> Vec<Arc<AtomicBool>> {
    (0..count)
        .map(|worker_id| {
            let worker = QueueWorker::new(Arc::clone(&repository), Arc::clone(&flow));
            let handle = worker.shutdown_handle();
            tokio::spawn(async move { worker.run(worker_id).await });
            handle
        })
        .collect()
}

/// Scheduled task: transition requests stuck `in_progress` beyond the
/// configured age to `error` and notify stream subscribers.
pub struct StaleRequestMonitor {
    repository: Arc<AgentRepository>,
    events: Arc<EventHub>,
    stale_after_secs: i64,
}

impl StaleRequestMonitor {
    pub fn new(
        repository: Arc<AgentRepository>,
        events: Arc<EventHub>,
        stale_after_secs: i64,
    ) -> Self {
        Self { repository, events, stale_after_secs }
    }

    async fn sweep(&self) -> Result<(), anyhow::Error> {
        let failed = self
            .repository
            .fail_stale_requests(self.stale_after_secs)
            .await?;
        for request in failed {
            tracing::warn!(
                "Request {} abandoned in_progress for over {}s; marked errored",
                request.id,
                self.stale_after_secs
            );
            self.events
                .publish(&request.session_id, SessionEvent::request_update(&request));
        }
        Ok(())
    }
}

impl ScheduledTask for StaleRequestMonitor {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(self.sweep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateSessionRequest, RequestStatus};

    async fn repo() -> Arc<AgentRepository> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        Arc::new(AgentRepository::new(pool))
    }

    #[tokio::test]
    async fn test_stale_monitor_fails_and_notifies() {
        let repository = repo().await;
        let events = Arc::new(EventHub::default());

        let session = repository
            .create_session("o", &CreateSessionRequest::default())
            .await
            .unwrap();
        let request = repository.create_request(&session.id, "x").await.unwrap();
        repository
            .set_request_status(&request.id, RequestStatus::InProgress)
            .await
            .unwrap();

        let mut receiver = events.subscribe(&session.id);

        // Negative threshold: anything in_progress is already stale
        let monitor = StaleRequestMonitor::new(Arc::clone(&repository), events, -1);
        monitor.sweep().await.unwrap();

        let stored = repository.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), RequestStatus::Error);

        let event = receiver.recv().await.unwrap();
        match event {
            SessionEvent::RequestUpdate { status, has_error, .. } => {
                assert_eq!(status, RequestStatus::Error);
                assert!(has_error);
            },
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_monitor_leaves_fresh_requests() {
        let repository = repo().await;
        let session = repository
            .create_session("o", &CreateSessionRequest::default())
            .await
            .unwrap();
        let request = repository.create_request(&session.id, "x").await.unwrap();
        repository
            .set_request_status(&request.id, RequestStatus::InProgress)
            .await
            .unwrap();

        let monitor =
            StaleRequestMonitor::new(Arc::clone(&repository), Arc::new(EventHub::default()), 3600);
        monitor.sweep().await.unwrap();

        let stored = repository.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), RequestStatus::InProgress);
    }
}
