use crate::{QueueError, ScheduleRunner, TriggerPayload};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Durable hand-off of a fired schedule to whatever worker consumes `task_name`
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task_name: &str, payload: &TriggerPayload) -> Result<(), QueueError>;
}

/// Worker side of a task queue
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Next trigger in delivery order; `None` once the source is closed
    async fn next_trigger(&self) -> Result<Option<TriggerPayload>, QueueError>;
}

pub(crate) fn decode_payload(bytes: &[u8]) -> Result<TriggerPayload, QueueError> {
    serde_json::from_slice(bytes).map_err(|e| QueueError::SerializationFailed(e.to_string()))
}

/// Runs every trigger a source delivers through the schedule runner
pub struct QueueWorker {
    source: Arc<dyn TaskSource>,
    runner: Arc<ScheduleRunner>,
    retry_after: Duration,
}

impl QueueWorker {
    pub fn new(source: Arc<dyn TaskSource>, runner: Arc<ScheduleRunner>, retry_after: Duration) -> Self {
        Self {
            source,
            runner,
            retry_after,
        }
    }

    /// Consume until the source closes; returns how many triggers were run
    pub async fn run(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.source.next_trigger().await {
                Ok(Some(payload)) => {
                    handled += 1;
                    if let Err(e) = self.runner.run(payload).await {
                        tracing::error!("Queued run failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Reading task queue failed: {}", e);
                    tokio::time::sleep(self.retry_after).await;
                }
            }
        }
        tracing::info!("Task source closed after {} trigger(s)", handled);
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        assert!(matches!(
            decode_payload(b"{\"scheduleId\": 1}"),
            Err(QueueError::SerializationFailed(_))
        ));
    }
}
