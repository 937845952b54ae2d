//! In-process settlement bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`SettlementBus`] fans out every settled (completed or failed) [`Job`]
//! to presentation collaborators. It is designed to be shared via
//! `Arc<SettlementBus>` across the session.

use jobsync_core::Job;
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out of settled jobs.
///
/// # Usage
///
/// ```rust
/// use jobsync_events::SettlementBus;
///
/// let bus = SettlementBus::default();
/// let _rx = bus.subscribe();
/// assert_eq!(bus.subscriber_count(), 1);
/// ```
#[derive(Debug)]
pub struct SettlementBus {
    sender: broadcast::Sender<Job>,
}

impl SettlementBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed jobs are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a settled job to all current subscribers.
    ///
    /// If there are no active subscribers the job is silently dropped;
    /// the registry still holds the settled record.
    pub fn publish(&self, job: Job) {
        let job_id = job.id.clone();
        let status = job.status;
        match self.sender.send(job) {
            Ok(receivers) => {
                tracing::debug!(job_id = %job_id, %status, receivers, "Published settled job");
            }
            Err(_) => {
                tracing::trace!(job_id = %job_id, "No subscribers for settled job");
            }
        }
    }

    /// Subscribe to every job settled after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SettlementBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use jobsync_core::{JobId, JobKind, JobStatus};

    use super::*;

    fn settled(id: &str) -> Job {
        let mut job = Job::queued(JobId::new(id), JobKind::Voiceover, Utc::now());
        job.status = JobStatus::Completed;
        job
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = SettlementBus::default();
        let mut rx = bus.subscribe();

        bus.publish(settled("a"));

        let received = rx.recv().await.expect("should receive the job");
        assert_eq!(received.id, JobId::new("a"));
        assert_eq!(received.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_job() {
        let bus = SettlementBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(settled("multi"));

        let j1 = rx1.recv().await.expect("subscriber 1 should receive");
        let j2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(j1.id, j2.id);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = SettlementBus::default();
        bus.publish(settled("orphan"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
