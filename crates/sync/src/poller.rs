//! Fallback status polling for pending jobs with no push channel.
//!
//! [`PollSupervisor::run`] sleeps on a wake-up signal while the scan list
//! is empty and runs one cycle per interval otherwise. A cycle fetches
//! every scheduled job (batched when a user id is configured, per id for
//! the rest) and feeds each snapshot through [`Reconciler::apply`], the
//! same entry point the push path uses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use jobsync_core::{JobId, JobKind, UpdateEvent};
use jobsync_transport::JobService;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::reconciler::Reconciler;

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Scan-list jobs fetched this cycle.
    pub polled: usize,
    /// Snapshots that changed the registry.
    pub applied: usize,
    /// Per-id fetches that failed and will be retried.
    pub failed: usize,
    /// Unknown in-flight jobs registered from the batched response.
    pub discovered: usize,
}

pub struct PollSupervisor {
    reconciler: Arc<Reconciler>,
    service: Arc<dyn JobService>,
    interval: Duration,
    user_id: Option<String>,
    settled_retention: Duration,
    /// Consecutive fetch failures per job, for diagnostics only.
    failures: Mutex<HashMap<JobId, u32>>,
}

impl PollSupervisor {
    pub fn new(reconciler: Arc<Reconciler>, service: Arc<dyn JobService>, interval: Duration) -> Self {
        Self {
            reconciler,
            service,
            interval,
            user_id: None,
            settled_retention: Duration::from_secs(3600),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Use the batched `fetch_statuses` endpoint for this user.
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_settled_retention(mut self, retention: Duration) -> Self {
        self.settled_retention = retention;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consecutive fetch failures recorded for `job_id`.
    pub fn failure_count(&self, job_id: &JobId) -> u32 {
        self.failures.lock().get(job_id).copied().unwrap_or(0)
    }

    /// Poll until `cancel` fires.
    ///
    /// No timer runs while the scan list is empty. The first cycle after
    /// a wake-up runs one interval later.
    pub async fn run(&self, cancel: CancellationToken) {
        let wake = self.reconciler.poll_wake();
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batched = self.user_id.is_some(),
            "Poll supervisor started",
        );

        loop {
            if self.reconciler.scan_list_is_empty() {
                tracing::debug!("Scan list empty, poll supervisor idle");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => continue,
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.run_cycle() => report,
            };
            tracing::debug!(
                polled = report.polled,
                applied = report.applied,
                failed = report.failed,
                discovered = report.discovered,
                "Poll cycle complete",
            );
        }

        tracing::info!("Poll supervisor stopping");
    }

    /// Run one poll cycle now.
    pub async fn run_cycle(&self) -> CycleReport {
        let targets = self.reconciler.begin_poll_cycle();
        let mut report = CycleReport {
            polled: targets.len(),
            ..Default::default()
        };
        let mut remaining = targets.clone();

        if let Some(user_id) = &self.user_id {
            match self.service.fetch_statuses(user_id).await {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        let event = UpdateEvent::from(snapshot);
                        match remaining.iter().position(|(id, _)| id == &event.job_id) {
                            Some(pos) => {
                                remaining.swap_remove(pos);
                                self.failures.lock().remove(&event.job_id);
                                if self.reconciler.apply(event).is_applied() {
                                    report.applied += 1;
                                }
                            }
                            None => {
                                if self.reconciler.discover(event).is_some() {
                                    report.discovered += 1;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Batched status fetch failed, fetching per job",
                    );
                }
            }
        }

        let fetches = remaining.iter().map(|(id, kind)| self.fetch_one(id, *kind));
        for applied in join_all(fetches).await {
            match applied {
                Some(true) => report.applied += 1,
                Some(false) => {}
                None => report.failed += 1,
            }
        }

        for (id, _) in &targets {
            self.reconciler.finish_poll(id);
        }

        let live = self.reconciler.scan_list();
        self.failures.lock().retain(|id, _| live.contains(id));

        if let Some(cutoff) = chrono::Duration::from_std(self.settled_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        {
            self.reconciler.prune_settled(cutoff);
        }

        report
    }

    /// Fetch and apply one job. `None` means the fetch failed.
    async fn fetch_one(&self, job_id: &JobId, kind: JobKind) -> Option<bool> {
        match self.service.fetch_status(job_id, kind).await {
            Ok(snapshot) => {
                self.failures.lock().remove(job_id);
                Some(self.reconciler.apply(UpdateEvent::from(snapshot)).is_applied())
            }
            Err(e) => {
                let attempts = {
                    let mut failures = self.failures.lock();
                    let count = failures.entry(job_id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                tracing::warn!(
                    job_id = %job_id,
                    %kind,
                    attempts,
                    error = %e,
                    "Status fetch failed, retrying next cycle",
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use jobsync_core::{JobSnapshot, JobStatus};
    use jobsync_events::SettlementBus;
    use jobsync_transport::{ChannelTable, FetchError};

    use super::*;

    #[derive(Default)]
    struct ScriptedService {
        single: Mutex<HashMap<JobId, JobSnapshot>>,
        batched: Mutex<Option<Vec<JobSnapshot>>>,
    }

    #[async_trait]
    impl JobService for ScriptedService {
        async fn submit(&self, _kind: JobKind, _params: &serde_json::Value) -> Result<JobId, FetchError> {
            Ok(JobId::new("new"))
        }

        async fn fetch_status(&self, job_id: &JobId, _kind: JobKind) -> Result<JobSnapshot, FetchError> {
            self.single.lock().get(job_id).cloned().ok_or(FetchError::Api {
                status: 503,
                body: "unavailable".into(),
            })
        }

        async fn fetch_statuses(&self, _user_id: &str) -> Result<Vec<JobSnapshot>, FetchError> {
            self.batched.lock().clone().ok_or(FetchError::Api {
                status: 500,
                body: "down".into(),
            })
        }
    }

    fn snapshot(id: &str, status: JobStatus) -> JobSnapshot {
        JobSnapshot {
            id: JobId::new(id),
            kind: JobKind::ImageGeneration,
            status,
            progress: None,
            result: None,
            error: None,
            submitted_at: None,
        }
    }

    fn setup(service: Arc<ScriptedService>) -> (Arc<Reconciler>, PollSupervisor) {
        let reconciler = Arc::new(Reconciler::new(
            ChannelTable::new(),
            Arc::new(SettlementBus::default()),
        ));
        let poller = PollSupervisor::new(reconciler.clone(), service, Duration::from_millis(20));
        (reconciler, poller)
    }

    #[tokio::test]
    async fn cycle_settles_job_from_single_fetch() {
        let service = Arc::new(ScriptedService::default());
        service
            .single
            .lock()
            .insert(JobId::new("p"), snapshot("p", JobStatus::Completed));
        let (reconciler, poller) = setup(service);
        reconciler.register(JobId::new("p"), JobKind::ImageGeneration);

        let report = poller.run_cycle().await;

        assert_eq!(report, CycleReport { polled: 1, applied: 1, ..Default::default() });
        assert!(reconciler.scan_list_is_empty());
        assert_eq!(
            reconciler.job(&JobId::new("p")).unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn fetch_error_is_retried_next_cycle() {
        let service = Arc::new(ScriptedService::default());
        let (reconciler, poller) = setup(service.clone());
        let id = JobId::new("c");
        reconciler.register(id.clone(), JobKind::Voiceover);

        let report = poller.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(poller.failure_count(&id), 1);
        assert_eq!(reconciler.scan_list(), vec![id.clone()]);

        let mut failed = snapshot("c", JobStatus::Failed);
        failed.error = Some("out of credits".into());
        service.single.lock().insert(id.clone(), failed);

        let report = poller.run_cycle().await;
        assert_eq!(report.applied, 1);
        assert_eq!(poller.failure_count(&id), 0);
        assert_eq!(
            reconciler.job(&id).unwrap().error.as_deref(),
            Some("out of credits")
        );
    }

    #[tokio::test]
    async fn batched_fetch_discovers_unknown_in_flight_jobs() {
        let service = Arc::new(ScriptedService::default());
        *service.batched.lock() = Some(vec![
            snapshot("a", JobStatus::InProgress),
            snapshot("b", JobStatus::InProgress),
            snapshot("old", JobStatus::Completed),
        ]);
        let (reconciler, poller) = setup(service);
        let poller = poller.with_user_id(Some("u1".into()));
        reconciler.register(JobId::new("a"), JobKind::ImageGeneration);

        let report = poller.run_cycle().await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.discovered, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(reconciler.scan_list(), vec![JobId::new("a"), JobId::new("b")]);
        assert!(reconciler.job(&JobId::new("old")).is_none());
    }

    #[tokio::test]
    async fn batched_failure_falls_back_to_single_fetch() {
        let service = Arc::new(ScriptedService::default());
        service
            .single
            .lock()
            .insert(JobId::new("a"), snapshot("a", JobStatus::Completed));
        let (reconciler, poller) = setup(service);
        let poller = poller.with_user_id(Some("u1".into()));
        reconciler.register(JobId::new("a"), JobKind::ImageGeneration);

        let report = poller.run_cycle().await;

        assert_eq!(report.applied, 1);
        assert_eq!(reconciler.pending_count(), 0);
    }

    #[tokio::test]
    async fn run_wakes_when_job_needs_polling() {
        let service = Arc::new(ScriptedService::default());
        service
            .single
            .lock()
            .insert(JobId::new("w"), snapshot("w", JobStatus::Completed));
        let (reconciler, poller) = setup(service);
        let mut settled = reconciler.bus().subscribe();
        let poller = Arc::new(poller);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let poller = poller.clone();
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        reconciler.register(JobId::new("w"), JobKind::ImageGeneration);

        let job = tokio::time::timeout(Duration::from_secs(2), settled.recv())
            .await
            .expect("poller never settled the job")
            .unwrap();
        assert_eq!(job.id, JobId::new("w"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}
