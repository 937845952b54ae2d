//! Single reconciliation entry point for push and poll updates.
//!
//! [`Reconciler`] owns the [`JobRegistry`] behind one mutex. Every update,
//! whichever path delivered it, goes through [`Reconciler::apply`]. When an
//! update settles a job, the registry change, the channel close, the scan
//! list drop and the bus publish all happen while the lock is held, so no
//! observer can see a job that is settled but still polled or listened to.
//!
//! Lock order is registry first, then the channel table. The channel table
//! never calls back into the reconciler while its own lock is held.

use std::sync::Arc;

use chrono::Utc;
use jobsync_core::registry::{ChannelPhase, Registration};
use jobsync_core::{Job, JobId, JobKind, JobRegistry, ReconcileOutcome, Timestamp, UpdateEvent};
use jobsync_events::SettlementBus;
use jobsync_transport::{ChannelTable, UpdateSink};
use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct Reconciler {
    registry: Mutex<JobRegistry>,
    channels: ChannelTable,
    bus: Arc<SettlementBus>,
    /// Signalled whenever the scan list may have become non-empty.
    poll_wake: Arc<Notify>,
}

impl Reconciler {
    pub fn new(channels: ChannelTable, bus: Arc<SettlementBus>) -> Self {
        Self {
            registry: Mutex::new(JobRegistry::new()),
            channels,
            bus,
            poll_wake: Arc::new(Notify::new()),
        }
    }

    /// Apply one update under the ordering and monotonic rules.
    pub fn apply(&self, event: UpdateEvent) -> ReconcileOutcome {
        let mut registry = self.registry.lock();
        self.apply_locked(&mut registry, &event, Utc::now())
    }

    /// Apply `event` only if its job is unknown to this session and still
    /// in flight. Returns `None` when the event was not a discovery.
    ///
    /// Cancelled ids are never rediscovered.
    pub fn discover(&self, event: UpdateEvent) -> Option<ReconcileOutcome> {
        let mut registry = self.registry.lock();
        if event.status.is_terminal()
            || registry.get(&event.job_id).is_some()
            || registry.is_cancelled(&event.job_id)
        {
            return None;
        }
        tracing::info!(
            job_id = %event.job_id,
            kind = %event.kind,
            status = %event.status,
            "Discovered in-flight job",
        );
        Some(self.apply_locked(&mut registry, &event, Utc::now()))
    }

    fn apply_locked(
        &self,
        registry: &mut JobRegistry,
        event: &UpdateEvent,
        now: Timestamp,
    ) -> ReconcileOutcome {
        let outcome = registry.apply(event, now);
        match outcome {
            ReconcileOutcome::Applied if event.status.is_terminal() => {
                self.channels.close(&event.job_id);
                if let Some(job) = registry.get(&event.job_id) {
                    tracing::info!(
                        job_id = %job.id,
                        kind = %job.kind,
                        status = %job.status,
                        origin = %event.origin,
                        "Job settled",
                    );
                    self.bus.publish(job.clone());
                }
            }
            ReconcileOutcome::Applied => {
                tracing::debug!(
                    job_id = %event.job_id,
                    status = %event.status,
                    progress = ?event.progress,
                    origin = %event.origin,
                    "Job updated",
                );
                if registry.poll_phase(&event.job_id).is_some() {
                    self.poll_wake.notify_one();
                }
            }
            ignored => {
                tracing::debug!(
                    job_id = %event.job_id,
                    status = %event.status,
                    origin = %event.origin,
                    outcome = ?ignored,
                    "Update ignored",
                );
            }
        }
        outcome
    }

    /// Register `job_id` as pending with no channel. Used for jobs that
    /// will be resolved by polling only.
    pub fn register(&self, job_id: JobId, kind: JobKind) -> Registration {
        let mut registry = self.registry.lock();
        let registration = registry.register(job_id, kind, Utc::now());
        if registration == Registration::Registered {
            self.poll_wake.notify_one();
        }
        registration
    }

    /// Stop tracking `job_id`: close its channel and drop it from the scan
    /// list. Later updates for it are discarded. Returns `true` if a
    /// pending job was dropped.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let mut registry = self.registry.lock();
        let dropped = registry.cancel(job_id, Utc::now());
        self.channels.close(job_id);
        if dropped {
            tracing::info!(job_id = %job_id, "Job cancelled");
        }
        dropped
    }

    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.registry.lock().get(job_id).cloned()
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.registry.lock().pending_jobs()
    }

    pub fn settled_jobs(&self) -> Vec<Job> {
        self.registry.lock().settled_jobs()
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending_count()
    }

    /// Whether `job_id` has a record or a cancellation tombstone.
    pub fn is_known(&self, job_id: &JobId) -> bool {
        let registry = self.registry.lock();
        registry.get(job_id).is_some() || registry.is_cancelled(job_id)
    }

    pub fn channel_phase(&self, job_id: &JobId) -> Option<ChannelPhase> {
        self.registry.lock().channel_phase(job_id)
    }

    pub fn scan_list(&self) -> Vec<JobId> {
        self.registry.lock().scan_list()
    }

    pub fn scan_list_is_empty(&self) -> bool {
        self.registry.lock().scan_list_is_empty()
    }

    /// Move every scheduled scan-list entry to in-flight and return them.
    pub(crate) fn begin_poll_cycle(&self) -> Vec<(JobId, JobKind)> {
        let mut registry = self.registry.lock();
        let mut targets = Vec::new();
        for id in registry.scan_list() {
            if registry.begin_poll(&id) {
                if let Some(job) = registry.get(&id) {
                    targets.push((id.clone(), job.kind));
                }
            }
        }
        targets
    }

    pub(crate) fn finish_poll(&self, job_id: &JobId) {
        self.registry.lock().finish_poll(job_id);
    }

    /// Drop settled records last updated before `cutoff`.
    pub fn prune_settled(&self, cutoff: Timestamp) -> usize {
        let pruned = self.registry.lock().prune_settled(cutoff);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned settled jobs");
        }
        pruned
    }

    /// Forget every job, pending or settled.
    pub fn clear(&self) {
        self.registry.lock().clear();
    }

    pub fn bus(&self) -> &Arc<SettlementBus> {
        &self.bus
    }

    pub(crate) fn poll_wake(&self) -> Arc<Notify> {
        Arc::clone(&self.poll_wake)
    }
}

impl UpdateSink for Reconciler {
    fn deliver(&self, event: UpdateEvent) -> ReconcileOutcome {
        self.apply(event)
    }

    fn channel_connecting(&self, job_id: &JobId, kind: JobKind) -> bool {
        let mut registry = self.registry.lock();
        match registry.register(job_id.clone(), kind, Utc::now()) {
            Registration::AlreadySettled => false,
            Registration::Registered | Registration::AlreadyPending => {
                registry.set_channel(job_id, ChannelPhase::Connecting);
                true
            }
        }
    }

    fn channel_opened(&self, job_id: &JobId) {
        let mut registry = self.registry.lock();
        // Only a connecting channel opens; an untracked one was already
        // handed to polling.
        if registry.channel_phase(job_id) == Some(ChannelPhase::Connecting) {
            registry.set_channel(job_id, ChannelPhase::Open);
        }
    }

    fn channel_lost(&self, job_id: &JobId) {
        let mut registry = self.registry.lock();
        if registry.set_channel(job_id, ChannelPhase::Absent) {
            tracing::info!(job_id = %job_id, "Job handed to poll supervisor");
            self.poll_wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use jobsync_core::{JobStatus, UpdateOrigin};

    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new(ChannelTable::new(), Arc::new(SettlementBus::default()))
    }

    fn event(id: &str, status: JobStatus) -> UpdateEvent {
        UpdateEvent::new(JobId::new(id), JobKind::ImageGeneration, status, UpdateOrigin::Push)
    }

    #[tokio::test]
    async fn terminal_update_publishes_once() {
        let reconciler = reconciler();
        let mut rx = reconciler.bus().subscribe();
        reconciler.register(JobId::new("d"), JobKind::ImageGeneration);

        let first = reconciler.apply(event("d", JobStatus::Completed));
        let second = reconciler.apply(UpdateEvent::new(
            JobId::new("d"),
            JobKind::ImageGeneration,
            JobStatus::Completed,
            UpdateOrigin::Poll,
        ));

        assert_eq!(first, ReconcileOutcome::Applied);
        assert_eq!(second, ReconcileOutcome::IgnoredDuplicateTerminal);
        assert_eq!(rx.recv().await.unwrap().id, JobId::new("d"));
        assert_matches!(rx.try_recv(), Err(_));
        assert_eq!(reconciler.pending_count(), 0);
    }

    #[test]
    fn channel_coverage_moves_job_off_scan_list() {
        let reconciler = reconciler();
        let id = JobId::new("a");

        assert!(reconciler.channel_connecting(&id, JobKind::Video));
        assert!(reconciler.scan_list_is_empty());

        reconciler.channel_opened(&id);
        assert_eq!(reconciler.channel_phase(&id), Some(ChannelPhase::Open));

        reconciler.channel_lost(&id);
        assert_eq!(reconciler.scan_list(), vec![id]);
    }

    #[test]
    fn channel_lost_before_open_keeps_job_on_scan_list() {
        let reconciler = reconciler();
        let id = JobId::new("u");

        assert!(reconciler.channel_connecting(&id, JobKind::Video));
        reconciler.channel_lost(&id);
        reconciler.channel_opened(&id);

        assert_eq!(reconciler.channel_phase(&id), Some(ChannelPhase::Absent));
        assert_eq!(reconciler.scan_list(), vec![id]);
    }

    #[test]
    fn settled_job_gets_no_channel() {
        let reconciler = reconciler();
        reconciler.apply(event("s", JobStatus::Failed).with_error("boom"));
        assert!(!reconciler.channel_connecting(&JobId::new("s"), JobKind::ImageGeneration));
    }

    #[test]
    fn discover_skips_known_terminal_and_cancelled_jobs() {
        let reconciler = reconciler();
        reconciler.register(JobId::new("known"), JobKind::Video);
        reconciler.cancel(&JobId::new("gone"));

        assert_eq!(reconciler.discover(event("known", JobStatus::InProgress)), None);
        assert_eq!(reconciler.discover(event("gone", JobStatus::InProgress)), None);
        assert_eq!(reconciler.discover(event("done", JobStatus::Completed)), None);
        assert_eq!(
            reconciler.discover(event("new", JobStatus::InProgress)),
            Some(ReconcileOutcome::Applied)
        );
        assert_eq!(reconciler.scan_list(), vec![JobId::new("known"), JobId::new("new")]);
    }

    #[test]
    fn cancel_discards_later_updates() {
        let reconciler = reconciler();
        let id = JobId::new("x");
        reconciler.channel_connecting(&id, JobKind::Voiceover);

        assert!(reconciler.cancel(&id));
        assert_eq!(
            reconciler.apply(event("x", JobStatus::Completed)),
            ReconcileOutcome::IgnoredStale
        );
        assert!(reconciler.job(&id).is_none());
        assert!(reconciler.is_known(&id));
    }

    #[test]
    fn begin_poll_cycle_marks_targets_in_flight() {
        let reconciler = reconciler();
        reconciler.register(JobId::new("p"), JobKind::ModelTraining);

        let targets = reconciler.begin_poll_cycle();
        assert_eq!(targets, vec![(JobId::new("p"), JobKind::ModelTraining)]);
        assert!(reconciler.begin_poll_cycle().is_empty());

        reconciler.finish_poll(&JobId::new("p"));
        assert_eq!(reconciler.begin_poll_cycle().len(), 1);
    }
}
