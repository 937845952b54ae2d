//! In-memory job registry with forward-only transition rules.
//!
//! [`JobRegistry`] holds exactly one [`Job`] per id plus the bookkeeping
//! that decides which pending jobs are covered by a push channel and
//! which ones the poll supervisor must scan. It is a plain value with
//! no locking; the sync crate wraps it in a single mutex so that every
//! update path goes through the same rules.

use std::collections::HashMap;

use crate::job::{Job, JobKind, JobStatus, UpdateEvent};
use crate::types::{JobId, Timestamp};

/// Result of applying one [`UpdateEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The event changed the registry.
    Applied,
    /// The event would move the job backward, or targets a cancelled id.
    IgnoredStale,
    /// The job already holds a terminal status.
    IgnoredDuplicateTerminal,
}

impl ReconcileOutcome {
    pub fn is_applied(self) -> bool {
        self == ReconcileOutcome::Applied
    }
}

/// Result of registering a job id for tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new pending record was created (or a cancelled id revived).
    Registered,
    /// The id was already pending; nothing changed.
    AlreadyPending,
    /// The id already reached a terminal status.
    AlreadySettled,
}

/// Push-channel coverage of a pending job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// No channel; the job is on the poll scan list.
    Absent,
    /// A channel is being opened.
    Connecting,
    /// A channel is open and delivering messages.
    Open,
}

/// Poll state of a job on the scan list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Waiting for the next poll cycle.
    Scheduled,
    /// A status fetch is outstanding.
    InFlight,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    channel: ChannelPhase,
    poll_in_flight: bool,
}

/// Authoritative record of the jobs known to this session.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    /// Subset of `jobs` not yet in a terminal status.
    pending: HashMap<JobId, PendingEntry>,
    /// Ids the user cancelled, with the time of cancellation. Updates for
    /// them are discarded until the tombstone is pruned.
    cancelled: HashMap<JobId, Timestamp>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_pending(&self, id: &JobId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.cancelled.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending jobs, oldest submission first.
    pub fn pending_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .pending
            .keys()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Settled jobs still retained, oldest submission first.
    pub fn settled_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().filter(|j| j.is_terminal()).cloned().collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Start tracking `id` as a queued job.
    ///
    /// Registering a cancelled id revives it. The new entry starts in
    /// [`ChannelPhase::Absent`]; callers opening a channel move it to
    /// `Connecting` with [`set_channel`](Self::set_channel).
    pub fn register(&mut self, id: JobId, kind: JobKind, now: Timestamp) -> Registration {
        if let Some(job) = self.jobs.get(&id) {
            return if job.is_terminal() {
                Registration::AlreadySettled
            } else {
                Registration::AlreadyPending
            };
        }
        self.cancelled.remove(&id);
        self.pending.insert(id.clone(), PendingEntry::unchanneled());
        self.jobs.insert(id.clone(), Job::queued(id, kind, now));
        Registration::Registered
    }

    /// Apply one update under the ordering and monotonic rules.
    ///
    /// An event for an unknown id creates the record: non-terminal events
    /// register a pending job with no channel (discovery), terminal ones a
    /// settled record. A terminal event that is applied removes the id
    /// from the pending set and therefore from the scan list.
    pub fn apply(&mut self, event: &UpdateEvent, now: Timestamp) -> ReconcileOutcome {
        if self.cancelled.contains_key(&event.job_id) {
            return ReconcileOutcome::IgnoredStale;
        }

        let Some(job) = self.jobs.get_mut(&event.job_id) else {
            let mut job = Job::queued(event.job_id.clone(), event.kind, now);
            if let Some(at) = event.submitted_at {
                job.submitted_at = at;
            }
            merge(&mut job, event, now);
            if !job.is_terminal() {
                self.pending
                    .insert(event.job_id.clone(), PendingEntry::unchanneled());
            }
            self.jobs.insert(event.job_id.clone(), job);
            return ReconcileOutcome::Applied;
        };

        if job.is_terminal() {
            return ReconcileOutcome::IgnoredDuplicateTerminal;
        }
        if event.status.rank() < job.status.rank() {
            return ReconcileOutcome::IgnoredStale;
        }

        merge(job, event, now);
        if event.status.is_terminal() {
            self.pending.remove(&event.job_id);
        }
        ReconcileOutcome::Applied
    }

    /// Stop tracking `id`. Returns `true` if a pending job was dropped.
    ///
    /// Settled records are left alone. Any other id is tombstoned so later
    /// updates and poll discoveries for it are discarded.
    pub fn cancel(&mut self, id: &JobId, now: Timestamp) -> bool {
        if self.jobs.get(id).is_some_and(Job::is_terminal) {
            return false;
        }
        self.cancelled.insert(id.clone(), now);
        let was_pending = self.pending.remove(id).is_some();
        self.jobs.remove(id);
        was_pending
    }

    /// Record push-channel coverage for a pending job.
    ///
    /// Returns `false` (and changes nothing) if the job is not pending.
    pub fn set_channel(&mut self, id: &JobId, phase: ChannelPhase) -> bool {
        match self.pending.get_mut(id) {
            Some(entry) => {
                entry.channel = phase;
                true
            }
            None => false,
        }
    }

    pub fn channel_phase(&self, id: &JobId) -> Option<ChannelPhase> {
        self.pending.get(id).map(|e| e.channel)
    }

    /// Pending ids with no push channel, in id order.
    pub fn scan_list(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .pending
            .iter()
            .filter(|(_, e)| e.channel == ChannelPhase::Absent)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn scan_list_is_empty(&self) -> bool {
        !self
            .pending
            .values()
            .any(|e| e.channel == ChannelPhase::Absent)
    }

    /// Poll state of `id`, or `None` if it is not on the scan list.
    pub fn poll_phase(&self, id: &JobId) -> Option<PollPhase> {
        let entry = self.pending.get(id)?;
        if entry.channel != ChannelPhase::Absent {
            return None;
        }
        Some(if entry.poll_in_flight {
            PollPhase::InFlight
        } else {
            PollPhase::Scheduled
        })
    }

    /// Move `id` from scheduled to in-flight. Returns `false` if the id
    /// is not on the scan list or a fetch is already outstanding.
    pub fn begin_poll(&mut self, id: &JobId) -> bool {
        match self.poll_phase(id) {
            Some(PollPhase::Scheduled) => {
                if let Some(entry) = self.pending.get_mut(id) {
                    entry.poll_in_flight = true;
                }
                true
            }
            _ => false,
        }
    }

    /// Return `id` to scheduled after a fetch, if it is still pending.
    pub fn finish_poll(&mut self, id: &JobId) {
        if let Some(entry) = self.pending.get_mut(id) {
            entry.poll_in_flight = false;
        }
    }

    /// Drop settled records last updated before `cutoff`, along with
    /// cancellation tombstones older than `cutoff`. Returns how many
    /// settled records were dropped.
    pub fn prune_settled(&mut self, cutoff: Timestamp) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.is_terminal() && job.updated_at < cutoff));
        self.cancelled.retain(|_, cancelled_at| *cancelled_at >= cutoff);
        before - self.jobs.len()
    }

    /// Forget everything, including cancellation tombstones.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.pending.clear();
        self.cancelled.clear();
    }
}

impl PendingEntry {
    fn unchanneled() -> Self {
        Self {
            channel: ChannelPhase::Absent,
            poll_in_flight: false,
        }
    }
}

fn merge(job: &mut Job, event: &UpdateEvent, now: Timestamp) {
    job.status = event.status;
    if event.progress.is_some() {
        job.progress = event.progress;
    }
    match event.status {
        JobStatus::Completed => {
            job.result = event.result.clone();
            job.progress = Some(100);
        }
        JobStatus::Failed => job.error = event.error.clone(),
        _ => {}
    }
    job.updated_at = now;
}
