//! Session facade wiring the hub, reconciler and poll supervisor.
//!
//! A [`SyncSession`] lives from login to logout. It owns one
//! [`Reconciler`], one [`ConnectionHub`] feeding it, and a spawned
//! [`PollSupervisor`] task. [`SyncSession::shutdown`] tears all of it down
//! and forgets every job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobsync_core::{Job, JobId, JobKind, UpdateEvent};
use jobsync_events::SettlementBus;
use jobsync_transport::{
    ChannelTable, ConnectionEvent, ConnectionHandle, ConnectionHub, FetchError, HttpJobService,
    JobService, Transport, WsTransport,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::poller::PollSupervisor;
use crate::reconciler::Reconciler;

/// Errors surfaced to callers of [`SyncSession::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The submission API rejected or never received the job.
    #[error("Job submission failed: {0}")]
    Submit(#[from] FetchError),
}

pub struct SyncSession {
    reconciler: Arc<Reconciler>,
    hub: ConnectionHub,
    poller: Arc<PollSupervisor>,
    service: Arc<dyn JobService>,
    user_id: Option<String>,
    settled_retention: Duration,
    shutdown_timeout: Duration,
    /// Master cancellation token for the poller task.
    cancel: CancellationToken,
    poller_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    /// Build a session over the WebSocket transport and HTTP job service
    /// described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: &SyncConfig) -> Self {
        let transport = Arc::new(WsTransport::new(
            config.ws_url.clone(),
            config.auth_token.clone(),
        ));
        let service = Arc::new(HttpJobService::new(
            config.api_url.clone(),
            config.auth_token.clone(),
        ));
        Self::start(config, transport, service)
    }

    /// Build a session over arbitrary transport and job service
    /// implementations and spawn its poll supervisor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &SyncConfig,
        transport: Arc<dyn Transport>,
        service: Arc<dyn JobService>,
    ) -> Self {
        let channels = ChannelTable::new();
        let bus = Arc::new(SettlementBus::default());
        let reconciler = Arc::new(Reconciler::new(channels.clone(), bus));
        let hub = ConnectionHub::new(transport, reconciler.clone(), channels)
            .with_open_timeout(config.open_timeout);

        let poller = Arc::new(
            PollSupervisor::new(reconciler.clone(), service.clone(), config.poll_interval)
                .with_user_id(config.user_id.clone())
                .with_settled_retention(config.settled_retention),
        );

        let cancel = CancellationToken::new();
        let poller_task = tokio::spawn({
            let poller = Arc::clone(&poller);
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        tracing::info!(
            api_url = %config.api_url,
            ws_url = %config.ws_url,
            user_id = ?config.user_id,
            "Job sync session started",
        );

        Self {
            reconciler,
            hub,
            poller,
            service,
            user_id: config.user_id.clone(),
            settled_retention: config.settled_retention,
            shutdown_timeout: config.shutdown_timeout,
            cancel,
            poller_task: Mutex::new(Some(poller_task)),
        }
    }

    /// Submit a new job and start tracking it.
    pub async fn submit(
        &self,
        kind: JobKind,
        params: &serde_json::Value,
    ) -> Result<ConnectionHandle, SessionError> {
        let job_id = self.service.submit(kind, params).await?;
        tracing::info!(job_id = %job_id, %kind, "Job submitted");
        Ok(self.track(job_id, kind))
    }

    /// Start tracking `job_id` over a push channel. Idempotent.
    pub fn track(&self, job_id: JobId, kind: JobKind) -> ConnectionHandle {
        self.hub.track(job_id, kind)
    }

    /// Stop listening on the push channel for `job_id`. The job stays
    /// pending and the poll supervisor resolves it.
    pub fn untrack(&self, job_id: &JobId) -> bool {
        self.hub.untrack(job_id)
    }

    /// User-initiated stop. Closes the channel, drops the job from the
    /// scan list and discards any update for it that arrives later.
    ///
    /// In-flight status fetches are not aborted; their results are ignored.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.reconciler.cancel(job_id)
    }

    /// Receive every job as it settles.
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.reconciler.bus().subscribe()
    }

    /// Channel lifecycle diagnostics.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.hub.subscribe()
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.reconciler.pending_jobs()
    }

    pub fn settled_jobs(&self) -> Vec<Job> {
        self.reconciler.settled_jobs()
    }

    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.reconciler.job(job_id)
    }

    pub fn is_tracked(&self, job_id: &JobId) -> bool {
        self.hub.is_tracked(job_id)
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn poller(&self) -> &Arc<PollSupervisor> {
        &self.poller
    }

    /// Register the user's in-flight jobs that this session does not know
    /// yet. They are resolved by polling. Returns how many were found.
    ///
    /// Needs a configured user id. Fetch errors are logged, not returned.
    pub async fn discover(&self) -> usize {
        let Some(user_id) = &self.user_id else {
            tracing::debug!("No user id configured, skipping discovery");
            return 0;
        };

        let snapshots = match self.service.fetch_statuses(user_id).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Job discovery failed");
                return 0;
            }
        };

        let discovered = snapshots
            .into_iter()
            .filter_map(|snapshot| self.reconciler.discover(UpdateEvent::from(snapshot)))
            .count();
        tracing::info!(user_id = %user_id, discovered, "Job discovery complete");
        discovered
    }

    /// Drop settled records older than the configured retention.
    pub fn prune_settled(&self) -> usize {
        chrono::Duration::from_std(self.settled_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .map(|cutoff| self.reconciler.prune_settled(cutoff))
            .unwrap_or(0)
    }

    /// Stop every channel and the poller, then forget every job.
    ///
    /// Waits up to the configured shutdown timeout per task.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job sync session");
        self.cancel.cancel();
        self.hub.shutdown(self.shutdown_timeout).await;

        let task = self.poller_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(self.shutdown_timeout, task).await.is_err() {
                tracing::warn!("Poll supervisor did not stop in time");
            }
        }

        self.reconciler.clear();
        tracing::info!("Job sync session shut down");
    }
}
