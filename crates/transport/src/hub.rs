//! Per-job push-channel hub.
//!
//! [`ConnectionHub`] owns one channel per tracked job. [`track`] spawns a
//! task per job (open -> process frames -> release) and returns a
//! [`ConnectionHandle`]; [`untrack`] stops it. Channels that fail or
//! close early never fail the job: the hub reports the loss to its
//! [`UpdateSink`] and the poll supervisor takes over.
//!
//! Lifecycle diagnostics are broadcast as [`ConnectionEvent`]s. Call
//! [`ConnectionHub::subscribe`] to receive them.
//!
//! [`track`]: ConnectionHub::track
//! [`untrack`]: ConnectionHub::untrack

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobsync_core::{JobId, JobKind, ReconcileOutcome, UpdateEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Transport, TransportError};
use crate::events::{CloseReason, ConnectionEvent};
use crate::processor::{process_frames, ChannelExit};

/// Broadcast channel capacity for lifecycle events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default limit on how long a channel may take to open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver of everything a channel learns.
///
/// Implemented by the reconciler. Every method is synchronous and must
/// not block on I/O.
pub trait UpdateSink: Send + Sync {
    /// Reconcile one classified update.
    fn deliver(&self, event: UpdateEvent) -> ReconcileOutcome;

    /// Register `job_id` as pending and mark its channel as connecting.
    ///
    /// Returns `false` when the job must not get a channel (it has
    /// already settled).
    fn channel_connecting(&self, job_id: &JobId, kind: JobKind) -> bool;

    /// The channel for `job_id` is open and delivering.
    fn channel_opened(&self, job_id: &JobId);

    /// The channel for `job_id` is gone while the job may still be pending.
    fn channel_lost(&self, job_id: &JobId);
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// Caller-side view of one tracked channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    job_id: JobId,
    kind: JobKind,
    connection_id: u64,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Distinguishes successive channels for the same job id.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether the channel has been untracked.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the channel is untracked.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// ChannelTable
// ---------------------------------------------------------------------------

/// Internal bookkeeping for a single channel.
struct ManagedChannel {
    handle: ConnectionHandle,
    task: Option<JoinHandle<()>>,
}

/// Id-keyed ownership map of live channels.
///
/// Cloning shares the same map. The reconciler holds a clone so it can
/// untrack a job in the same step that settles it.
#[derive(Clone, Default)]
pub struct ChannelTable {
    inner: Arc<Mutex<HashMap<JobId, ManagedChannel>>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close and drop the channel for `job_id`. No-op if there is none.
    ///
    /// Returns `true` if a channel was closed.
    pub fn close(&self, job_id: &JobId) -> bool {
        match self.inner.lock().remove(job_id) {
            Some(managed) => {
                managed.handle.cancel.cancel();
                tracing::debug!(
                    job_id = %job_id,
                    connection_id = managed.handle.connection_id,
                    "Channel untracked",
                );
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.inner.lock().contains_key(job_id)
    }

    pub fn handle(&self, job_id: &JobId) -> Option<ConnectionHandle> {
        self.inner.lock().get(job_id).map(|m| m.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Job ids with a live channel, in id order.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove the entry for `job_id` only if it still belongs to
    /// `connection_id`. Returns `true` if it did.
    fn release(&self, job_id: &JobId, connection_id: u64) -> bool {
        let mut table = self.inner.lock();
        match table.get(job_id) {
            Some(m) if m.handle.connection_id == connection_id => {
                table.remove(job_id);
                true
            }
            _ => false,
        }
    }

    fn attach_task(&self, job_id: &JobId, connection_id: u64, task: JoinHandle<()>) {
        let mut table = self.inner.lock();
        if let Some(m) = table.get_mut(job_id) {
            if m.handle.connection_id == connection_id {
                m.task = Some(task);
            }
        }
    }

    fn drain(&self) -> Vec<ManagedChannel> {
        self.inner.lock().drain().map(|(_, m)| m).collect()
    }
}

// ---------------------------------------------------------------------------
// ConnectionHub
// ---------------------------------------------------------------------------

/// Owns the push channel of every tracked job.
pub struct ConnectionHub {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn UpdateSink>,
    channels: ChannelTable,
    event_tx: broadcast::Sender<ConnectionEvent>,
    next_connection_id: AtomicU64,
    open_timeout: Duration,
    /// Master cancellation token -- cancelled during shutdown.
    cancel: CancellationToken,
}

impl ConnectionHub {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn UpdateSink>,
        channels: ChannelTable,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            sink,
            channels,
            event_tx,
            next_connection_id: AtomicU64::new(1),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Give up on a channel that has not opened after `timeout` and hand
    /// its job to the poll supervisor.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Subscribe to channel lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// Start tracking `job_id` over a push channel.
    ///
    /// Idempotent: a job that already has a channel gets its existing
    /// handle back. Opening happens on a spawned task, so this never
    /// fails; an open failure is logged and the job stays pending for
    /// the poll supervisor. A job that has already settled gets a handle
    /// that is closed from the start.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn track(&self, job_id: JobId, kind: JobKind) -> ConnectionHandle {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle {
            job_id: job_id.clone(),
            kind,
            connection_id,
            cancel: self.cancel.child_token(),
        };

        // Entry must exist before the sink registers the job.
        {
            let mut table = self.channels.inner.lock();
            if let Some(existing) = table.get(&job_id) {
                return existing.handle.clone();
            }
            table.insert(
                job_id.clone(),
                ManagedChannel {
                    handle: handle.clone(),
                    task: None,
                },
            );
        }

        if !self.sink.channel_connecting(&job_id, kind) {
            tracing::debug!(job_id = %job_id, "Job already settled, no channel opened");
            self.channels.release(&job_id, connection_id);
            handle.cancel.cancel();
            return handle;
        }

        if handle.is_closed() {
            tracing::debug!(job_id = %job_id, "Channel closed while registering, not opened");
            self.channels.release(&job_id, connection_id);
            self.sink.channel_lost(&job_id);
            return handle;
        }

        let ctx = ChannelContext {
            transport: Arc::clone(&self.transport),
            sink: Arc::clone(&self.sink),
            channels: self.channels.clone(),
            event_tx: self.event_tx.clone(),
            handle: handle.clone(),
            open_timeout: self.open_timeout,
        };
        let task = tokio::spawn(run_channel(ctx));
        self.channels.attach_task(&job_id, connection_id, task);

        tracing::info!(job_id = %job_id, %kind, connection_id, "Tracking job channel");
        handle
    }

    /// Close and dispose the channel for `job_id`. No-op if there is none.
    ///
    /// The job itself stays pending and is handed to the poll supervisor.
    /// To stop tracking a job altogether, cancel it through the reconciler.
    pub fn untrack(&self, job_id: &JobId) -> bool {
        let closed = self.channels.close(job_id);
        if closed {
            self.sink.channel_lost(job_id);
        }
        closed
    }

    pub fn is_tracked(&self, job_id: &JobId) -> bool {
        self.channels.contains(job_id)
    }

    /// Gracefully shut down every channel task.
    ///
    /// Cancels the master token, then waits up to `timeout` per task for
    /// a clean exit.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!(channels = self.channels.len(), "Shutting down connection hub");
        self.cancel.cancel();

        for managed in self.channels.drain() {
            managed.handle.cancel.cancel();
            if let Some(task) = managed.task {
                if tokio::time::timeout(timeout, task).await.is_err() {
                    tracing::warn!(
                        job_id = %managed.handle.job_id,
                        "Channel task did not stop in time",
                    );
                }
            }
        }

        tracing::info!("Connection hub shut down");
    }
}

/// Everything a channel task needs, moved into the task.
struct ChannelContext {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn UpdateSink>,
    channels: ChannelTable,
    event_tx: broadcast::Sender<ConnectionEvent>,
    handle: ConnectionHandle,
    open_timeout: Duration,
}

/// Channel task: open -> process frames -> release.
async fn run_channel(ctx: ChannelContext) {
    let ChannelContext {
        transport,
        sink,
        channels,
        event_tx,
        handle,
        open_timeout,
    } = ctx;
    let job_id = handle.job_id.clone();
    let connection_id = handle.connection_id;
    let cancel = handle.cancel.clone();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(job_id = %job_id, "Channel untracked before it opened");
            return;
        }
        result = tokio::time::timeout(open_timeout, transport.open(&job_id, handle.kind)) => {
            result.unwrap_or(Err(TransportError::Timeout(open_timeout)))
        }
    };

    let mut frames = match opened {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(
                job_id = %job_id,
                error = %e,
                "Failed to open job channel, falling back to polling",
            );
            if channels.release(&job_id, connection_id) {
                sink.channel_lost(&job_id);
            }
            let _ = event_tx.send(ConnectionEvent::Errored {
                job_id: job_id.clone(),
                connection_id,
                error: e.to_string(),
            });
            return;
        }
    };

    tracing::info!(job_id = %job_id, connection_id, "Job channel opened");
    sink.channel_opened(&job_id);
    let _ = event_tx.send(ConnectionEvent::Opened {
        job_id: job_id.clone(),
        connection_id,
    });

    let exit = process_frames(&mut frames, &job_id, sink.as_ref(), &cancel).await;

    let closed = |reason| ConnectionEvent::Closed {
        job_id: job_id.clone(),
        connection_id,
        reason,
    };

    match exit {
        ChannelExit::Settled => {
            // The hub untracks on its own once the job settles.
            channels.release(&job_id, connection_id);
            cancel.cancel();
            tracing::info!(job_id = %job_id, connection_id, "Job settled, channel closed");
            let _ = event_tx.send(closed(CloseReason::Settled));
        }
        ChannelExit::Cancelled => {
            tracing::info!(job_id = %job_id, connection_id, "Job channel closed");
            let _ = event_tx.send(closed(CloseReason::Untracked));
        }
        ChannelExit::RemoteClosed => {
            tracing::warn!(
                job_id = %job_id,
                connection_id,
                "Job channel closed by remote while pending",
            );
            if channels.release(&job_id, connection_id) {
                sink.channel_lost(&job_id);
            }
            let _ = event_tx.send(closed(CloseReason::RemoteClosed));
        }
        ChannelExit::Errored(e) => {
            tracing::warn!(job_id = %job_id, connection_id, error = %e, "Job channel failed");
            if channels.release(&job_id, connection_id) {
                sink.channel_lost(&job_id);
            }
            let _ = event_tx.send(ConnectionEvent::Errored {
                job_id: job_id.clone(),
                connection_id,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::StreamExt;
    use jobsync_core::JobStatus;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::client::FrameStream;

    /// Transport whose channels are fed by the test through mpsc senders.
    #[derive(Default)]
    struct ScriptedTransport {
        opens: AtomicUsize,
        fail: bool,
        senders: Mutex<Vec<mpsc::UnboundedSender<Result<String, TransportError>>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _job_id: &JobId, _kind: JobKind) -> Result<FrameStream, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Connection("refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().push(tx);
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        delivered: Mutex<Vec<UpdateEvent>>,
        opened: AtomicUsize,
        lost: AtomicUsize,
    }

    impl UpdateSink for CountingSink {
        fn deliver(&self, event: UpdateEvent) -> ReconcileOutcome {
            self.delivered.lock().push(event);
            ReconcileOutcome::Applied
        }

        fn channel_connecting(&self, _job_id: &JobId, _kind: JobKind) -> bool {
            true
        }

        fn channel_opened(&self, _job_id: &JobId) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn channel_lost(&self, _job_id: &JobId) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn track_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::default());
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(transport.clone(), sink, ChannelTable::new());
        let mut events = hub.subscribe();

        let first = hub.track(JobId::new("a"), JobKind::ImageGeneration);
        let second = hub.track(JobId::new("a"), JobKind::ImageGeneration);

        assert_eq!(first.connection_id(), second.connection_id());
        assert_matches!(next_event(&mut events).await, ConnectionEvent::Opened { .. });
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(hub.channels().len(), 1);
    }

    #[tokio::test]
    async fn terminal_message_untracks_channel() {
        let transport = Arc::new(ScriptedTransport::default());
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(transport.clone(), sink.clone(), ChannelTable::new());
        let mut events = hub.subscribe();

        let handle = hub.track(JobId::new("a"), JobKind::ImageGeneration);
        assert_matches!(next_event(&mut events).await, ConnectionEvent::Opened { .. });

        let tx = transport.senders.lock()[0].clone();
        tx.send(Ok(
            r#"{"type":"job_completed","data":{"job_id":"a","kind":"image-generation","result":"url"}}"#
                .to_string(),
        ))
        .unwrap();

        assert_matches!(
            next_event(&mut events).await,
            ConnectionEvent::Closed { reason: CloseReason::Settled, .. }
        );
        assert!(handle.is_closed());
        assert!(!hub.is_tracked(&JobId::new("a")));
        assert_eq!(sink.delivered.lock()[0].status, JobStatus::Completed);
        assert_eq!(sink.lost.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_failure_reports_channel_lost() {
        let transport = Arc::new(ScriptedTransport {
            fail: true,
            ..Default::default()
        });
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(transport, sink.clone(), ChannelTable::new());
        let mut events = hub.subscribe();

        hub.track(JobId::new("c"), JobKind::Video);

        assert_matches!(next_event(&mut events).await, ConnectionEvent::Errored { .. });
        assert_eq!(sink.lost.load(Ordering::SeqCst), 1);
        assert!(!hub.is_tracked(&JobId::new("c")));
    }

    #[tokio::test]
    async fn untrack_closes_channel_and_hands_job_to_polling() {
        let transport = Arc::new(ScriptedTransport::default());
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(transport, sink.clone(), ChannelTable::new());
        let mut events = hub.subscribe();

        let handle = hub.track(JobId::new("a"), JobKind::Voiceover);
        assert_matches!(next_event(&mut events).await, ConnectionEvent::Opened { .. });

        assert!(hub.untrack(&JobId::new("a")));
        assert!(!hub.untrack(&JobId::new("a")));
        assert!(!hub.untrack(&JobId::new("never-tracked")));

        assert_matches!(
            next_event(&mut events).await,
            ConnectionEvent::Closed { reason: CloseReason::Untracked, .. }
        );
        assert!(handle.is_closed());
        assert_eq!(sink.lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_close_hands_job_to_polling() {
        let transport = Arc::new(ScriptedTransport::default());
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(transport.clone(), sink.clone(), ChannelTable::new());
        let mut events = hub.subscribe();

        hub.track(JobId::new("a"), JobKind::Video);
        assert_matches!(next_event(&mut events).await, ConnectionEvent::Opened { .. });

        transport.senders.lock().clear();

        assert_matches!(
            next_event(&mut events).await,
            ConnectionEvent::Closed { reason: CloseReason::RemoteClosed, .. }
        );
        assert_eq!(sink.lost.load(Ordering::SeqCst), 1);
        assert!(sink.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_every_channel() {
        let transport = Arc::new(ScriptedTransport::default());
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(transport, sink, ChannelTable::new());

        let a = hub.track(JobId::new("a"), JobKind::Video);
        let b = hub.track(JobId::new("b"), JobKind::Video);
        hub.shutdown(Duration::from_secs(1)).await;

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(hub.channels().is_empty());
    }

    /// Transport whose handshake never completes.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn open(&self, _job_id: &JobId, _kind: JobKind) -> Result<FrameStream, TransportError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_open_times_out_and_reports_channel_lost() {
        let sink = Arc::new(CountingSink::default());
        let hub = ConnectionHub::new(Arc::new(StalledTransport), sink.clone(), ChannelTable::new())
            .with_open_timeout(Duration::from_millis(50));
        let mut events = hub.subscribe();

        hub.track(JobId::new("h"), JobKind::ImageGeneration);

        assert_matches!(
            next_event(&mut events).await,
            ConnectionEvent::Errored { error, .. } if error.contains("timed out")
        );
        assert_eq!(sink.lost.load(Ordering::SeqCst), 1);
        assert!(!hub.is_tracked(&JobId::new("h")));
    }

    /// Sink that closes the job's table entry while registering it, as a
    /// settle or cancel running on another task would.
    struct SettlingSink {
        channels: ChannelTable,
        lost: AtomicUsize,
    }

    impl UpdateSink for SettlingSink {
        fn deliver(&self, _event: UpdateEvent) -> ReconcileOutcome {
            ReconcileOutcome::Applied
        }

        fn channel_connecting(&self, job_id: &JobId, _kind: JobKind) -> bool {
            self.channels.close(job_id);
            true
        }

        fn channel_opened(&self, _job_id: &JobId) {}

        fn channel_lost(&self, _job_id: &JobId) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_during_registration_opens_no_channel() {
        let transport = Arc::new(ScriptedTransport::default());
        let channels = ChannelTable::new();
        let sink = Arc::new(SettlingSink {
            channels: channels.clone(),
            lost: AtomicUsize::new(0),
        });
        let hub = ConnectionHub::new(transport.clone(), sink.clone(), channels);

        let handle = hub.track(JobId::new("j"), JobKind::Video);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_closed());
        assert!(!hub.is_tracked(&JobId::new("j")));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
        assert_eq!(sink.lost.load(Ordering::SeqCst), 1);
    }
}
