//! Connection lifecycle events emitted by the hub.
//!
//! Diagnostics only: nothing in the reconciliation path consumes them.

use jobsync_core::JobId;
use serde::Serialize;

/// Why a job channel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// A terminal message arrived on the channel.
    Settled,
    /// The channel was untracked (cancellation, settlement via polling,
    /// or session shutdown).
    Untracked,
    /// The remote side closed the channel while the job was pending.
    RemoteClosed,
}

/// A lifecycle event for one job channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The channel was established.
    Opened { job_id: JobId, connection_id: u64 },

    /// The channel closed without a transport error.
    Closed {
        job_id: JobId,
        connection_id: u64,
        reason: CloseReason,
    },

    /// The channel failed to open or broke mid-stream.
    Errored {
        job_id: JobId,
        connection_id: u64,
        /// Human-readable error description.
        error: String,
    },
}

impl ConnectionEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            ConnectionEvent::Opened { job_id, .. }
            | ConnectionEvent::Closed { job_id, .. }
            | ConnectionEvent::Errored { job_id, .. } => job_id,
        }
    }
}
