//! Push-channel message type constants.
//!
//! Every frame on a job channel carries one of these in its `"type"`
//! field. Used by the [`router`](crate::router) when classifying frames.

/// Job accepted by the backend and waiting for a worker.
pub const MSG_TYPE_JOB_QUEUED: &str = "job_queued";

/// Progress update during job execution (percentage or step counts).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed with an error.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";
