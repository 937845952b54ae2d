//! Push-channel message classification.
//!
//! Job channels send JSON frames shaped `{"type": "<kind>", "data": {...}}`
//! where the type is one of the [`job_events`](crate::job_events)
//! constants. [`classify`] turns a raw frame into an [`UpdateEvent`]
//! without touching any state.

use serde::Deserialize;

use crate::job::{normalize_percent, JobKind, JobStatus, UpdateEvent, UpdateOrigin};
use crate::job_events::{
    MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED, MSG_TYPE_JOB_PROGRESS, MSG_TYPE_JOB_QUEUED,
};
use crate::types::{JobId, Timestamp};

/// Outer frame shape shared by every message type.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Fields a job frame may carry. Which ones matter depends on the type.
#[derive(Debug, Deserialize)]
struct JobPayload {
    job_id: JobId,
    kind: String,
    /// Percentage, possibly fractional.
    #[serde(default)]
    progress: Option<f64>,
    /// Step-based progress (`value` of `max`), sent by long-running
    /// sampler-style jobs instead of a percentage.
    #[serde(default)]
    value: Option<u32>,
    #[serde(default)]
    max: Option<u32>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    submitted_at: Option<Timestamp>,
}

/// Why a frame could not be classified. Always non-fatal to the channel.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The frame is not valid JSON or lacks required fields.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `type` field names no known message.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// The payload names no known job kind.
    #[error("Unknown job kind: {0}")]
    UnknownKind(String),
}

/// Classify a raw channel frame into a typed update.
pub fn classify(raw: &str) -> Result<UpdateEvent, ParseError> {
    let envelope: Envelope = serde_json::from_str(raw)?;

    let status = match envelope.msg_type.as_str() {
        MSG_TYPE_JOB_QUEUED => JobStatus::Queued,
        MSG_TYPE_JOB_PROGRESS => JobStatus::InProgress,
        MSG_TYPE_JOB_COMPLETED => JobStatus::Completed,
        MSG_TYPE_JOB_FAILED => JobStatus::Failed,
        other => return Err(ParseError::UnknownType(other.to_string())),
    };

    let payload: JobPayload = serde_json::from_value(envelope.data)?;
    let kind: JobKind = payload
        .kind
        .parse()
        .map_err(|_| ParseError::UnknownKind(payload.kind.clone()))?;

    let progress = progress_percent(&payload);
    let mut event = UpdateEvent::new(payload.job_id, kind, status, UpdateOrigin::Push);
    event.progress = progress;
    event.submitted_at = payload.submitted_at;
    match status {
        JobStatus::Completed => event.result = payload.result,
        JobStatus::Failed => event.error = payload.error,
        _ => {}
    }

    Ok(event)
}

/// Classify a frame received on the channel bound to `bound`.
///
/// The payload's own job id wins when it disagrees with the channel
/// binding; the disagreement is logged so a stale channel shows up in
/// diagnostics.
pub fn classify_on_channel(raw: &str, bound: &JobId) -> Result<UpdateEvent, ParseError> {
    let event = classify(raw)?;
    if &event.job_id != bound {
        tracing::warn!(
            channel_job_id = %bound,
            message_job_id = %event.job_id,
            "Message job id does not match channel binding",
        );
    }
    Ok(event)
}

fn progress_percent(payload: &JobPayload) -> Option<u8> {
    if let Some(percent) = payload.progress.and_then(normalize_percent) {
        return Some(percent);
    }
    match (payload.value, payload.max) {
        (Some(value), Some(max)) if max > 0 => {
            let percent = (value.min(max) as f64 / max as f64) * 100.0;
            Some(percent as u8)
        }
        _ => None,
    }
}
