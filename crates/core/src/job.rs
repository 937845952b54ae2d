//! The tracked job record and the update values that drive it.
//!
//! Every update path (push channel, poll fetch, session discovery)
//! produces an [`UpdateEvent`]. Events are plain values: building one has
//! no effect until it is applied to a
//! [`JobRegistry`](crate::registry::JobRegistry).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// Category of generation work. Selects the channel and poll endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ImageGeneration,
    ModelTraining,
    Voiceover,
    Video,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ImageGeneration,
        JobKind::ModelTraining,
        JobKind::Voiceover,
        JobKind::Video,
    ];

    /// Wire name, e.g. `"image-generation"`.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ImageGeneration => "image-generation",
            JobKind::ModelTraining => "model-training",
            JobKind::Voiceover => "voiceover",
            JobKind::Video => "video",
        }
    }

    /// URL path segment used by the REST and channel endpoints.
    pub fn endpoint(self) -> &'static str {
        match self {
            JobKind::ImageGeneration => "images",
            JobKind::ModelTraining => "trainings",
            JobKind::Voiceover => "voiceovers",
            JobKind::Video => "videos",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known [`JobKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.endpoint() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status. Transitions only move forward:
/// `Queued -> InProgress -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// Position in the forward-only lifecycle. Both terminal statuses
    /// share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::InProgress => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in-progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// UpdateEvent
// ---------------------------------------------------------------------------

/// Which path produced an update. Diagnostic only; reconciliation
/// treats every origin identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    Push,
    Poll,
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateOrigin::Push => "push",
            UpdateOrigin::Poll => "poll",
        })
    }
}

/// A typed status update for one job.
///
/// Constructed via [`UpdateEvent::new`] and enriched with the builder
/// methods [`with_progress`](UpdateEvent::with_progress),
/// [`with_result`](UpdateEvent::with_result) and
/// [`with_error`](UpdateEvent::with_error).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Advisory completion percentage (0-100).
    pub progress: Option<u8>,
    /// Kind-specific completion payload. Only meaningful when completed.
    pub result: Option<serde_json::Value>,
    /// Human-readable failure reason. Only meaningful when failed.
    pub error: Option<String>,
    /// Server-side submission time, when the payload carries one.
    pub submitted_at: Option<Timestamp>,
    pub origin: UpdateOrigin,
}

impl UpdateEvent {
    pub fn new(job_id: JobId, kind: JobKind, status: JobStatus, origin: UpdateOrigin) -> Self {
        Self {
            job_id,
            kind,
            status,
            progress: None,
            result: None,
            error: None,
            submitted_at: None,
            origin,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_submitted_at(mut self, at: Timestamp) -> Self {
        self.submitted_at = Some(at);
        self
    }
}

// ---------------------------------------------------------------------------
// JobSnapshot
// ---------------------------------------------------------------------------

/// Authoritative job state as returned by the status fetch endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Reported as any JSON number; normalized to 0-100 on read.
    #[serde(default, deserialize_with = "deserialize_percent")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<Timestamp>,
}

/// Clamp a reported percentage into 0-100 and round it.
///
/// Shared by the push and poll paths. Non-finite values yield `None`.
pub fn normalize_percent(value: f64) -> Option<u8> {
    value
        .is_finite()
        .then(|| value.clamp(0.0, 100.0).round() as u8)
}

fn deserialize_percent<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<f64> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(normalize_percent))
}

impl From<JobSnapshot> for UpdateEvent {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            job_id: snapshot.id,
            kind: snapshot.kind,
            status: snapshot.status,
            progress: snapshot.progress.map(|p| p.min(100)),
            result: snapshot.result,
            error: snapshot.error,
            submitted_at: snapshot.submitted_at,
            origin: UpdateOrigin::Poll,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One tracked job as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub submitted_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// A freshly submitted job that has not reported any status yet.
    pub fn queued(id: JobId, kind: JobKind, now: Timestamp) -> Self {
        Self {
            id,
            kind,
            status: JobStatus::Queued,
            progress: None,
            result: None,
            error: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Resulting media URL, for kinds whose completion payload carries one.
    pub fn media_url(&self) -> Option<&str> {
        let result = self.result.as_ref()?;
        match result {
            serde_json::Value::String(url) => Some(url.as_str()),
            serde_json::Value::Object(map) => ["url", "media_url", "audio_url", "video_url"]
                .iter()
                .find_map(|key| map.get(*key).and_then(|v| v.as_str())),
            _ => None,
        }
    }
}
