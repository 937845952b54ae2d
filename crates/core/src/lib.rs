//! Domain types and pure reconciliation logic for job status tracking.
//!
//! Nothing in this crate performs I/O. The transport and sync crates
//! build on these types:
//!
//! - [`job`] -- the `Job` record, its kind/status enums, and the
//!   `UpdateEvent` value every update path produces.
//! - [`router`] -- classification of raw push-channel payloads.
//! - [`registry`] -- the in-memory job registry and its forward-only
//!   transition rules.

pub mod job;
pub mod job_events;
pub mod registry;
pub mod router;
pub mod types;

pub use job::{Job, JobKind, JobSnapshot, JobStatus, UpdateEvent, UpdateOrigin};
pub use registry::{JobRegistry, ReconcileOutcome};
pub use types::{JobId, Timestamp};
