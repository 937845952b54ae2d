//! Push-channel and REST plumbing for job status tracking.
//!
//! Provides the [`Transport`](client::Transport) seam with a WebSocket
//! implementation, the [`JobService`](api::JobService) seam with a
//! reqwest implementation, the per-channel frame loop, and the
//! [`ConnectionHub`](hub::ConnectionHub) that owns one channel per
//! tracked job.

pub mod api;
pub mod client;
pub mod events;
pub mod hub;
pub mod processor;

pub use api::{FetchError, HttpJobService, JobService};
pub use client::{FrameStream, Transport, TransportError, WsTransport};
pub use events::{CloseReason, ConnectionEvent};
pub use hub::{ChannelTable, ConnectionHandle, ConnectionHub, UpdateSink};
