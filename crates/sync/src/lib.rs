//! Job status synchronization: one reconciler fed by push channels and
//! a polling fallback.
//!
//! - [`Reconciler`] -- the single entry point that applies every update
//!   to the job registry.
//! - [`PollSupervisor`] -- re-fetches jobs that have no push channel.
//! - [`SyncSession`] -- the facade presentation code talks to.
//! - [`SyncConfig`] -- environment-driven configuration.

pub mod config;
pub mod poller;
pub mod reconciler;
pub mod session;

pub use config::{ConfigError, SyncConfig};
pub use poller::{CycleReport, PollSupervisor};
pub use reconciler::Reconciler;
pub use session::{SessionError, SyncSession};
