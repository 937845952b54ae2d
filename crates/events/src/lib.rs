//! Settlement notifications for tracked jobs.
//!
//! - [`SettlementBus`] -- in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, carrying every job that reaches a terminal
//!   status.

pub mod bus;

pub use bus::SettlementBus;
