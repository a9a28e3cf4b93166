//! `fleetlink-kernel` – correlation and regulation.
//!
//! Everything here is in-memory state shared between the dispatch path and
//! the telemetry path.  Each structure owns its own lock; nothing in this
//! crate performs I/O.
//!
//! # Modules
//!
//! - [`pending`] – [`PendingCommands`][pending::PendingCommands]: outstanding
//!   commands keyed by correlation key, settled from device telemetry.
//! - [`evaluator`] – folds a batch of action states into a
//!   [`Verdict`][fleetlink_types::Verdict].
//! - [`status_cache`] – [`StatusCache`][status_cache::StatusCache]: change
//!   detection with a heartbeat and a TTL sweep.
//! - [`rate_limiter`] – [`RateLimiter`][rate_limiter::RateLimiter]: per-key
//!   minimum send interval with a burst override.

pub mod evaluator;
pub mod pending;
pub mod rate_limiter;
pub mod status_cache;

pub use evaluator::{evaluate, failure_reason};
pub use pending::{PendingCommand, PendingCommands, Settlement};
pub use rate_limiter::RateLimiter;
pub use status_cache::StatusCache;
