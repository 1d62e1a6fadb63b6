//! Concrete capability implementations (§4.4). Each module owns its own
//! backing store and code-level bounds; dynamic policy and rate limiting
//! are applied once, uniformly, by [`crate::host::HostApiMediator`] before
//! any of these are called.

pub mod cache;
pub mod env;
pub mod http;
pub mod log;
pub mod metrics;
pub mod queue;
pub mod schedule;
pub mod secrets;
pub mod sql;
pub mod state;
pub mod workflow;
