//! OKRA runtime execution plane.
//!
//! This crate implements the sandboxed-WASM execution plane described in the
//! runtime design: loading a compiled service package, creating and managing
//! sandboxed instances, routing requests to them with bounded concurrency,
//! and mediating host-capability calls with policy and resource limits.
//!
//! Layering, leaves first:
//! - [`engine`] / [`worker`]: compile a `.wasm` reactor module and
//!   instantiate it into a single-tenant [`worker::Worker`].
//! - [`pool`]: bounded parallelism over workers derived from one compiled
//!   module.
//! - [`host`]: the capability surface (`state`, `http`, `log`, ...) exposed
//!   to the guest via `host_execute` / `host_next` / `host_close_iterator`.
//! - [`schema`]: the parsed schema and service package a deployment is built
//!   from.
//! - [`actor`] / [`actor_system`]: the per-service message-sequenced
//!   endpoint and the minimal actor abstraction it runs on.
//! - [`orchestrator`]: the process-wide directory of deployed actors.
//! - [`gateway`]: the thin contract wire protocols adapt to.
//!
//! Everything fallible returns [`error::Error`]; [`error::Error::code`] maps
//! any variant onto one of the stable wire [`error::ErrorCode`]s.

pub mod actor;
pub mod actor_id;
pub mod actor_system;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod host;
pub mod message;
pub mod net;
pub mod orchestrator;
pub mod pool;
pub mod schema;
pub mod worker;

pub use actor_id::ActorId;
pub use error::{Error, ErrorCode, Result};
pub use message::{HealthCheckRequest, HealthCheckResponse, ServiceRequest, ServiceResponse};
pub use orchestrator::RuntimeOrchestrator;
pub use schema::ServicePackage;
