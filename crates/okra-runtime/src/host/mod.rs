//! Host API mediator (§4.4): the capability registry, dynamic policy, and
//! rate limiter bound once per deployed service ([`HostApiMediator`]), wrapped
//! per worker with that worker's own iterator table ([`HostApiSet`]) since
//! iterators never cross worker boundaries.

pub mod capabilities;
mod capability;
mod iterator;
mod policy;

pub use capability::{Capability, CapabilityOutcome, CapabilityRegistry};
pub use iterator::IteratorTable;
pub use policy::{
    AllowAllPolicy, AllowListPolicy, DynamicPolicy, PolicyContext, RateLimiter,
    check_duration_bounds, check_key_charset, check_size_limit, invalid_params,
    reject_reserved_prefix,
};

use std::sync::Arc;

use serde_json::{Value, json};

use crate::{
    config::HostApiConfig,
    error::{Error, Result},
};

/// Shared, per-service mediator: one instance backs every worker of a
/// deployed service (capabilities are bound once at service-instantiation
/// time and shared across its whole pool).
pub struct HostApiMediator {
    config: HostApiConfig,
    registry: CapabilityRegistry,
    policy: Box<dyn DynamicPolicy>,
    rate_limiter: RateLimiter,
}

impl HostApiMediator {
    #[must_use]
    pub fn new(config: HostApiConfig, registry: CapabilityRegistry) -> Self {
        Self {
            config,
            registry,
            policy: Box::new(AllowAllPolicy),
            rate_limiter: RateLimiter::unlimited(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: impl DynamicPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn config(&self) -> &HostApiConfig {
        &self.config
    }

    async fn dispatch(&self, capability: &str, method: &str, params: Value) -> Result<CapabilityOutcome> {
        let cap = self.registry.get(capability)?;
        let resource = cap.resource_of(method, &params);
        let ctx = PolicyContext::new(&self.config, resource);
        self.policy.check(capability, method, &ctx)?;
        self.rate_limiter
            .check(&format!("{}:{capability}", self.config.service_name))?;
        cap.call(method, params, &ctx).await
    }
}

/// Per-worker host API surface bound into that worker's `WorkerState`: the
/// shared mediator plus this worker's own iterator table. Dropped (and its
/// iterators closed) whenever the owning worker closes.
pub struct HostApiSet {
    mediator: Arc<HostApiMediator>,
    iterators: IteratorTable,
}

impl HostApiSet {
    #[must_use]
    pub fn new(mediator: Arc<HostApiMediator>) -> Self {
        Self {
            mediator,
            iterators: IteratorTable::new(),
        }
    }

    /// Executes one `capability.method(params)` call and returns the JSON
    /// envelope the guest sees over `host_execute`: `{"ok": value}` on
    /// success (an opened iterator is represented as `{"ok": {"iterator":
    /// id}}`), `{"error": {"code", "message"}}` on failure. Never panics;
    /// a denied or malformed call is guest-observable, not a host fault.
    pub async fn execute(&self, capability: &str, method: &str, params: Value) -> Value {
        match self.mediator.dispatch(capability, method, params).await {
            Ok(CapabilityOutcome::Value(value)) => json!({ "ok": value }),
            Ok(CapabilityOutcome::Iterator(stream)) => {
                let id = self.iterators.register(stream);
                json!({ "ok": { "iterator": id } })
            }
            Err(e) => error_envelope(&e),
        }
    }

    /// Advances iterator `iterator_id`, returning `{"ok": {"value", "has_more"}}`
    /// or an error envelope.
    pub async fn next(&self, iterator_id: &str) -> Value {
        match self.iterators.next(iterator_id).await {
            Ok((value, has_more)) => json!({ "ok": { "value": value, "has_more": has_more } }),
            Err(e) => error_envelope(&e),
        }
    }

    pub fn close_iterator(&self, iterator_id: &str) -> Value {
        match self.iterators.close(iterator_id) {
            Ok(()) => json!({ "ok": {} }),
            Err(e) => error_envelope(&e),
        }
    }

    /// Closes iterators idle longer than the configured threshold. Called
    /// from a periodic sweep owned by the worker pool.
    pub fn sweep_idle_iterators(&self) {
        self.iterators
            .sweep(self.mediator.config().iterator_idle_timeout);
    }

    /// Closes every open iterator. Called when the owning worker closes.
    pub fn close(&self) {
        self.iterators.close_all();
    }
}

fn error_envelope(err: &Error) -> Value {
    json!({ "error": { "code": err.code().to_string(), "message": err.to_string() } })
}
