//! Capability trait and registry (§4.4, §9): "represent the capability set
//! as a mapping from string name to a constructor function that yields a
//! bound capability; the mediator's per-worker table materializes the
//! constructors once at instantiation, producing a fixed table of function
//! pointers."

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{Error, PolicyError, Result},
    host::{iterator::ValueStream, policy::PolicyContext},
};

/// A capability call either returns a JSON value directly or opens a
/// server-side iterator (list/subscribe verbs), in which case the registry
/// registers the stream into the calling worker's iterator table and
/// returns the iterator id as the visible result instead.
pub enum CapabilityOutcome {
    Value(Value),
    Iterator(ValueStream),
}

impl From<Value> for CapabilityOutcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// One bound capability (`state`, `http`, ...). Constructed once per
/// [`crate::config::HostApiConfig`] and shared across every worker of the
/// service (capabilities are stateless wrt any single worker; `state`,
/// `cache`, `queue`, and `schedule` hold their own interior-mutable stores).
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Executes `method` with `params`, having already passed the
    /// mediator's dynamic-policy check. Implementations still enforce
    /// their own code-level bounds (§4.4: length caps, charset, numeric
    /// bounds, ...) before touching any backing store.
    async fn call(&self, method: &str, params: Value, ctx: &PolicyContext) -> Result<CapabilityOutcome>;

    /// The resource this call addresses, used by the dynamic policy
    /// evaluator (a `state`/`cache` key, an `http` URL, a `queue` topic).
    /// `None` for verbs with no single addressable resource (e.g.
    /// `metrics.counter`, which policy does not gate by name here).
    fn resource_of(&self, _method: &str, _params: &Value) -> Option<String> {
        None
    }
}

/// Fixed, per-service table of bound capabilities built once at
/// [`crate::host::HostApiMediator`] construction time.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<&'static str, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.insert(capability.name(), capability);
        self
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Capability>> {
        self.capabilities
            .get(name)
            .ok_or_else(|| Error::Policy(PolicyError::UnknownCapability(name.to_string())))
    }
}
