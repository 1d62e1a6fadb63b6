//! `state` capability: get/set/delete/list over an in-process key-value
//! store (§4.4). Swappable via [`StateStore`] so a deployment can back it
//! with something durable without changing the ABI surface.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_key_charset, check_size_limit, invalid_params, reject_reserved_prefix},
    },
};

const RESERVED_PREFIXES: &[&str] = &["okra:"];
const MAX_VALUE_BYTES: usize = 256 * 1024;

pub trait StateStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn delete(&self, key: &str) -> bool;
    fn list(&self, prefix: &str) -> Vec<(String, Value)>;
}

#[derive(Default)]
pub struct InMemoryStateStore {
    entries: DashMap<String, Value>,
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn list(&self, prefix: &str) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

pub struct StateCapability<S: StateStore = InMemoryStateStore> {
    store: S,
}

impl<S: StateStore> StateCapability<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl StateCapability<InMemoryStateStore> {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(InMemoryStateStore::default())
    }
}

fn key_of(params: &Value) -> Result<String> {
    let key = params
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("`key` is required"))?;
    check_key_charset(key)?;
    reject_reserved_prefix(key, RESERVED_PREFIXES)?;
    Ok(key.to_string())
}

#[async_trait]
impl<S: StateStore> Capability for StateCapability<S> {
    fn name(&self) -> &'static str {
        "state"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params
            .get("key")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| params.get("prefix").and_then(Value::as_str).map(ToString::to_string))
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        match method {
            "get" => {
                let key = key_of(&params)?;
                Ok(json!({ "value": self.store.get(&key) }).into())
            }
            "set" => {
                let key = key_of(&params)?;
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| invalid_params("`value` is required"))?;
                check_size_limit(value.to_string().len(), MAX_VALUE_BYTES)?;
                self.store.set(&key, value);
                Ok(json!({}).into())
            }
            "delete" => {
                let key = key_of(&params)?;
                Ok(json!({ "deleted": self.store.delete(&key) }).into())
            }
            "list" => {
                let prefix = params.get("prefix").and_then(Value::as_str).unwrap_or("");
                reject_reserved_prefix(prefix, RESERVED_PREFIXES)?;
                let entries = self.store.list(prefix);
                Ok(json!({
                    "entries": entries.into_iter()
                        .map(|(k, v)| json!({ "key": k, "value": v }))
                        .collect::<Vec<_>>()
                })
                .into())
            }
            other => Err(invalid_params(format!("unknown state verb `{other}`"))),
        }
    }
}
