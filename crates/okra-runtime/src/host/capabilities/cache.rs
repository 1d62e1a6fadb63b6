//! `cache` capability: a TTL-bounded in-process store (§4.4), the
//! equivalent of a `TtlCache` keyed by string with an explicit expiry per
//! entry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_duration_bounds, check_key_charset, check_size_limit, invalid_params},
    },
};

const MAX_VALUE_BYTES: usize = 256 * 1024;
const MIN_TTL: Duration = Duration::from_secs(1);
const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Default)]
pub struct CacheCapability {
    entries: DashMap<String, Entry>,
}

impl CacheCapability {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Value> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl Capability for CacheCapability {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params.get("key").and_then(Value::as_str).map(ToString::to_string)
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        match method {
            "get" => {
                let key = params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`key` is required"))?;
                check_key_charset(key)?;
                Ok(json!({ "value": self.live(key) }).into())
            }
            "set" => {
                let key = params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`key` is required"))?;
                check_key_charset(key)?;
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| invalid_params("`value` is required"))?;
                check_size_limit(value.to_string().len(), MAX_VALUE_BYTES)?;
                let ttl_secs = params.get("ttl_seconds").and_then(Value::as_u64).unwrap_or(60);
                let ttl = Duration::from_secs(ttl_secs);
                check_duration_bounds(ttl, MIN_TTL, MAX_TTL)?;
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(json!({}).into())
            }
            "delete" => {
                let key = params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`key` is required"))?;
                Ok(json!({ "deleted": self.entries.remove(key).is_some() }).into())
            }
            other => Err(invalid_params(format!("unknown cache verb `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostApiConfig;
    use serde_json::json;

    fn ctx() -> PolicyContext {
        PolicyContext::new(&HostApiConfig::new("svc", "default"), None)
    }

    #[tokio::test]
    async fn set_then_get_within_ttl() {
        let cap = CacheCapability::new();
        cap.call("set", json!({"key": "a", "value": 1, "ttl_seconds": 60}), &ctx())
            .await
            .unwrap();
        let CapabilityOutcome::Value(v) = cap.call("get", json!({"key": "a"}), &ctx()).await.unwrap()
        else {
            panic!("expected value");
        };
        assert_eq!(v["value"], json!(1));
    }

    #[tokio::test]
    async fn ttl_below_minimum_is_rejected() {
        let cap = CacheCapability::new();
        let err = cap
            .call("set", json!({"key": "a", "value": 1, "ttl_seconds": 0}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Policy(_)));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cap = CacheCapability::new();
        cap.call("set", json!({"key": "a", "value": 1, "ttl_seconds": 1}), &ctx())
            .await
            .unwrap();
        cap.entries.get_mut("a").unwrap().expires_at = Instant::now() - Duration::from_secs(1);
        let CapabilityOutcome::Value(v) = cap.call("get", json!({"key": "a"}), &ctx()).await.unwrap()
        else {
            panic!("expected value");
        };
        assert_eq!(v["value"], Value::Null);
    }
}
