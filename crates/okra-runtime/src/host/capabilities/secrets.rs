//! `secrets` capability: a read-only key lookup over the map injected at
//! deploy time via [`crate::config::HostApiConfig::secrets`]. Values are
//! never logged and never listed — only `get` is exposed.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_key_charset, invalid_params},
    },
};

pub struct SecretsCapability {
    secrets: HashMap<String, String>,
}

impl SecretsCapability {
    #[must_use]
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl Capability for SecretsCapability {
    fn name(&self) -> &'static str {
        "secrets"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params.get("key").and_then(Value::as_str).map(ToString::to_string)
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        if method != "get" {
            return Err(invalid_params(format!("unknown secrets verb `{method}`")));
        }
        let key = params
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("`key` is required"))?;
        check_key_charset(key)?;
        Ok(json!({ "value": self.secrets.get(key) }).into())
    }
}
