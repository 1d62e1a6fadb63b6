//! `env` capability: get/list over the environment map injected at deploy
//! time (§4.4, §6). Never reads the process environment directly — only
//! what the deployer explicitly populated in
//! [`crate::config::HostApiConfig::env`].

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

pub struct EnvCapability {
    env: HashMap<String, String>,
}

impl EnvCapability {
    #[must_use]
    pub fn new(env: HashMap<String, String>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Capability for EnvCapability {
    fn name(&self) -> &'static str {
        "env"
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
                Ok(json!({ "value": self.env.get(key) }).into())
            }
            "list" => Ok(json!({ "keys": self.env.keys().collect::<Vec<_>>() }).into()),
            other => Err(invalid_params(format!("unknown env verb `{other}`"))),
        }
    }
}
