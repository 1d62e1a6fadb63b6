//! `log` capability: guest-emitted structured log lines, forwarded to
//! `tracing` under the service's `log.context`/`log.output` fields (§4.4).

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_size_limit, invalid_params},
    },
};

const MAX_MESSAGE_BYTES: usize = 16 * 1024;

pub struct LogCapability {
    service_name: String,
}

impl LogCapability {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl Capability for LogCapability {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("`message` is required"))?;
        check_size_limit(message.len(), MAX_MESSAGE_BYTES)?;
        let fields = params.get("fields").cloned().unwrap_or(Value::Null);

        match method {
            "debug" => debug!(service = %self.service_name, %fields, "{message}"),
            "info" | "emit" => info!(service = %self.service_name, %fields, "{message}"),
            "warn" => warn!(service = %self.service_name, %fields, "{message}"),
            "error" => error!(service = %self.service_name, %fields, "{message}"),
            other => return Err(invalid_params(format!("unknown log level `{other}`"))),
        }

        Ok(json!({}).into())
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
    async fn emits_at_each_level() {
        let cap = LogCapability::new("svc");
        for level in ["debug", "info", "warn", "error", "emit"] {
            cap.call(level, json!({"message": "hi"}), &ctx()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let cap = LogCapability::new("svc");
        let huge = "x".repeat(32 * 1024);
        let err = cap
            .call("info", json!({"message": huge}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Policy(_)));
    }
}
