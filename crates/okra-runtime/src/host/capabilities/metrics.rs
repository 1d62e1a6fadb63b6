//! `metrics` capability: counter/gauge/histogram/timer, forwarded to the
//! `metrics` facade crate (already part of the teacher's workspace
//! dependencies) so any exporter wired up by the embedding process picks
//! them up transparently (§4.4).

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, invalid_params},
    },
};

const MAX_LABELS: usize = 16;
const NAME_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.";

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| NAME_CHARSET.contains(c)) {
        Err(invalid_params(format!("invalid metric name `{name}`")))
    } else {
        Ok(())
    }
}

fn labels_of(params: &Value) -> Result<Vec<(String, String)>> {
    let Some(obj) = params.get("labels").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    if obj.len() > MAX_LABELS {
        return Err(invalid_params(format!("too many labels ({} > {MAX_LABELS})", obj.len())));
    }
    obj.iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|v| (k.clone(), v.to_string()))
                .ok_or_else(|| invalid_params(format!("label `{k}` must be a string")))
        })
        .collect()
}

#[derive(Default)]
pub struct MetricsCapability;

impl MetricsCapability {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Capability for MetricsCapability {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("`name` is required"))?
            .to_string();
        check_name(&name)?;
        let labels = labels_of(&params)?;
        let value = params.get("value").and_then(Value::as_f64).unwrap_or(1.0);
        let dynamic_labels: Vec<metrics::Label> = labels
            .into_iter()
            .map(|(k, v)| metrics::Label::new(k, v))
            .collect();

        match method {
            "counter" => metrics::counter!(name, dynamic_labels).increment(value as u64),
            "gauge" => metrics::gauge!(name, dynamic_labels).set(value),
            "histogram" | "timer" => metrics::histogram!(name, dynamic_labels).record(value),
            other => return Err(invalid_params(format!("unknown metrics verb `{other}`"))),
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
    async fn records_each_metric_kind() {
        let cap = MetricsCapability::new();
        for kind in ["counter", "gauge", "histogram", "timer"] {
            cap.call(kind, json!({"name": "requests.total", "value": 1.0}), &ctx())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let cap = MetricsCapability::new();
        let err = cap
            .call("counter", json!({"name": "bad name!"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Policy(_)));
    }
}
