//! `workflow` capability: run/signal/query/cancel over an in-process
//! durable-step registry (§4.4), a small state machine keyed by workflow
//! id layered on the same [`dashmap`] primitive the `state` capability
//! uses. This is the in-process stand-in for a durable execution engine —
//! steps and signals are recorded, not actually resumed across process
//! restarts.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_size_limit, invalid_params},
    },
};

const MAX_STEPS: usize = 1_000;
const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Status {
    Running,
    Canceled,
}

struct WorkflowState {
    status: Status,
    steps: Vec<Value>,
    signals: Vec<Value>,
}

pub struct WorkflowCapability {
    workflows: DashMap<String, WorkflowState>,
    next_id: AtomicU64,
}

impl Default for WorkflowCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowCapability {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Capability for WorkflowCapability {
    fn name(&self) -> &'static str {
        "workflow"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params.get("id").and_then(Value::as_str).map(ToString::to_string)
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        match method {
            "run" => {
                let step = params.get("step").cloned().unwrap_or(Value::Null);
                check_size_limit(step.to_string().len(), MAX_PAYLOAD_BYTES)?;
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| {
                        format!("wf-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
                    });

                let mut entry = self.workflows.entry(id.clone()).or_insert_with(|| WorkflowState {
                    status: Status::Running,
                    steps: Vec::new(),
                    signals: Vec::new(),
                });
                if entry.status == Status::Canceled {
                    return Err(invalid_params(format!("workflow `{id}` is canceled")));
                }
                if entry.steps.len() >= MAX_STEPS {
                    return Err(invalid_params("workflow exceeded the maximum step count"));
                }
                entry.steps.push(step);
                Ok(json!({ "id": id, "step_count": entry.steps.len() }).into())
            }
            "signal" => {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`id` is required"))?;
                let signal = params.get("signal").cloned().unwrap_or(Value::Null);
                let mut entry = self
                    .workflows
                    .get_mut(id)
                    .ok_or_else(|| invalid_params(format!("unknown workflow `{id}`")))?;
                entry.signals.push(signal);
                Ok(json!({}).into())
            }
            "query" => {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`id` is required"))?;
                let entry = self
                    .workflows
                    .get(id)
                    .ok_or_else(|| invalid_params(format!("unknown workflow `{id}`")))?;
                Ok(json!({
                    "status": if entry.status == Status::Running { "running" } else { "canceled" },
                    "steps": entry.steps,
                    "signals": entry.signals,
                })
                .into())
            }
            "cancel" => {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`id` is required"))?;
                let mut entry = self
                    .workflows
                    .get_mut(id)
                    .ok_or_else(|| invalid_params(format!("unknown workflow `{id}`")))?;
                entry.status = Status::Canceled;
                Ok(json!({}).into())
            }
            other => Err(invalid_params(format!("unknown workflow verb `{other}`"))),
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
    async fn run_then_query_accumulates_steps() {
        let cap = WorkflowCapability::new();
        let CapabilityOutcome::Value(v) =
            cap.call("run", json!({"id": "wf-1", "step": {"a": 1}}), &ctx())
                .await
                .unwrap()
        else {
            panic!("expected value");
        };
        assert_eq!(v["step_count"], json!(1));

        let CapabilityOutcome::Value(q) = cap.call("query", json!({"id": "wf-1"}), &ctx()).await.unwrap()
        else {
            panic!("expected value");
        };
        assert_eq!(q["steps"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn canceled_workflow_rejects_further_steps() {
        let cap = WorkflowCapability::new();
        cap.call("run", json!({"id": "wf-1", "step": {}}), &ctx())
            .await
            .unwrap();
        cap.call("cancel", json!({"id": "wf-1"}), &ctx()).await.unwrap();
        let err = cap
            .call("run", json!({"id": "wf-1", "step": {}}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Policy(_)));
    }
}
