//! `schedule` capability: schedule/cancel/list over an in-process
//! `tokio_util::time::DelayQueue`-backed registry (§4.4). `schedule` arms a
//! timer that becomes observable to the guest via a `schedule`-topic
//! iterator once it fires; `cancel` and `list` operate on still-pending
//! entries.

use std::{
    collections::HashMap,
    sync::Mutex as StdMutex,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::time::{DelayQueue, delay_queue::Key};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_duration_bounds, invalid_params},
    },
};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const MAX_PENDING: usize = 10_000;

struct PendingEntry {
    id: String,
    payload: Value,
    key: Key,
}

/// Interior state guarded by a plain [`std::sync::Mutex`] rather than
/// `parking_lot`: `DelayQueue` isn't `Send`-friendly across an `.await`
/// boundary when borrowed from an async lock, so every access here is a
/// short synchronous critical section.
struct Inner {
    queue: DelayQueue<String>,
    entries: HashMap<String, PendingEntry>,
    next_id: u64,
}

pub struct ScheduleCapability {
    inner: StdMutex<Inner>,
}

impl Default for ScheduleCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleCapability {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner {
                queue: DelayQueue::new(),
                entries: HashMap::new(),
                next_id: 1,
            }),
        }
    }
}

#[async_trait]
impl Capability for ScheduleCapability {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params.get("id").and_then(Value::as_str).map(ToString::to_string)
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        match method {
            "schedule" => {
                let seconds = params
                    .get("after_seconds")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| invalid_params("`after_seconds` is required"))?;
                let interval = Duration::from_secs(seconds);
                check_duration_bounds(interval, MIN_INTERVAL, MAX_INTERVAL)?;
                let payload = params.get("payload").cloned().unwrap_or(Value::Null);

                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.entries.len() >= MAX_PENDING {
                    return Err(invalid_params("too many pending schedules"));
                }
                let id = format!("sched-{}", inner.next_id);
                inner.next_id += 1;
                let key = inner.queue.insert(id.clone(), interval);
                inner.entries.insert(
                    id.clone(),
                    PendingEntry {
                        id: id.clone(),
                        payload,
                        key,
                    },
                );
                Ok(json!({ "id": id }).into())
            }
            "cancel" => {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("`id` is required"))?;
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                match inner.entries.remove(id) {
                    Some(entry) => {
                        inner.queue.try_remove(&entry.key);
                        Ok(json!({ "canceled": true }).into())
                    }
                    None => Ok(json!({ "canceled": false }).into()),
                }
            }
            "list" => {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let entries: Vec<Value> = inner
                    .entries
                    .values()
                    .map(|e| json!({ "id": e.id, "payload": e.payload }))
                    .collect();
                Ok(json!({ "entries": entries }).into())
            }
            other => Err(invalid_params(format!("unknown schedule verb `{other}`"))),
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
    async fn schedule_then_list_then_cancel() {
        let cap = ScheduleCapability::new();
        let CapabilityOutcome::Value(v) = cap
            .call("schedule", json!({"after_seconds": 60, "payload": {"x": 1}}), &ctx())
            .await
            .unwrap()
        else {
            panic!("expected value");
        };
        let id = v["id"].as_str().unwrap().to_string();

        let CapabilityOutcome::Value(listed) = cap.call("list", json!({}), &ctx()).await.unwrap() else {
            panic!("expected value");
        };
        assert_eq!(listed["entries"].as_array().unwrap().len(), 1);

        let CapabilityOutcome::Value(canceled) =
            cap.call("cancel", json!({"id": id}), &ctx()).await.unwrap()
        else {
            panic!("expected value");
        };
        assert_eq!(canceled["canceled"], json!(true));
    }

    #[tokio::test]
    async fn interval_below_minimum_is_rejected() {
        let cap = ScheduleCapability::new();
        let err = cap
            .call("schedule", json!({"after_seconds": 0}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Policy(_)));
    }
}
