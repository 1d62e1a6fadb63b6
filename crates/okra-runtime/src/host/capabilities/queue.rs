//! `queue` capability: an in-process topic broker over
//! `tokio::sync::broadcast` (§4.4). `subscribe` opens a server-side
//! iterator via [`crate::host::iterator::IteratorTable`]; `publish` fans
//! out to every live subscriber of the topic. `ack`/`nack` are accepted as
//! no-ops — this in-process broker has no redelivery to acknowledge
//! against, but the verbs exist so a guest written against a durable queue
//! backend still round-trips.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::Result,
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_size_limit, invalid_params},
    },
};

const MAX_PAYLOAD_BYTES: usize = 256 * 1024;
const CHANNEL_CAPACITY: usize = 256;
const TOPIC_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.-";

fn check_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || !topic.chars().all(|c| TOPIC_CHARSET.contains(c)) {
        Err(invalid_params(format!("invalid topic `{topic}`")))
    } else {
        Ok(())
    }
}

pub struct QueueCapability {
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl Default for QueueCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueCapability {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Capability for QueueCapability {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params.get("topic").and_then(Value::as_str).map(ToString::to_string)
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        let topic = params
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("`topic` is required"))?;
        check_topic(topic)?;

        match method {
            "publish" => {
                let payload = params
                    .get("payload")
                    .cloned()
                    .ok_or_else(|| invalid_params("`payload` is required"))?;
                check_size_limit(payload.to_string().len(), MAX_PAYLOAD_BYTES)?;
                // No receivers is not an error: the message is simply dropped.
                let _ = self.sender_for(topic).send(payload);
                Ok(json!({}).into())
            }
            "subscribe" => {
                let rx = self.sender_for(topic).subscribe();
                let stream = BroadcastStream::new(rx).filter_map(Result::ok);
                Ok(CapabilityOutcome::Iterator(Box::pin(stream)))
            }
            "ack" | "nack" => Ok(json!({}).into()),
            other => Err(invalid_params(format!("unknown queue verb `{other}`"))),
        }
    }
}
