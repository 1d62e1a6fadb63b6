//! Wire-agnostic request/response envelopes passed between a
//! [`crate::gateway::Gateway`] and a [`crate::actor::ServiceActor`] (§3, §6).

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use rand::Rng;

use crate::error::ErrorCode;

fn generate_id() -> String {
    let mut rng = rand::rng();
    let bits: u64 = rng.random();
    format!("{bits:016x}")
}

/// One call into a deployed service. `input` is the method's JSON-encoded
/// argument; empty for methods whose [`crate::schema::MethodDescriptor`]
/// does not require input. `timeout`, when set and non-zero, overrides the
/// actor's default invoke deadline for this call only (§4.5 step 3).
#[derive(Clone, Debug)]
pub struct ServiceRequest {
    pub id: String,
    pub method: String,
    pub input: Bytes,
    pub metadata: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ServiceRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, input: impl Into<Bytes>) -> Self {
        Self {
            id: generate_id(),
            method: method.into(),
            input: input.into(),
            metadata: HashMap::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get("correlation_id").map(String::as_str)
    }
}

/// The structured error half of a failed [`ServiceResponse`].
#[derive(Clone, Debug)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
}

/// Always carries the originating request's id and the wall-clock duration
/// spent inside the actor (§8: "the response id equals the request id, and
/// the response duration is ≥ the wall-clock elapsed within the actor").
#[derive(Clone, Debug)]
pub struct ServiceResponse {
    pub id: String,
    pub success: bool,
    pub output: Bytes,
    pub error: Option<ResponseError>,
    pub metadata: HashMap<String, String>,
    pub duration: Duration,
}

impl ServiceResponse {
    #[must_use]
    pub fn success(
        id: impl Into<String>,
        output: impl Into<Bytes>,
        metadata: HashMap<String, String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            success: true,
            output: output.into(),
            error: None,
            metadata,
            duration,
        }
    }

    #[must_use]
    pub fn failure(
        id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        metadata: HashMap<String, String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            success: false,
            output: Bytes::new(),
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
            metadata,
            duration,
        }
    }
}

/// `HealthCheck{ping}` request (§4.5).
#[derive(Clone, Debug)]
pub struct HealthCheckRequest {
    pub ping: String,
}

/// `{pong, ready}` response, extended with an `active_workers` gauge for
/// observability.
#[derive(Clone, Debug)]
pub struct HealthCheckResponse {
    pub pong: String,
    pub ready: bool,
    pub active_workers: usize,
}
