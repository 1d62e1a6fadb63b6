//! Gateway Contract (§4.7): the thin boundary a wire protocol (Connect,
//! GraphQL, ...) adapts to. Only the shape here belongs to the core — the
//! concrete route-to-actor-id mapping, wire framing, and status-code
//! translation are gateway-specific and live outside this crate.

use std::time::Duration;

use crate::{
    actor_id::ActorId,
    error::{Error, ErrorCode, LifecycleError, Result},
    message::{ServiceRequest, ServiceResponse},
    orchestrator::RuntimeOrchestrator,
};

/// Resolves a wire-level route (a Connect path segment, a GraphQL operation
/// name, ...) to the [`ActorId`] that should serve it. Implemented outside
/// this crate by each concrete gateway; kept as a trait here so the
/// dispatch path below is exercised against the real [`RuntimeOrchestrator`]
/// without depending on any particular wire protocol.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, route: &str) -> Option<ActorId>;
}

/// A function-backed [`RouteResolver`] for gateways that can express
/// routing as a closure rather than a standalone type.
impl<F> RouteResolver for F
where
    F: Fn(&str) -> Option<ActorId> + Send + Sync,
{
    fn resolve(&self, route: &str) -> Option<ActorId> {
        self(route)
    }
}

/// A function of the orchestrator's directory plus one `ServiceRequest` in,
/// one `ServiceResponse` out (§4.7). Holds no wire-protocol state of its
/// own; a concrete gateway wraps this in its own handler type and owns the
/// route table, the wire-level timeout, and the error-code-to-status
/// mapping.
pub struct Gateway<R> {
    orchestrator: std::sync::Arc<RuntimeOrchestrator>,
    resolver: R,
    ask_timeout: Duration,
}

impl<R: RouteResolver> Gateway<R> {
    #[must_use]
    pub fn new(orchestrator: std::sync::Arc<RuntimeOrchestrator>, resolver: R) -> Self {
        Self {
            orchestrator,
            resolver,
            ask_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    /// Resolves `route` to a deployed actor, asks it, and returns the
    /// response within `ask_timeout`. `NOT_FOUND` covers both an
    /// unresolvable route and a route that resolves to an actor id the
    /// orchestrator no longer has deployed.
    pub async fn dispatch(&self, route: &str, request: ServiceRequest) -> Result<ServiceResponse> {
        let actor_id = self
            .resolver
            .resolve(route)
            .ok_or_else(|| Error::Lifecycle(LifecycleError::NotDeployed(route.to_string())))?;

        let pid = self
            .orchestrator
            .get_actor_pid(&actor_id)
            .ok_or_else(|| Error::Lifecycle(LifecycleError::NotDeployed(actor_id.to_string())))?;

        tokio::time::timeout(self.ask_timeout, pid.ask(request)).await?
    }
}

/// Maps a stable [`ErrorCode`] onto the conventional HTTP status a gateway
/// should answer with. Gateways are free to use a different mapping (e.g.
/// Connect's own code space); this is the default one most REST/Connect
/// adapters in this repo's gateway layer reuse as-is.
#[must_use]
pub fn error_code_to_http_status(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::ValidationError => 400,
        ErrorCode::NotFound => 404,
        ErrorCode::DeadlineExceeded => 504,
        ErrorCode::Unavailable => 503,
        ErrorCode::ExecutionError | ErrorCode::InternalError => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PoolConfig,
        engine::test_support::compiled_echo_reactor,
        schema::{MethodDescriptor, Schema, SchemaMetadata, ServiceDef, ServicePackage},
    };
    use bytes::Bytes;
    use std::{collections::HashMap, sync::Arc};

    fn echo_package() -> ServicePackage {
        let mut methods = HashMap::new();
        methods.insert(
            "echo".to_string(),
            MethodDescriptor {
                input_type: "EchoInput".to_string(),
                output_type: "EchoOutput".to_string(),
            },
        );
        let schema = Schema {
            objects: vec![],
            enums: vec![],
            services: vec![ServiceDef {
                name: "Echo".to_string(),
                methods,
            }],
            metadata: SchemaMetadata {
                namespace: "prod".to_string(),
                api_version: "v1".to_string(),
                service_label: "Echo".to_string(),
            },
        };
        ServicePackage::new(compiled_echo_reactor(), schema).unwrap()
    }

    async fn deployed_orchestrator() -> (Arc<RuntimeOrchestrator>, ActorId) {
        let orchestrator = Arc::new(RuntimeOrchestrator::new());
        orchestrator.start().unwrap();
        let actor_id = orchestrator
            .deploy(echo_package(), PoolConfig::new(0, 2).unwrap())
            .await
            .unwrap();
        (orchestrator, actor_id)
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_resolved_actor() {
        let (orchestrator, actor_id) = deployed_orchestrator().await;
        let resolver = move |route: &str| (route == "/echo").then(|| actor_id.clone());
        let gateway = Gateway::new(orchestrator, resolver);

        let resp = gateway
            .dispatch("/echo", ServiceRequest::new("echo", Bytes::from_static(b"hi")))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.output, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn dispatch_unresolvable_route_is_not_found() {
        let (orchestrator, _actor_id) = deployed_orchestrator().await;
        let resolver = |_: &str| None;
        let gateway = Gateway::new(orchestrator, resolver);

        let err = gateway
            .dispatch("/nope", ServiceRequest::new("echo", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::NotDeployed(r)) if r == "/nope"
        ));
    }

    #[tokio::test]
    async fn dispatch_route_to_undeployed_actor_is_not_found() {
        let (orchestrator, actor_id) = deployed_orchestrator().await;
        orchestrator.undeploy(&actor_id).await.unwrap();
        let resolver = move |route: &str| (route == "/echo").then(|| actor_id.clone());
        let gateway = Gateway::new(orchestrator, resolver);

        let err = gateway
            .dispatch("/echo", ServiceRequest::new("echo", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::NotDeployed(_))
        ));
    }

    #[test]
    fn error_code_maps_to_conventional_http_status() {
        assert_eq!(error_code_to_http_status(ErrorCode::ValidationError), 400);
        assert_eq!(error_code_to_http_status(ErrorCode::NotFound), 404);
        assert_eq!(error_code_to_http_status(ErrorCode::DeadlineExceeded), 504);
        assert_eq!(error_code_to_http_status(ErrorCode::Unavailable), 503);
        assert_eq!(error_code_to_http_status(ErrorCode::InternalError), 500);
    }
}
