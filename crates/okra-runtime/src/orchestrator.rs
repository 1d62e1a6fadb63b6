//! Runtime Orchestrator (§4.6): the process-wide directory of deployed
//! actors, keyed by [`ActorId`]. Owns lifecycle — `start`, `deploy`,
//! `undeploy`, `shutdown` — and nothing else; routing a request to a
//! deployed actor is the [`crate::gateway::Gateway`]'s job.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    actor::ServiceActor,
    actor_id::ActorId,
    actor_system::{self, Pid},
    config::PoolConfig,
    error::{Error, LifecycleError, Result},
    host::HostApiMediator,
    schema::ServicePackage,
};

/// Process-wide actor directory. Constructed explicitly by the caller (§9:
/// "no singletons") and passed into gateways; closed under the caller's
/// control.
pub struct RuntimeOrchestrator {
    started: AtomicBool,
    actors: DashMap<ActorId, Arc<Pid>>,
}

impl Default for RuntimeOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            actors: DashMap::new(),
        }
    }

    /// Idempotent rejection: a second `start` on an already-started
    /// orchestrator returns [`LifecycleError::AlreadyStarted`].
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Lifecycle(LifecycleError::AlreadyStarted));
        }
        info!("runtime orchestrator started");
        Ok(())
    }

    fn require_started(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::Lifecycle(LifecycleError::NotStarted));
        }
        Ok(())
    }

    /// Computes the package's [`ActorId`], rejects duplicates, spawns a
    /// [`ServiceActor`] bound to `package`, and stores its handle. The
    /// spawned actor pre-warms its pool before the first request is
    /// accepted; a pre-warm failure surfaces on the first `ask`, not here,
    /// since spawning is fire-and-forget (§9: minimal actor abstraction).
    pub async fn deploy(
        &self,
        package: ServicePackage,
        pool_config: PoolConfig,
    ) -> Result<ActorId> {
        self.deploy_with_host_api(package, pool_config, None).await
    }

    /// Like [`Self::deploy`], but binds `host` to the spawned actor's pool
    /// so its workers can reach the host API mediator's capabilities.
    pub async fn deploy_with_host_api(
        &self,
        package: ServicePackage,
        pool_config: PoolConfig,
        host: Option<Arc<HostApiMediator>>,
    ) -> Result<ActorId> {
        self.require_started()?;
        let actor_id = package.actor_id();

        if self.actors.contains_key(&actor_id) {
            return Err(Error::Lifecycle(LifecycleError::AlreadyDeployed(
                actor_id.to_string(),
            )));
        }

        let mut actor = ServiceActor::new(Arc::new(package), pool_config);
        if let Some(mediator) = host {
            actor = actor.with_host_api(mediator);
        }
        let pid = actor_system::spawn(actor);

        match self.actors.entry(actor_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                let _ = pid.stop().await;
                Err(Error::Lifecycle(LifecycleError::AlreadyDeployed(
                    actor_id.to_string(),
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(pid);
                info!(actor_id = %actor_id, "service deployed");
                Ok(actor_id)
            }
        }
    }

    /// Signals the actor to stop (runs `post_stop`) and removes it from the
    /// directory. Rejects `NotDeployed` if `actor_id` is absent.
    pub async fn undeploy(&self, actor_id: &ActorId) -> Result<()> {
        self.require_started()?;
        let (_, pid) = self
            .actors
            .remove(actor_id)
            .ok_or_else(|| Error::Lifecycle(LifecycleError::NotDeployed(actor_id.to_string())))?;
        pid.stop().await?;
        info!(actor_id = %actor_id, "service undeployed");
        Ok(())
    }

    /// O(1) lookup; returns `None` when not started or not deployed.
    #[must_use]
    pub fn get_actor_pid(&self, actor_id: &ActorId) -> Option<Arc<Pid>> {
        if !self.started.load(Ordering::SeqCst) {
            return None;
        }
        self.actors.get(actor_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn is_deployed(&self, actor_id: &ActorId) -> bool {
        self.started.load(Ordering::SeqCst) && self.actors.contains_key(actor_id)
    }

    /// Stops every actor, then the orchestrator itself. Idempotent:
    /// subsequent calls return `NotStarted`. Per-actor stop errors are
    /// logged and collected; the orchestrator still transitions to stopped
    /// and the directory is still cleared even if some actors failed to
    /// drain cleanly (§7: "partial shutdown leaves the system in a
    /// consistent stopped state").
    pub async fn shutdown(&self) -> Result<()> {
        self.require_started()?;
        self.started.store(false, Ordering::SeqCst);

        let actor_ids: Vec<ActorId> = self.actors.iter().map(|e| e.key().clone()).collect();
        let mut failures = 0usize;
        for actor_id in actor_ids {
            if let Some((_, pid)) = self.actors.remove(&actor_id) {
                if let Err(e) = pid.stop().await {
                    warn!(actor_id = %actor_id, error = %e, "actor failed to stop cleanly");
                    failures += 1;
                }
            }
        }
        self.actors.clear();

        if failures > 0 {
            return Err(Error::Lifecycle(LifecycleError::ShutdownErrors(failures)));
        }
        info!("runtime orchestrator shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::test_support::compiled_echo_reactor,
        schema::{MethodDescriptor, Schema, SchemaMetadata, ServiceDef},
    };
    use std::collections::HashMap;

    fn echo_package(namespace: &str, service: &str, version: &str) -> ServicePackage {
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
                name: service.to_string(),
                methods,
            }],
            metadata: SchemaMetadata {
                namespace: namespace.to_string(),
                api_version: version.to_string(),
                service_label: service.to_string(),
            },
        };
        ServicePackage::new(compiled_echo_reactor(), schema).unwrap()
    }

    #[tokio::test]
    async fn deploy_requires_start() {
        let orchestrator = RuntimeOrchestrator::new();
        let err = orchestrator
            .deploy(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        let err = orchestrator.start().unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn deploy_then_is_deployed_round_trips() {
        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        let actor_id = orchestrator
            .deploy(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(actor_id.as_str(), "prod.Echo.v1");
        assert!(orchestrator.is_deployed(&actor_id));

        orchestrator.undeploy(&actor_id).await.unwrap();
        assert!(!orchestrator.is_deployed(&actor_id));
    }

    #[tokio::test]
    async fn duplicate_deploy_rejected() {
        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        orchestrator
            .deploy(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
            )
            .await
            .unwrap();
        let err = orchestrator
            .deploy(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::AlreadyDeployed(id)) if id == "prod.Echo.v1"
        ));
    }

    #[tokio::test]
    async fn undeploy_unknown_actor_rejected() {
        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        let actor_id = ActorId::new("prod", "Ghost", "v1");
        let err = orchestrator.undeploy(&actor_id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::NotDeployed(id)) if id == "prod.Ghost.v1"
        ));
    }

    #[tokio::test]
    async fn get_actor_pid_returns_none_before_start() {
        let orchestrator = RuntimeOrchestrator::new();
        let actor_id = ActorId::new("prod", "Echo", "v1");
        assert!(orchestrator.get_actor_pid(&actor_id).is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        orchestrator
            .deploy(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
            )
            .await
            .unwrap();
        orchestrator.shutdown().await.unwrap();
        assert!(!orchestrator.is_deployed(&ActorId::new("prod", "Echo", "v1")));

        let err = orchestrator.shutdown().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn deploy_after_shutdown_requires_restart() {
        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        orchestrator.shutdown().await.unwrap();
        let err = orchestrator
            .deploy(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn deploy_with_host_api_serves_requests_through_the_bound_mediator() {
        use crate::{config::HostApiConfig, host::CapabilityRegistry, message::ServiceRequest};

        let orchestrator = RuntimeOrchestrator::new();
        orchestrator.start().unwrap();
        let mediator = Arc::new(HostApiMediator::new(
            HostApiConfig::new("svc", "default"),
            CapabilityRegistry::new(),
        ));
        let actor_id = orchestrator
            .deploy_with_host_api(
                echo_package("prod", "Echo", "v1"),
                PoolConfig::new(0, 1).unwrap(),
                Some(mediator),
            )
            .await
            .unwrap();

        let pid = orchestrator.get_actor_pid(&actor_id).unwrap();
        let resp = pid
            .ask(ServiceRequest::new("echo", bytes::Bytes::from_static(b"hi")))
            .await
            .unwrap();
        assert!(resp.success);
    }
}
