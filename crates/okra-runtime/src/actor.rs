//! Service actor (§4.5): the `Receiver` that binds one deployed
//! [`ServicePackage`] to its [`WorkerPool`] and answers [`ServiceRequest`]s
//! against it.

use std::{sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;

use crate::{
    actor_system::Receiver,
    config::{DEFAULT_SHUTDOWN_TIMEOUT, PoolConfig},
    error::{Error, Result, ValidationError},
    host::HostApiMediator,
    message::{HealthCheckRequest, HealthCheckResponse, ServiceRequest, ServiceResponse},
    pool::WorkerPool,
    schema::ServicePackage,
};

const DEFAULT_INVOKE_DEADLINE: Duration = Duration::from_secs(30);

/// One deployed service: a compiled package plus the pool of workers that
/// execute it. `ready` only flips true once `pre_start` has finished
/// pre-warming the pool.
pub struct ServiceActor {
    package: Arc<ServicePackage>,
    pool: Arc<WorkerPool>,
    invoke_deadline: Duration,
    ready: bool,
}

impl ServiceActor {
    #[must_use]
    pub fn new(package: Arc<ServicePackage>, pool_config: PoolConfig) -> Self {
        let pool = Arc::new(WorkerPool::new(Arc::clone(&package.module), pool_config));
        Self {
            package,
            pool,
            invoke_deadline: DEFAULT_INVOKE_DEADLINE,
            ready: false,
        }
    }

    #[must_use]
    pub fn with_invoke_deadline(mut self, deadline: Duration) -> Self {
        self.invoke_deadline = deadline;
        self
    }

    /// Binds a host API mediator to this actor's pool. Must be called
    /// before the actor is spawned (i.e. before its `Arc<WorkerPool>` is
    /// shared with any worker), which `RuntimeOrchestrator::deploy` honors
    /// by calling this immediately after `new`.
    #[must_use]
    pub fn with_host_api(mut self, mediator: Arc<HostApiMediator>) -> Self {
        let pool = Arc::try_unwrap(self.pool)
            .unwrap_or_else(|_| unreachable!("with_host_api must run before the pool is shared"))
            .with_host_api(mediator);
        self.pool = Arc::new(pool);
        self
    }

    fn validate(&self, request: &ServiceRequest) -> Result<()> {
        if !self.ready {
            return Err(Error::internal("actor is not ready"));
        }
        if request.method.is_empty() {
            return Err(Error::Validation(ValidationError::EmptyMethod));
        }
        let descriptor = self
            .package
            .method(&request.method)
            .ok_or_else(|| Error::Validation(ValidationError::MethodNotFound(request.method.clone())))?;
        if descriptor.requires_input() && request.input.is_empty() {
            return Err(Error::Validation(ValidationError::InputRequired(
                request.method.clone(),
            )));
        }
        Ok(())
    }

    /// Effective per-call deadline (§4.5 step 3): the request's own timeout
    /// when set and non-zero, otherwise the actor's default.
    fn effective_deadline(&self, request: &ServiceRequest) -> Duration {
        match request.timeout {
            Some(d) if !d.is_zero() => d,
            _ => self.invoke_deadline,
        }
    }
}

#[async_trait]
impl Receiver for ServiceActor {
    async fn pre_start(&mut self) -> Result<()> {
        self.pool.prewarm().await?;
        self.ready = true;
        Ok(())
    }

    async fn receive(&mut self, request: ServiceRequest) -> ServiceResponse {
        let start = Instant::now();
        if let Err(e) = self.validate(&request) {
            return ServiceResponse::failure(
                request.id,
                e.code(),
                e.to_string(),
                request.metadata,
                start.elapsed(),
            );
        }

        let deadline = self.effective_deadline(&request);
        match self
            .pool
            .invoke(&request.method, &request.input, deadline)
            .await
        {
            Ok(output) => {
                ServiceResponse::success(request.id, output, request.metadata, start.elapsed())
            }
            Err(e) => ServiceResponse::failure(
                request.id,
                e.code(),
                e.to_string(),
                request.metadata,
                start.elapsed(),
            ),
        }
    }

    async fn health_check(&self, request: HealthCheckRequest) -> HealthCheckResponse {
        HealthCheckResponse {
            pong: request.ping,
            ready: self.ready,
            active_workers: self.pool.active_workers(),
        }
    }

    async fn post_stop(&mut self) -> Result<()> {
        self.ready = false;
        self.pool.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await
    }
}
