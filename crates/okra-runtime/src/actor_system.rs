//! Minimal actor-model abstraction (§5, §9): just enough surface for
//! [`crate::actor::ServiceActor`] to run one request at a time behind a
//! mailbox, without pulling in a third-party actor-framework dependency.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::{
    error::Result,
    message::{HealthCheckRequest, HealthCheckResponse, ServiceRequest, ServiceResponse},
};

/// Anything that can receive a [`ServiceRequest`] and answer it, plus the
/// lifecycle hooks an actor system drives around it. `receive` never
/// returns `Err`: every path, including internal faults, is expected to
/// produce a [`ServiceResponse`] (§7 — "the actor never panics on bad
/// input").
#[async_trait]
pub trait Receiver: Send + 'static {
    async fn pre_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn receive(&mut self, request: ServiceRequest) -> ServiceResponse;

    async fn health_check(&self, request: HealthCheckRequest) -> HealthCheckResponse;

    async fn post_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

enum Envelope {
    Request(ServiceRequest, oneshot::Sender<ServiceResponse>),
    HealthCheck(HealthCheckRequest, oneshot::Sender<HealthCheckResponse>),
    Stop(oneshot::Sender<Result<()>>),
}

/// A handle to a running actor's mailbox. Cheap to clone; sending past a
/// stopped actor returns [`crate::error::LifecycleError::ShutDown`]-shaped
/// errors to the caller rather than panicking.
#[derive(Clone)]
pub struct Pid {
    mailbox: mpsc::Sender<Envelope>,
}

fn mailbox_closed() -> crate::error::Error {
    crate::error::Error::Lifecycle(crate::error::LifecycleError::ShutDown)
}

impl Pid {
    pub async fn ask(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::Request(request, tx))
            .await
            .map_err(|_| mailbox_closed())?;
        rx.await.map_err(|_| mailbox_closed())
    }

    pub async fn health_check(&self, request: HealthCheckRequest) -> Result<HealthCheckResponse> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::HealthCheck(request, tx))
            .await
            .map_err(|_| mailbox_closed())?;
        rx.await.map_err(|_| mailbox_closed())
    }

    /// Requests a graceful stop and waits for `post_stop` to finish.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::Stop(tx))
            .await
            .map_err(|_| mailbox_closed())?;
        rx.await.map_err(|_| mailbox_closed())?
    }
}

const MAILBOX_CAPACITY: usize = 64;

/// Spawns `receiver` onto its own task reading a bounded mailbox; every
/// message is handled to completion before the next is read, so a given
/// actor never runs two requests concurrently (§5: "within one actor,
/// Receive processes messages sequentially").
pub fn spawn<R: Receiver>(mut receiver: R) -> Arc<Pid> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(MAILBOX_CAPACITY);

    tokio::spawn(async move {
        if let Err(e) = receiver.pre_start().await {
            error!(error = %e, "actor pre_start failed");
            return;
        }

        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Request(request, reply) => {
                    let response = receiver.receive(request).await;
                    let _ = reply.send(response);
                }
                Envelope::HealthCheck(request, reply) => {
                    let _ = reply.send(receiver.health_check(request).await);
                }
                Envelope::Stop(reply) => {
                    let result = receiver.post_stop().await;
                    let _ = reply.send(result);
                    break;
                }
            }
        }
    });

    Arc::new(Pid { mailbox: tx })
}
