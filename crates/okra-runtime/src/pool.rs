//! Bounded worker pool (§4.3): acquires an idle [`Worker`] or instantiates a
//! fresh one up to `max_workers`, and retires any worker that traps instead
//! of returning it to the idle set.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    config::PoolConfig,
    engine::CompiledModule,
    error::{Error, LifecycleError, Result},
    host::HostApiMediator,
    worker::Worker,
};

struct PoolInner {
    idle: VecDeque<Worker>,
    live: usize,
    in_flight: usize,
    shutdown: bool,
}

/// Undoes a `live`/`in_flight` reservation unless `defuse`d. Covers the
/// case where the future holding it is dropped before reaching the
/// success path (e.g. an `acquire` cancelled by `tokio::time::timeout`
/// while instantiation is in flight) so no permit leaks.
struct ReservedSlot<'a> {
    pool: &'a WorkerPool,
    defused: bool,
}

impl ReservedSlot<'_> {
    fn defuse(mut self) {
        self.defused = true;
    }
}

impl Drop for ReservedSlot<'_> {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        {
            let mut inner = self.pool.inner.lock();
            inner.live -= 1;
            inner.in_flight -= 1;
        }
        self.pool.notify.notify_one();
    }
}

/// Bounded pool of [`Worker`]s derived from one [`CompiledModule`]. Never
/// holds its lock across a call into the guest: the lock only ever guards
/// the idle deque and the live/in-flight counters.
pub struct WorkerPool {
    module: Arc<CompiledModule>,
    config: PoolConfig,
    host: Option<Arc<HostApiMediator>>,
    inner: Mutex<PoolInner>,
    notify: Notify,
}

impl WorkerPool {
    #[must_use]
    pub fn new(module: Arc<CompiledModule>, config: PoolConfig) -> Self {
        Self {
            module,
            config,
            host: None,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                live: 0,
                in_flight: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Binds a host API mediator: every worker this pool instantiates from
    /// here on gets `okra.host_execute`/`okra.host_next`/
    /// `okra.host_close_iterator` wired to it.
    #[must_use]
    pub fn with_host_api(mut self, mediator: Arc<HostApiMediator>) -> Self {
        self.host = Some(mediator);
        self
    }

    /// Instantiates `min_workers` up front so the first caller never pays
    /// cold-start latency. On a failure partway through, every worker
    /// already created in this call is closed and `live`/`idle` are left
    /// untouched before the error is returned.
    pub async fn prewarm(&self) -> Result<()> {
        let mut created = Vec::with_capacity(self.config.min_workers);
        for _ in 0..self.config.min_workers {
            match self.module.instantiate(self.host.clone()).await {
                Ok(worker) => created.push(worker),
                Err(e) => {
                    for worker in created {
                        worker.close();
                    }
                    return Err(e);
                }
            }
        }
        let mut inner = self.inner.lock();
        inner.live += created.len();
        inner.idle.extend(created);
        Ok(())
    }

    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Runs `method(input)` on a worker, blocking (cooperatively) until one
    /// is available or `deadline` elapses. Takes `method`/`input` by
    /// reference; wasm marshalling happens on the acquired worker.
    pub async fn invoke(&self, method: &str, input: &[u8], deadline: Duration) -> Result<Vec<u8>> {
        let mut worker = tokio::time::timeout(deadline, self.acquire()).await??;

        let result = worker.invoke(method, input).await;

        if worker.is_trapped() {
            warn!(method, "worker trapped; retiring");
            self.close_one(worker);
        } else {
            self.release(worker);
        }

        result
    }

    async fn acquire(&self) -> Result<Worker> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.shutdown {
                    return Err(Error::Lifecycle(LifecycleError::ShutDown));
                }
                if let Some(worker) = inner.idle.pop_front() {
                    inner.in_flight += 1;
                    return Ok(worker);
                }
                if inner.live < self.config.max_workers {
                    inner.live += 1;
                    inner.in_flight += 1;
                    break;
                }
            }
            // Fell through without a permit: wait for a release/close and retry.
            self.notify.notified().await;
        }

        // The slot reserved above is charged until `defuse`d on success.
        // `invoke` wraps this whole call in `tokio::time::timeout`, so the
        // `.instantiate().await` below can be cancelled mid-flight; the
        // guard's `Drop` is what undoes the reservation in that case, since
        // a `match` on the awaited future would never run.
        let slot = ReservedSlot {
            pool: self,
            defused: false,
        };
        let worker = self.module.instantiate(self.host.clone()).await?;
        slot.defuse();
        Ok(worker)
    }

    fn release(&self, worker: Worker) {
        let mut inner = self.inner.lock();
        inner.in_flight -= 1;
        if inner.shutdown {
            inner.live -= 1;
            drop(inner);
            worker.close();
        } else {
            inner.idle.push_back(worker);
            drop(inner);
        }
        self.notify.notify_one();
    }

    fn close_one(&self, worker: Worker) {
        {
            let mut inner = self.inner.lock();
            inner.in_flight -= 1;
            inner.live -= 1;
        }
        worker.close();
        self.notify.notify_one();
    }

    /// Flips the shutdown flag, closes every idle worker, and waits for
    /// in-flight calls to drain, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let idle: Vec<Worker> = {
            let mut inner = self.inner.lock();
            inner.shutdown = true;
            let idle: Vec<Worker> = inner.idle.drain(..).collect();
            inner.live -= idle.len();
            idle
        };
        for worker in idle {
            worker.close();
        }

        tokio::time::timeout(timeout, async {
            loop {
                if self.inner.lock().in_flight == 0 {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .map_err(|_| Error::Lifecycle(LifecycleError::ShutdownTimedOut))?;

        debug!("worker pool drained");
        Ok(())
    }
}
