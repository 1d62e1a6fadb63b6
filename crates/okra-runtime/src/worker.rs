//! Worker: one live wasm instance bound to the four required guest exports
//! (§4.2), plus the `okra.host_execute` / `okra.host_next` /
//! `okra.host_close_iterator` host imports the guest uses to reach the
//! capability mediator (§4.4, §6). Owns the instance's `Store`, so closing a
//! worker drops its linear memory and table along with it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_json::Value;
use wasmtime::{Caller, Extern, Linker, Memory, Store, TypedFunc};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};

use crate::{
    engine::{CompiledModule, MemoryLimiter},
    error::{ConfigError, Error, ExecutionError, Result},
    host::{HostApiMediator, HostApiSet},
};

struct WorkerState {
    wasi: WasiP1Ctx,
    limiter: MemoryLimiter,
    host: Option<HostApiSet>,
}

/// Registers the three host imports under the `okra` module namespace.
/// Safe to call even when no guest the engine ever instantiates imports
/// them: wasmtime only requires a linker definition to satisfy an import
/// the module actually declares, so unrelated fixtures (and any guest
/// built without host-API usage) link and run unaffected.
fn register_host_api(linker: &mut Linker<WorkerState>) -> std::result::Result<(), anyhow::Error> {
    linker.func_wrap_async(
        "okra",
        "host_execute",
        |mut caller: Caller<'_, WorkerState>,
         (api_ptr, api_len, method_ptr, method_len, params_ptr, params_len): (
            i32,
            i32,
            i32,
            i32,
            i32,
            i32,
        )| {
            Box::new(async move {
                host_execute(
                    &mut caller,
                    api_ptr,
                    api_len,
                    method_ptr,
                    method_len,
                    params_ptr,
                    params_len,
                )
                .await
                .unwrap_or(0)
            })
        },
    )?;

    linker.func_wrap_async(
        "okra",
        "host_next",
        |mut caller: Caller<'_, WorkerState>, (id_ptr, id_len): (i32, i32)| {
            Box::new(async move { host_next(&mut caller, id_ptr, id_len).await.unwrap_or(0) })
        },
    )?;

    linker.func_wrap(
        "okra",
        "host_close_iterator",
        |mut caller: Caller<'_, WorkerState>, (id_ptr, id_len): (i32, i32)| {
            host_close_iterator(&mut caller, id_ptr, id_len);
        },
    )?;

    Ok(())
}

fn read_guest_bytes(caller: &mut Caller<'_, WorkerState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(m)) => m,
        _ => return None,
    };
    let start = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    let end = start.checked_add(len)?;
    memory.data(&*caller).get(start..end).map(<[u8]>::to_vec)
}

fn read_guest_string(caller: &mut Caller<'_, WorkerState>, ptr: i32, len: i32) -> Option<String> {
    read_guest_bytes(caller, ptr, len).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Writes `bytes` into a fresh buffer obtained from the guest's own
/// `allocate` export and packs the result the same way `handle_request`
/// does (§6: "high 32 bits: out-pointer; low 32 bits: out-length").
async fn write_to_guest(caller: &mut Caller<'_, WorkerState>, bytes: &[u8]) -> Option<i64> {
    let allocate_export = match caller.get_export("allocate") {
        Some(Extern::Func(f)) => f,
        _ => return None,
    };
    let allocate = allocate_export.typed::<i32, i32>(&*caller).ok()?;
    let ptr = allocate
        .call_async(&mut *caller, i32::try_from(bytes.len()).ok()?)
        .await
        .ok()?;

    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(m)) => m,
        _ => return None,
    };
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(bytes.len())?;
    memory
        .data_mut(&mut *caller)
        .get_mut(start..end)?
        .copy_from_slice(bytes);

    Some((i64::from(ptr) << 32) | i64::from(bytes.len() as u32))
}

async fn host_execute(
    caller: &mut Caller<'_, WorkerState>,
    api_ptr: i32,
    api_len: i32,
    method_ptr: i32,
    method_len: i32,
    params_ptr: i32,
    params_len: i32,
) -> Option<i64> {
    let api = read_guest_string(caller, api_ptr, api_len)?;
    let method = read_guest_string(caller, method_ptr, method_len)?;
    let params_bytes = read_guest_bytes(caller, params_ptr, params_len)?;
    let params: Value = serde_json::from_slice(&params_bytes).unwrap_or(Value::Null);

    let envelope = match caller.data().host.as_ref() {
        Some(host) => host.execute(&api, &method, params).await,
        None => return None,
    };

    let bytes = serde_json::to_vec(&envelope).ok()?;
    write_to_guest(caller, &bytes).await
}

async fn host_next(caller: &mut Caller<'_, WorkerState>, id_ptr: i32, id_len: i32) -> Option<i64> {
    let id = read_guest_string(caller, id_ptr, id_len)?;

    let envelope = match caller.data().host.as_ref() {
        Some(host) => host.next(&id).await,
        None => return None,
    };

    let bytes = serde_json::to_vec(&envelope).ok()?;
    write_to_guest(caller, &bytes).await
}

fn host_close_iterator(caller: &mut Caller<'_, WorkerState>, id_ptr: i32, id_len: i32) {
    let Some(id) = read_guest_string(caller, id_ptr, id_len) else {
        return;
    };
    if let Some(host) = caller.data().host.as_ref() {
        let _ = host.close_iterator(&id);
    }
}

type AllocateFn = TypedFunc<i32, i32>;
type DeallocateFn = TypedFunc<(i32, i32), ()>;
type HandleRequestFn = TypedFunc<(i32, i32, i32, i32), i64>;

/// A single instantiated guest, ready to serve `handle_request` calls one
/// at a time. Not `Clone`; the owning [`crate::pool::WorkerPool`] hands out
/// at most one concurrent caller per worker.
pub struct Worker {
    _module: Arc<CompiledModule>,
    store: Store<WorkerState>,
    memory: Memory,
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    handle_request: HandleRequestFn,
    trapped: AtomicBool,
}

fn missing_export(name: &'static str) -> Error {
    Error::Configuration(ConfigError::MissingExport(name))
}

impl Worker {
    /// Links the WASI preview1 surface, instantiates the module, binds the
    /// four required exports, and calls `_initialize` once if the guest
    /// declares it.
    pub(crate) async fn instantiate(
        module: Arc<CompiledModule>,
        host: Option<Arc<HostApiMediator>>,
    ) -> Result<Self> {
        let mut linker: Linker<WorkerState> = Linker::new(module.engine());
        preview1::add_to_linker_async(&mut linker, |s: &mut WorkerState| &mut s.wasi)
            .map_err(|e| Error::Configuration(ConfigError::MissingWasi(e)))?;
        register_host_api(&mut linker)
            .map_err(|e| Error::Configuration(ConfigError::HostLinkFailed(e)))?;

        let wasi = wasmtime_wasi::preview1::WasiP1CtxBuilder::new().build();
        let limiter = MemoryLimiter::new(module.max_memory());
        let host_set = host.map(HostApiSet::new);
        let mut store = Store::new(
            module.engine(),
            WorkerState {
                wasi,
                limiter,
                host: host_set,
            },
        );
        store.limiter(|s| &mut s.limiter);
        store.epoch_deadline_async_yield_and_update(1);

        let instance = linker
            .instantiate_async(&mut store, module.module())
            .await
            .map_err(|e| Error::Execution(ExecutionError::InstantiationFailed(e)))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| missing_export("memory"))?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, "allocate")
            .map_err(|_| missing_export("allocate"))?;
        let deallocate = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "deallocate")
            .map_err(|_| missing_export("deallocate"))?;
        let handle_request = instance
            .get_typed_func::<(i32, i32, i32, i32), i64>(&mut store, "handle_request")
            .map_err(|_| missing_export("handle_request"))?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call_async(&mut store, ())
                .await
                .map_err(|e| Error::Execution(ExecutionError::Trap(e)))?;
        }

        Ok(Self {
            _module: module,
            store,
            memory,
            allocate,
            deallocate,
            handle_request,
            trapped: AtomicBool::new(false),
        })
    }

    /// Whether this worker trapped on a prior call. Once true, the owning
    /// pool must close it rather than return it to the idle set.
    pub(crate) fn is_trapped(&self) -> bool {
        self.trapped.load(Ordering::Acquire)
    }

    async fn write_buffer(&mut self, bytes: &[u8]) -> Result<i32> {
        let ptr = self
            .allocate
            .call_async(&mut self.store, i32::try_from(bytes.len()).unwrap_or(i32::MAX))
            .await
            .map_err(|e| {
                self.trapped.store(true, Ordering::Release);
                Error::Execution(ExecutionError::Trap(e))
            })?;
        self.write_at(ptr, bytes)?;
        Ok(ptr)
    }

    fn write_at(&mut self, ptr: i32, bytes: &[u8]) -> Result<()> {
        let start = usize::try_from(ptr).map_err(|_| out_of_bounds(ptr, bytes.len()))?;
        let end = start
            .checked_add(bytes.len())
            .ok_or_else(|| out_of_bounds(ptr, bytes.len()))?;
        let data = self.memory.data_mut(&mut self.store);
        let slice = data
            .get_mut(start..end)
            .ok_or_else(|| out_of_bounds(ptr, bytes.len()))?;
        slice.copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(Error::Execution(ExecutionError::MemoryAccessFailed { ptr, len }))?;
        let data = self.memory.data(&self.store);
        let slice = data
            .get(start..end)
            .ok_or(Error::Execution(ExecutionError::MemoryAccessFailed { ptr, len }))?;
        Ok(slice.to_vec())
    }

    async fn free(&mut self, ptr: i32, len: i32) {
        if self.trapped.load(Ordering::Acquire) {
            return;
        }
        if self
            .deallocate
            .call_async(&mut self.store, (ptr, len))
            .await
            .is_err()
        {
            self.trapped.store(true, Ordering::Release);
        }
    }

    /// Marshals `method`/`input` into guest memory, invokes
    /// `handle_request`, reads the packed result back out, and frees every
    /// buffer it allocated along the way, whether the call succeeded or
    /// not.
    pub(crate) async fn invoke(&mut self, method: &str, input: &[u8]) -> Result<Vec<u8>> {
        let mut allocated: Vec<(i32, i32)> = Vec::with_capacity(2);

        let result = self.invoke_inner(method, input, &mut allocated).await;

        for (ptr, len) in allocated {
            self.free(ptr, len).await;
        }

        result
    }

    async fn invoke_inner(
        &mut self,
        method: &str,
        input: &[u8],
        allocated: &mut Vec<(i32, i32)>,
    ) -> Result<Vec<u8>> {
        let method_ptr = self.write_buffer(method.as_bytes()).await?;
        allocated.push((method_ptr, method.len() as i32));

        let input_ptr = self.write_buffer(input).await?;
        allocated.push((input_ptr, input.len() as i32));

        let packed = self
            .handle_request
            .call_async(
                &mut self.store,
                (
                    method_ptr,
                    method.len() as i32,
                    input_ptr,
                    input.len() as i32,
                ),
            )
            .await
            .map_err(|e| {
                self.trapped.store(true, Ordering::Release);
                Error::Execution(ExecutionError::Trap(e))
            })?;

        if packed == 0 {
            return Err(Error::Execution(ExecutionError::MalformedResult));
        }

        let packed = packed as u64;
        let out_ptr = (packed >> 32) as u32;
        let out_len = (packed & 0xFFFF_FFFF) as u32;
        let output = self.read_at(out_ptr, out_len)?;
        allocated.push((out_ptr as i32, out_len as i32));
        Ok(output)
    }

    /// Consumes the worker, closing any open iterators and dropping its
    /// `Store` (releasing its linear memory and table along with it).
    pub(crate) fn close(self) {
        if let Some(host) = self.store.data().host.as_ref() {
            host.close();
        }
    }
}

fn out_of_bounds(ptr: i32, len: usize) -> Error {
    Error::Execution(ExecutionError::MemoryAccessFailed {
        ptr: ptr as u32,
        len: len as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HostApiConfig,
        engine::test_support::compiled_echo_reactor,
        host::{CapabilityRegistry, HostApiMediator, capabilities::env::EnvCapability},
    };
    use std::collections::HashMap;

    fn echo_mediator() -> Arc<HostApiMediator> {
        let registry = CapabilityRegistry::new().register(Arc::new(EnvCapability::new(
            HashMap::from([("STAGE".to_string(), "prod".to_string())]),
        )));
        Arc::new(HostApiMediator::new(
            HostApiConfig::new("svc", "default"),
            registry,
        ))
    }

    #[tokio::test]
    async fn echoes_input_back() {
        let module = compiled_echo_reactor();
        let mut worker = Worker::instantiate(module, None).await.unwrap();
        let out = worker.invoke("anything", b"hello world").await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn empty_input_round_trips() {
        let module = compiled_echo_reactor();
        let mut worker = Worker::instantiate(module, None).await.unwrap();
        let out = worker.invoke("ping", b"").await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn repeated_calls_reuse_one_worker() {
        let module = compiled_echo_reactor();
        let mut worker = Worker::instantiate(module, None).await.unwrap();
        for i in 0..8u8 {
            let payload = vec![i; 16];
            let out = worker.invoke("m", &payload).await.unwrap();
            assert_eq!(out, payload);
        }
        assert!(!worker.is_trapped());
    }

    #[tokio::test]
    async fn instantiating_with_a_mediator_does_not_disturb_guests_that_never_import_it() {
        let module = compiled_echo_reactor();
        let mut worker = Worker::instantiate(module, Some(echo_mediator())).await.unwrap();
        let out = worker.invoke("anything", b"hello world").await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn host_execute_reaches_the_bound_mediator() {
        let mediator = echo_mediator();
        let host_set = HostApiSet::new(mediator);
        let envelope = host_set.execute("env", "get", serde_json::json!({"key": "STAGE"})).await;
        assert_eq!(envelope["ok"]["value"], serde_json::json!("prod"));
    }

    #[tokio::test]
    async fn host_execute_against_unknown_capability_is_a_guest_visible_error() {
        let mediator = echo_mediator();
        let host_set = HostApiSet::new(mediator);
        let envelope = host_set.execute("nope", "get", serde_json::json!({})).await;
        assert_eq!(envelope["error"]["code"], serde_json::json!("EXECUTION_ERROR"));
    }

    #[tokio::test]
    async fn initialize_runs_exactly_once_before_the_first_invoke() {
        use crate::engine::test_support::compiled_init_reactor;

        let module = compiled_init_reactor();
        let mut worker = Worker::instantiate(module, None).await.unwrap();
        let out = worker.invoke("anything", b"").await.unwrap();
        assert_eq!(out, b"1");
    }

    #[tokio::test]
    async fn a_trap_marks_the_worker_trapped_without_panicking() {
        use crate::engine::test_support::compiled_trap_reactor;

        let module = compiled_trap_reactor();
        let mut worker = Worker::instantiate(module, None).await.unwrap();
        let err = worker.invoke("anything", b"").await.unwrap_err();
        assert!(matches!(err, Error::Execution(ExecutionError::Trap(_))));
        assert!(worker.is_trapped());
    }
}
