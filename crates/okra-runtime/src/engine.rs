//! Sandbox Engine & Compiled Module (§4.1).
//!
//! Produces executable instances from a `.wasm` byte sequence and supplies
//! the three memory primitives needed for cross-boundary marshalling
//! (`allocate`, `deallocate`, `handle_request`).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};
use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Module, OptLevel, ResourceLimiter};

use crate::{
    config::ModuleConfig,
    error::{ConfigError, Error, ExecutionError, Result},
    worker::Worker,
};

const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Caps guest linear memory and table growth so an untrusted guest cannot
/// grow host memory without bound.
pub(crate) struct MemoryLimiter {
    max_memory_hard: usize,
    max_table_elements_hard: usize,
}

impl MemoryLimiter {
    pub(crate) fn new(max_memory_hard: usize) -> Self {
        const TABLE_ELEMENT_BUDGET_BYTES: usize = 64;
        const MIN_TABLE_ELEMENTS: usize = 1024;
        let max_table_elements_hard = core::cmp::max(
            max_memory_hard / TABLE_ELEMENT_BUDGET_BYTES,
            MIN_TABLE_ELEMENTS,
        );
        Self {
            max_memory_hard,
            max_table_elements_hard,
        }
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_memory_hard)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements_hard)
    }
}

/// Keeps `Engine::increment_epoch` progressing on a dedicated OS thread, so
/// epoch-based interruption cannot starve under a current-thread Tokio
/// runtime or a host call that blocks its worker thread.
struct EpochTickerShared {
    engines: Mutex<HashMap<u64, Engine>>,
    next_id: AtomicU64,
}

struct EpochTicker {
    shared: Arc<EpochTickerShared>,
}

pub(crate) struct EpochRegistration {
    id: u64,
    shared: Arc<EpochTickerShared>,
}

impl Drop for EpochRegistration {
    fn drop(&mut self) {
        self.shared.engines.lock().remove(&self.id);
    }
}

impl EpochTicker {
    fn start() -> std::io::Result<Self> {
        let shared = Arc::new(EpochTickerShared {
            engines: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let bg = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("okra-epoch-ticker".to_string())
            .spawn(move || {
                loop {
                    std::thread::park_timeout(EPOCH_TICK);
                    let engines: Vec<Engine> = bg.engines.lock().values().cloned().collect();
                    for engine in engines {
                        engine.increment_epoch();
                    }
                }
            })?;
        Ok(Self { shared })
    }

    fn register(&self, engine: Engine) -> EpochRegistration {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.engines.lock().insert(id, engine);
        EpochRegistration {
            id,
            shared: Arc::clone(&self.shared),
        }
    }
}

fn global_epoch_ticker() -> &'static EpochTicker {
    static TICKER: OnceLock<EpochTicker> = OnceLock::new();
    TICKER.get_or_init(|| EpochTicker::start().expect("failed to start epoch ticker thread"))
}

fn configure_engine(cfg: &mut Config, max_memory: usize) {
    cfg.epoch_interruption(true)
        .async_support(true)
        .wasm_backtrace(false)
        .native_unwind_info(false)
        .cranelift_opt_level(OptLevel::Speed);
    let _ = max_memory;
}

fn cache_path(cache_dir: &Path, bytes: &[u8]) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    cache_dir.join(format!("{digest:x}.cwasm"))
}

/// Writes `serialized` to `path` via a same-directory temp file and an
/// atomic rename, so a reader never observes a partially-written artifact.
fn write_cache_atomic(cache_dir: &Path, path: &Path, serialized: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(cache_dir)?;
    tmp.write_all(serialized)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Loads a cached `.cwasm` artifact for `bytes` if `cache_dir` is set and a
/// matching entry exists; otherwise compiles fresh and, when a cache
/// directory is configured, writes the compiled artifact back for next
/// time. Deserialization failures (stale cache from an incompatible
/// wasmtime build, corrupt file) fall back to a fresh compile rather than
/// failing the caller.
fn load_or_compile_module(
    engine: &Engine,
    bytes: &[u8],
    cache_dir: Option<&Path>,
) -> Result<Module> {
    let Some(cache_dir) = cache_dir else {
        return Module::new(engine, bytes)
            .map_err(|e| Error::Execution(ExecutionError::InstantiationFailed(e)));
    };

    let path = cache_path(cache_dir, bytes);
    if path.is_file() {
        // Safety: `path` only ever holds artifacts this process (or an
        // earlier run of it) wrote via `Module::serialize` for the same
        // engine configuration, keyed by content hash.
        match unsafe { Module::deserialize_file(engine, &path) } {
            Ok(module) => {
                debug!(cache_path = %path.display(), "module cache hit");
                return Ok(module);
            }
            Err(e) => warn!(cache_path = %path.display(), error = %e, "module cache entry unusable, recompiling"),
        }
    }

    let module = Module::new(engine, bytes)
        .map_err(|e| Error::Execution(ExecutionError::InstantiationFailed(e)))?;

    if let Ok(serialized) = module.serialize() {
        if let Err(e) = write_cache_atomic(cache_dir, &path, &serialized) {
            warn!(cache_path = %path.display(), error = %e, "failed to persist module cache entry");
        }
    }

    Ok(module)
}

/// Immutable compiled representation of one `.wasm` artifact, plus the
/// engine it was compiled with. Owned by the [`crate::schema::ServicePackage`]
/// that produced it; closed exactly once, after all workers derived from it
/// have been closed (enforced by the caller — see the ownership notes in §3).
pub struct CompiledModule {
    engine: Engine,
    module: Module,
    max_memory: usize,
    _epoch: EpochRegistration,
}

impl CompiledModule {
    /// Compiles a `.wasm` byte sequence. Fails with
    /// [`ConfigError::InvalidModule`] if `bytes` is empty, or wraps any
    /// wasmtime compilation failure. When `cfg.cache_dir` is set, a
    /// previously-compiled artifact keyed by the sha256 of `bytes` is reused
    /// instead of recompiling, and a freshly compiled module is written back
    /// to the cache for next time.
    pub fn compile(bytes: &[u8], cfg: &ModuleConfig) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Configuration(ConfigError::InvalidModule));
        }

        let mut config = Config::new();
        configure_engine(&mut config, cfg.max_memory);
        let engine = Engine::new(&config)
            .map_err(|e| Error::Execution(ExecutionError::InstantiationFailed(e)))?;

        let module = load_or_compile_module(&engine, bytes, cfg.cache_dir.as_deref())?;

        let epoch = global_epoch_ticker().register(engine.clone());

        Ok(Self {
            engine,
            module,
            max_memory: cfg.max_memory,
            _epoch: epoch,
        })
    }

    pub(crate) const fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) const fn module(&self) -> &Module {
        &self.module
    }

    pub(crate) const fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Builds a fresh instance bound to the four required exports. Fails
    /// with [`ConfigError::MissingWasi`] if the WASI preview1 surface cannot
    /// be linked, or [`ConfigError::MissingExport`] if `handle_request`,
    /// `allocate`, or `deallocate` is absent. Calls `_initialize` once if the
    /// guest exports it.
    pub async fn instantiate(
        self: &Arc<Self>,
        host: Option<Arc<crate::host::HostApiMediator>>,
    ) -> Result<Worker> {
        Worker::instantiate(Arc::clone(self), host).await
    }

    /// Closes the engine. Idempotent: dropping a `CompiledModule` releases
    /// engine resources exactly once via the epoch-ticker registration.
    pub fn close(&self) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A module exporting nothing — just enough to construct a
    /// [`crate::schema::ServicePackage`] in tests that don't exercise
    /// instantiation.
    pub(crate) fn trivial_compiled_module() -> CompiledModule {
        let bytes = wat::parse_str("(module)").expect("trivial wat parses");
        CompiledModule::compile(&bytes, &ModuleConfig::default())
            .expect("trivial module compiles")
    }

    /// A reactor module implementing the full four-export guest ABI: an
    /// `add`-style `handle_request` that JSON-decodes `{"a":_,"b":_}` and
    /// returns `{"sum":_}` by walking the bytes by hand (no serde in WAT —
    /// the guest encodes/decodes manually with local arithmetic), backed by
    /// a bump allocator over a static memory region.
    pub(crate) const ECHO_REACTOR_WAT: &str = include_str!("../tests/fixtures/echo_reactor.wat");

    pub(crate) fn echo_reactor_bytes() -> Vec<u8> {
        wat::parse_str(ECHO_REACTOR_WAT).expect("fixture wat parses")
    }

    pub(crate) fn compiled_echo_reactor() -> Arc<CompiledModule> {
        Arc::new(
            CompiledModule::compile(&echo_reactor_bytes(), &ModuleConfig::default())
                .expect("echo reactor compiles"),
        )
    }

    /// A reactor that spins for an input-controlled iteration count before
    /// responding, used to exercise pool saturation under real wall-clock
    /// delay.
    pub(crate) const BUSY_REACTOR_WAT: &str = include_str!("../tests/fixtures/busy_reactor.wat");

    pub(crate) fn compiled_busy_reactor() -> Arc<CompiledModule> {
        let bytes = wat::parse_str(BUSY_REACTOR_WAT).expect("fixture wat parses");
        Arc::new(
            CompiledModule::compile(&bytes, &ModuleConfig::default())
                .expect("busy reactor compiles"),
        )
    }

    /// Encodes an iteration count as the raw little-endian `u32` input the
    /// busy reactor expects.
    pub(crate) fn busy_input(iterations: u32) -> Vec<u8> {
        iterations.to_le_bytes().to_vec()
    }

    /// A canned `add`-style reactor: `handle_request` always returns
    /// `{"sum":8}`, regardless of input, since method/input validation
    /// happens one layer up against the service schema.
    pub(crate) const ADD_REACTOR_WAT: &str = include_str!("../tests/fixtures/add_reactor.wat");

    pub(crate) fn compiled_add_reactor() -> Arc<CompiledModule> {
        let bytes = wat::parse_str(ADD_REACTOR_WAT).expect("fixture wat parses");
        Arc::new(
            CompiledModule::compile(&bytes, &ModuleConfig::default())
                .expect("add reactor compiles"),
        )
    }

    /// Exports `_initialize`, which flips a global the guest reports back
    /// through `handle_request` as an ASCII digit.
    pub(crate) const INIT_REACTOR_WAT: &str = include_str!("../tests/fixtures/init_reactor.wat");

    pub(crate) fn compiled_init_reactor() -> Arc<CompiledModule> {
        let bytes = wat::parse_str(INIT_REACTOR_WAT).expect("fixture wat parses");
        Arc::new(
            CompiledModule::compile(&bytes, &ModuleConfig::default())
                .expect("init reactor compiles"),
        )
    }

    /// Missing the required `handle_request` export, for `MissingExport`
    /// rejection tests.
    pub(crate) const NO_HANDLE_REQUEST_WAT: &str =
        include_str!("../tests/fixtures/no_handle_request.wat");

    pub(crate) fn compiled_no_handle_request() -> Arc<CompiledModule> {
        let bytes = wat::parse_str(NO_HANDLE_REQUEST_WAT).expect("fixture wat parses");
        Arc::new(
            CompiledModule::compile(&bytes, &ModuleConfig::default())
                .expect("no-handle-request module compiles"),
        )
    }

    /// Unconditionally traps on `handle_request`, for worker-retirement
    /// tests.
    pub(crate) const TRAP_REACTOR_WAT: &str = include_str!("../tests/fixtures/trap_reactor.wat");

    pub(crate) fn compiled_trap_reactor() -> Arc<CompiledModule> {
        let bytes = wat::parse_str(TRAP_REACTOR_WAT).expect("fixture wat parses");
        Arc::new(
            CompiledModule::compile(&bytes, &ModuleConfig::default())
                .expect("trap reactor compiles"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bytes_rejected() {
        let err = CompiledModule::compile(&[], &ModuleConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::InvalidModule)
        ));
    }

    #[test]
    fn garbage_bytes_rejected() {
        let err = CompiledModule::compile(b"not wasm", &ModuleConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn trivial_module_compiles() {
        let _ = test_support::trivial_compiled_module();
    }

    #[test]
    fn cache_dir_persists_and_is_reused_on_the_next_compile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = ModuleConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..ModuleConfig::default()
        };
        let bytes = test_support::echo_reactor_bytes();

        let _first = CompiledModule::compile(&bytes, &cfg).expect("first compile");
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read cache dir")
            .collect();
        assert_eq!(entries.len(), 1, "expected exactly one cached artifact");

        // A second compile against the same bytes/cache dir must not fail
        // even though it now hits the cache entry the first call wrote.
        let _second = CompiledModule::compile(&bytes, &cfg).expect("second compile (cache hit)");
    }

    #[tokio::test]
    async fn instantiate_rejects_a_module_missing_handle_request() {
        let module = test_support::compiled_no_handle_request();
        let err = module.instantiate(None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::MissingExport("handle_request"))
        ));
    }
}
