//! Host runtime for the search engine compute module
//!
//! Every operation takes the same path: encode the host value to bytes,
//! allocate a staging region, write it into linear memory, invoke the
//! module export with pointer/length arguments, and decode the result
//! out of linear memory before the region is abandoned. The module call
//! is the single point where control leaves the bridge and it blocks
//! until the module returns; all operations take `&mut self`, so two
//! calls can never interleave against one memory.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use wasmtime::{Caller, Linker, Memory, Store, StoreLimits, StoreLimitsBuilder};

use crate::allocator::{BumpAllocator, Region, DEFAULT_HEAP_BASE};
use crate::errors::{BridgeError, BridgeResult};

/// Return value used by the module's `serializeIndex` export when the
/// reserved capacity cannot hold the serialized index.
const SERIALIZE_CAPACITY_SENTINEL: i32 = -1;

pub struct State {
    pub(crate) limits: StoreLimits,
    pub(crate) had_failure: bool,
}

impl State {
    pub fn new(max_memory_bytes: usize) -> Self {
        State {
            limits: StoreLimitsBuilder::new()
                .memory_size(max_memory_bytes)
                .build(),
            had_failure: false,
        }
    }
}

/// Tunables for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard ceiling on linear memory; growth past this point is refused
    /// and surfaces as `OutOfAddressSpace`.
    pub max_memory_bytes: usize,
    /// Staging capacity reserved by `serialize_index`. A ceiling, not a
    /// negotiated size: serializing a larger index fails with
    /// `BufferTooSmall`.
    pub serialize_capacity: usize,
    /// Result budget used by `search` when the caller does not pass one.
    pub default_max_results: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 0x10000000, // 256 MB
            serialize_capacity: 1024 * 1024,
            default_max_results: 10,
        }
    }
}

/// Opaque capability identifying one index inside the module's own
/// state. The bridge never inspects it, only passes it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexHandle(i32);

impl IndexHandle {
    pub fn from_raw(raw: i32) -> Self {
        IndexHandle(raw)
    }

    pub fn into_raw(self) -> i32 {
        self.0
    }
}

/// Snapshot of the allocator and linear memory, for logs and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub heap_base: u32,
    pub cursor: u32,
    pub memory_bytes: usize,
    pub generation: u32,
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Memory: {} bytes, heap base {}, cursor {} (generation {})",
            self.memory_bytes, self.heap_base, self.cursor, self.generation
        )
    }
}

pub struct SearchRuntime {
    pub engine: wasmtime::Engine,
    pub module: wasmtime::Module,
    pub wasmstore: wasmtime::Store<State>,
    pub linker: wasmtime::Linker<State>,
    pub instance: wasmtime::Instance,
    pub allocator: BumpAllocator,
    pub config: RuntimeConfig,
}

impl SearchRuntime {
    pub fn load(module_path: PathBuf) -> Result<Self> {
        Self::load_with_config(module_path, RuntimeConfig::default())
    }

    pub fn load_with_config(module_path: PathBuf, config: RuntimeConfig) -> Result<Self> {
        let engine = wasmtime::Engine::new(&Self::engine_config())?;
        let module = wasmtime::Module::from_file(&engine, module_path.into_os_string())
            .context("Failed to load WASM module")?;
        Self::instantiate(engine, module, config)
    }

    /// Build a runtime from in-memory module bytes.
    pub fn from_module_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_module_bytes_with_config(bytes, RuntimeConfig::default())
    }

    pub fn from_module_bytes_with_config(bytes: &[u8], config: RuntimeConfig) -> Result<Self> {
        let engine = wasmtime::Engine::new(&Self::engine_config())?;
        let module =
            wasmtime::Module::new(&engine, bytes).context("Failed to compile WASM module")?;
        Self::instantiate(engine, module, config)
    }

    fn engine_config() -> wasmtime::Config {
        let mut config = wasmtime::Config::default();
        // Reserve memory at maximum size up front so growth extends the
        // existing mapping instead of moving it.
        config.static_memory_maximum_size(0x100000000); // 4GB max memory
        config.static_memory_guard_size(0x10000); // 64KB guard
        config
    }

    fn instantiate(
        engine: wasmtime::Engine,
        module: wasmtime::Module,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let mut linker = Linker::<State>::new(&engine);
        let mut wasmstore = Store::<State>::new(&engine, State::new(config.max_memory_bytes));
        {
            wasmstore.limiter(|state| &mut state.limits)
        }
        {
            Self::setup_linker(&mut linker).context("Failed to setup host imports")?;
            linker.define_unknown_imports_as_traps(&module)?;
        }
        let instance = linker
            .instantiate(&mut wasmstore, &module)
            .context("Failed to instantiate WASM module")?;
        let heap_base = Self::heap_base(&instance, &mut wasmstore);
        log::debug!("instantiated search module, heap base {}", heap_base);
        Ok(SearchRuntime {
            engine,
            module,
            wasmstore,
            linker,
            instance,
            allocator: BumpAllocator::new(heap_base),
            config,
        })
    }

    /// Reinstantiate the module with a fresh store and allocator.
    ///
    /// This is the recovery path for `OutOfAddressSpace`: the bump
    /// allocator never reclaims, so a long-lived runtime that has hit
    /// its ceiling starts over here. All module-side indexes and every
    /// previously returned region are dropped with the old memory.
    pub fn refresh_memory(&mut self) -> Result<()> {
        let mut wasmstore =
            Store::<State>::new(&self.engine, State::new(self.config.max_memory_bytes));
        wasmstore.limiter(|state| &mut state.limits);
        self.instance = self
            .linker
            .instantiate(&mut wasmstore, &self.module)
            .context("Failed to instantiate module during memory refresh")?;
        self.wasmstore = wasmstore;
        let heap_base = Self::heap_base(&self.instance, &mut self.wasmstore);
        self.allocator = BumpAllocator::new(heap_base);
        Ok(())
    }

    fn heap_base(instance: &wasmtime::Instance, store: &mut Store<State>) -> u32 {
        // LLVM-style toolchains export the end of static data as
        // __heap_base; without it, fall back to one page.
        let global = instance.get_global(&mut *store, "__heap_base");
        match global.map(|g| g.get(&mut *store)) {
            Some(wasmtime::Val::I32(base)) if base > 0 => base as u32,
            _ => DEFAULT_HEAP_BASE,
        }
    }

    pub fn setup_linker(linker: &mut Linker<State>) -> Result<()> {
        linker
            .func_wrap(
                "env",
                "__console_log",
                |mut caller: Caller<'_, State>, ptr: i32, len: i32| {
                    let mem = match caller.get_export("memory") {
                        Some(export) => match export.into_memory() {
                            Some(memory) => memory,
                            None => return,
                        },
                        None => return,
                    };
                    let start = match usize::try_from(ptr) {
                        Ok(v) => v,
                        Err(_) => return,
                    };
                    let len = match usize::try_from(len) {
                        Ok(v) => v,
                        Err(_) => return,
                    };
                    let data = mem.data(&caller);
                    let bytes = match data.get(start..start.saturating_add(len)) {
                        Some(bytes) => bytes,
                        None => return,
                    };
                    if let Ok(text) = std::str::from_utf8(bytes) {
                        log::info!(target: "quarry::module", "{}", text);
                    }
                },
            )
            .map_err(|e| anyhow!("Failed to wrap __console_log: {:?}", e))?;

        linker
            .func_wrap(
                "env",
                "abort",
                |mut caller: Caller<'_, State>, _: i32, _: i32, _: i32, _: i32| {
                    caller.data_mut().had_failure = true;
                },
            )
            .map_err(|e| anyhow!("Failed to wrap abort: {:?}", e))?;

        Ok(())
    }

    fn memory(&mut self) -> BridgeResult<Memory> {
        self.instance
            .get_memory(&mut self.wasmstore, "memory")
            .ok_or_else(|| {
                BridgeError::ModuleFault("module does not export linear memory".to_string())
            })
    }

    fn typed_export<Params, Results>(
        &mut self,
        name: &str,
    ) -> BridgeResult<wasmtime::TypedFunc<Params, Results>>
    where
        Params: wasmtime::WasmParams,
        Results: wasmtime::WasmResults,
    {
        self.instance
            .get_typed_func::<Params, Results>(&mut self.wasmstore, name)
            .map_err(|e| BridgeError::ModuleFault(format!("missing export {}: {}", name, e)))
    }

    fn check_module_health(&self) -> BridgeResult<()> {
        if self.wasmstore.data().had_failure {
            return Err(BridgeError::ModuleFault("module aborted".to_string()));
        }
        Ok(())
    }

    /// Stage `bytes` in a fresh region of linear memory.
    pub(crate) fn write_region(&mut self, bytes: &[u8]) -> BridgeResult<Region> {
        let memory = self.memory()?;
        let ptr = self
            .allocator
            .allocate(&mut self.wasmstore, &memory, bytes.len())?;
        memory
            .write(&mut self.wasmstore, ptr as usize, bytes)
            .map_err(|e| {
                anyhow!(
                    "Failed to write {} bytes at offset {}: {}",
                    bytes.len(),
                    ptr,
                    e
                )
            })?;
        Ok(Region {
            ptr,
            len: bytes.len() as u32,
        })
    }

    /// Copy a region back out into owned bytes. The view into linear
    /// memory is re-derived here and dropped before returning; the
    /// region itself is abandoned to the allocator.
    pub(crate) fn read_region(&mut self, region: Region) -> BridgeResult<Vec<u8>> {
        let memory = self.memory()?;
        let data = memory.data(&self.wasmstore);
        let start = region.ptr as usize;
        let end = start + region.len as usize;
        match data.get(start..end) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(BridgeError::ModuleFault(format!(
                "region {}..{} lies outside linear memory ({} bytes)",
                start,
                end,
                data.len()
            ))),
        }
    }

    /// Create a fresh, empty index inside the module.
    pub fn create_index(&mut self) -> BridgeResult<IndexHandle> {
        let func = self.typed_export::<(), i32>("createIndex")?;
        let raw = func.call(&mut self.wasmstore, ()).map_err(module_trap)?;
        self.check_module_health()?;
        log::debug!("created index {}", raw);
        Ok(IndexHandle(raw))
    }

    /// Add one document to the index. Empty text is legal.
    pub fn add_document(
        &mut self,
        handle: IndexHandle,
        doc_id: u32,
        text: &str,
    ) -> BridgeResult<()> {
        let region = self.write_region(text.as_bytes())?;
        let func = self.typed_export::<(i32, i32, i32, i32), ()>("addDocument")?;
        func.call(
            &mut self.wasmstore,
            (
                handle.0,
                doc_id as i32,
                region.ptr as i32,
                region.len as i32,
            ),
        )
        .map_err(module_trap)?;
        self.check_module_health()
    }

    /// Query the index with the configured default result budget.
    pub fn search(&mut self, handle: IndexHandle, query: &str) -> BridgeResult<Vec<u32>> {
        let max_results = self.config.default_max_results;
        self.search_with_limit(handle, query, max_results)
    }

    /// Query the index for up to `max_results` document ids.
    ///
    /// The module ranks and orders the ids; the bridge only checks that
    /// the reported count stays within the budget it reserved space
    /// for. An empty query is legal.
    pub fn search_with_limit(
        &mut self,
        handle: IndexHandle,
        query: &str,
        max_results: i32,
    ) -> BridgeResult<Vec<u32>> {
        if max_results <= 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "max_results must be positive, got {}",
                max_results
            )));
        }
        let query_region = self.write_region(query.as_bytes())?;
        let memory = self.memory()?;
        let results_ptr =
            self.allocator
                .allocate(&mut self.wasmstore, &memory, max_results as usize * 4)?;

        let func = self.typed_export::<(i32, i32, i32, i32, i32), i32>("search")?;
        let count = func
            .call(
                &mut self.wasmstore,
                (
                    handle.0,
                    query_region.ptr as i32,
                    query_region.len as i32,
                    results_ptr as i32,
                    max_results,
                ),
            )
            .map_err(module_trap)?;
        self.check_module_health()?;

        if count < 0 || count > max_results {
            return Err(BridgeError::ModuleFault(format!(
                "search reported {} results for a budget of {}",
                count, max_results
            )));
        }

        let bytes = self.read_region(Region {
            ptr: results_ptr,
            len: count as u32 * 4,
        })?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect())
    }

    /// Serialize the index into an owned byte buffer using the
    /// configured staging capacity.
    pub fn serialize_index(&mut self, handle: IndexHandle) -> BridgeResult<Vec<u8>> {
        let capacity = self.config.serialize_capacity;
        self.serialize_index_with_capacity(handle, capacity)
    }

    /// Serialize the index into an owned byte buffer.
    ///
    /// `capacity` is a ceiling, not a negotiated size: it must cover
    /// the largest index the caller expects, and a larger index fails
    /// with `BufferTooSmall` while leaving the index untouched.
    pub fn serialize_index_with_capacity(
        &mut self,
        handle: IndexHandle,
        capacity: usize,
    ) -> BridgeResult<Vec<u8>> {
        let capacity_i32 = i32::try_from(capacity).map_err(|_| {
            BridgeError::InvalidArgument(format!(
                "serialize capacity {} does not fit an i32 length",
                capacity
            ))
        })?;
        let memory = self.memory()?;
        let ptr = self
            .allocator
            .allocate(&mut self.wasmstore, &memory, capacity)?;

        let func = self.typed_export::<(i32, i32, i32), i32>("serializeIndex")?;
        let written = func
            .call(&mut self.wasmstore, (handle.0, ptr as i32, capacity_i32))
            .map_err(module_trap)?;
        self.check_module_health()?;

        if written == SERIALIZE_CAPACITY_SENTINEL {
            return Err(BridgeError::BufferTooSmall { capacity });
        }
        if written < 0 {
            return Err(BridgeError::ModuleFault(format!(
                "serializeIndex returned {}",
                written
            )));
        }
        // A reported length past the reserved region must not be decoded.
        if written as usize > capacity {
            return Err(BridgeError::BufferTooSmall { capacity });
        }

        let bytes = self.read_region(Region {
            ptr,
            len: written as u32,
        })?;
        log::debug!(
            "serialized index {} into {} bytes ({})",
            handle.0,
            bytes.len(),
            hex::encode(&bytes[..bytes.len().min(8)])
        );
        Ok(bytes)
    }

    /// Rebuild an index from a serialized buffer, yielding a fresh
    /// handle. An empty buffer is staged as a zero-length region;
    /// whether the module accepts it is its own contract.
    pub fn deserialize_index(&mut self, bytes: &[u8]) -> BridgeResult<IndexHandle> {
        let region = self.write_region(bytes)?;
        let func = self.typed_export::<(i32, i32), i32>("deserializeIndex")?;
        let raw = func
            .call(&mut self.wasmstore, (region.ptr as i32, region.len as i32))
            .map_err(module_trap)?;
        self.check_module_health()?;
        log::debug!("deserialized {} bytes into index {}", bytes.len(), raw);
        Ok(IndexHandle(raw))
    }

    pub fn memory_stats(&mut self) -> BridgeResult<MemoryStats> {
        let memory = self.memory()?;
        Ok(MemoryStats {
            heap_base: self.allocator.base(),
            cursor: self.allocator.cursor(),
            memory_bytes: memory.data_size(&self.wasmstore),
            generation: self.allocator.generation(),
        })
    }
}

fn module_trap(err: anyhow::Error) -> BridgeError {
    BridgeError::ModuleFault(format!("module call trapped: {}", err))
}
