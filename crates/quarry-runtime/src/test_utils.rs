//! Test support: a stub engine module for exercising the bridge
//!
//! The stub implements the full export surface in WAT with semantics
//! simple enough to assert against from the host side: each index
//! records (id, key) pairs where key is the first byte of the document
//! text, `search` returns the ids whose key equals the first byte of
//! the query (an empty query matches everything), and serialization
//! emits the 8-byte record header followed by the raw records, with -1
//! reported when the reserved capacity is too small.

use anyhow::Result;
use wasmtime::Store;

use crate::runtime::{RuntimeConfig, SearchRuntime, State};

/// Index records are 256 bytes apiece starting at offset 0 (record
/// count, then 8-byte id/key slots); the log banner lives at 65000 and
/// host staging starts at `__heap_base` (65536).
pub const STUB_ENGINE_WAT: &str = r#"
(module
  (import "env" "__console_log" (func $log (param i32 i32)))
  (memory (export "memory") 2)
  (global (export "__heap_base") i32 (i32.const 65536))
  (global $next (mut i32) (i32.const 0))
  (data (i32.const 65000) "index created")

  (func $base (param $h i32) (result i32)
    (i32.mul (local.get $h) (i32.const 256)))

  (func $createIndex (export "createIndex") (result i32)
    (local $h i32)
    (local.set $h (global.get $next))
    (global.set $next (i32.add (local.get $h) (i32.const 1)))
    (i32.store (call $base (local.get $h)) (i32.const 0))
    (call $log (i32.const 65000) (i32.const 13))
    (local.get $h))

  (func (export "addDocument") (param $h i32) (param $id i32) (param $ptr i32) (param $len i32)
    (local $b i32)
    (local $n i32)
    (local $key i32)
    (local.set $b (call $base (local.get $h)))
    (local.set $n (i32.load (local.get $b)))
    (local.set $key (i32.const 0))
    (if (i32.gt_s (local.get $len) (i32.const 0))
      (then (local.set $key (i32.load8_u (local.get $ptr)))))
    (i32.store
      (i32.add (i32.add (local.get $b) (i32.const 8))
               (i32.mul (local.get $n) (i32.const 8)))
      (local.get $id))
    (i32.store
      (i32.add (i32.add (local.get $b) (i32.const 12))
               (i32.mul (local.get $n) (i32.const 8)))
      (local.get $key))
    (i32.store (local.get $b) (i32.add (local.get $n) (i32.const 1))))

  (func (export "search") (param $h i32) (param $qptr i32) (param $qlen i32) (param $rptr i32) (param $max i32) (result i32)
    (local $b i32)
    (local $n i32)
    (local $i i32)
    (local $k i32)
    (local $qkey i32)
    (local.set $b (call $base (local.get $h)))
    (local.set $n (i32.load (local.get $b)))
    (local.set $qkey (i32.const -1))
    (if (i32.gt_s (local.get $qlen) (i32.const 0))
      (then (local.set $qkey (i32.load8_u (local.get $qptr)))))
    (local.set $i (i32.const 0))
    (local.set $k (i32.const 0))
    (block $done
      (loop $scan
        (br_if $done (i32.ge_s (local.get $i) (local.get $n)))
        (br_if $done (i32.ge_s (local.get $k) (local.get $max)))
        (if (i32.or
              (i32.eq (local.get $qkey) (i32.const -1))
              (i32.eq (local.get $qkey)
                      (i32.load (i32.add (i32.add (local.get $b) (i32.const 12))
                                         (i32.mul (local.get $i) (i32.const 8))))))
          (then
            (i32.store
              (i32.add (local.get $rptr) (i32.mul (local.get $k) (i32.const 4)))
              (i32.load (i32.add (i32.add (local.get $b) (i32.const 8))
                                 (i32.mul (local.get $i) (i32.const 8)))))
            (local.set $k (i32.add (local.get $k) (i32.const 1)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $scan)))
    (local.get $k))

  (func (export "serializeIndex") (param $h i32) (param $ptr i32) (param $cap i32) (result i32)
    (local $b i32)
    (local $len i32)
    (local $i i32)
    (local.set $b (call $base (local.get $h)))
    (local.set $len
      (i32.add (i32.const 8)
               (i32.mul (i32.load (local.get $b)) (i32.const 8))))
    (if (i32.gt_s (local.get $len) (local.get $cap))
      (then (return (i32.const -1))))
    (local.set $i (i32.const 0))
    (block $done
      (loop $copy
        (br_if $done (i32.ge_s (local.get $i) (local.get $len)))
        (i32.store8
          (i32.add (local.get $ptr) (local.get $i))
          (i32.load8_u (i32.add (local.get $b) (local.get $i))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $copy)))
    (local.get $len))

  (func (export "deserializeIndex") (param $ptr i32) (param $len i32) (result i32)
    (local $h i32)
    (local $b i32)
    (local $i i32)
    (local.set $h (call $createIndex))
    (local.set $b (call $base (local.get $h)))
    (local.set $i (i32.const 0))
    (block $done
      (loop $copy
        (br_if $done (i32.ge_s (local.get $i) (local.get $len)))
        (i32.store8
          (i32.add (local.get $b) (local.get $i))
          (i32.load8_u (i32.add (local.get $ptr) (local.get $i))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $copy)))
    (local.get $h))
)
"#;

pub fn stub_engine_wasm() -> Vec<u8> {
    wat::parse_str(STUB_ENGINE_WAT).expect("stub engine WAT must parse")
}

/// Runtime wired to the stub engine with the default config.
pub fn stub_runtime() -> Result<SearchRuntime> {
    SearchRuntime::from_module_bytes(&stub_engine_wasm())
}

pub fn stub_runtime_with_config(config: RuntimeConfig) -> Result<SearchRuntime> {
    SearchRuntime::from_module_bytes_with_config(&stub_engine_wasm(), config)
}

/// Store with the resource limiter installed, for tests that drive the
/// allocator against a host-created memory.
pub fn host_store(max_memory_bytes: usize) -> Store<State> {
    let engine = wasmtime::Engine::default();
    let mut store = Store::new(&engine, State::new(max_memory_bytes));
    store.limiter(|state| &mut state.limits);
    store
}
