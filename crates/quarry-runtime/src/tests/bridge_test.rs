//! Marshalling bridge behavior against the stub engine.

use crate::errors::BridgeError;
use crate::runtime::{RuntimeConfig, SearchRuntime};
use crate::test_utils::{stub_runtime, stub_runtime_with_config};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn create_index_returns_distinct_handles() {
    let mut runtime = stub_runtime().unwrap();
    let a = runtime.create_index().unwrap();
    let b = runtime.create_index().unwrap();
    assert_ne!(a, b);
}

#[test]
fn add_and_search_returns_matching_documents() {
    init_logging();
    let mut runtime = stub_runtime().unwrap();
    let index = runtime.create_index().unwrap();
    runtime.add_document(index, 1, "fox over the fence").unwrap();
    runtime.add_document(index, 2, "dog under the porch").unwrap();

    let hits = runtime.search(index, "fox").unwrap();
    assert_eq!(hits, vec![1]);
}

#[test]
fn empty_query_is_legal_and_matches_everything() {
    let mut runtime = stub_runtime().unwrap();
    let index = runtime.create_index().unwrap();
    runtime.add_document(index, 7, "alpha").unwrap();
    runtime.add_document(index, 9, "beta").unwrap();

    let hits = runtime.search(index, "").unwrap();
    assert_eq!(hits, vec![7, 9]);
}

#[test]
fn empty_document_text_is_legal() {
    let mut runtime = stub_runtime().unwrap();
    let index = runtime.create_index().unwrap();
    runtime.add_document(index, 3, "").unwrap();

    let hits = runtime.search(index, "").unwrap();
    assert_eq!(hits, vec![3]);
}

#[test]
fn search_respects_the_result_budget() {
    let mut runtime = stub_runtime().unwrap();
    let index = runtime.create_index().unwrap();
    for id in 0..5 {
        runtime.add_document(index, id, "same key").unwrap();
    }

    let hits = runtime.search_with_limit(index, "same", 3).unwrap();
    assert_eq!(hits, vec![0, 1, 2]);
}

#[test]
fn non_positive_budget_fails_before_any_module_call() {
    let mut runtime = stub_runtime().unwrap();
    let index = runtime.create_index().unwrap();
    let cursor_before = runtime.allocator.cursor();

    for bad in [0, -1, -10] {
        let err = runtime.search_with_limit(index, "query", bad).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }
    // Nothing was staged: rejection happens before encode/allocate.
    assert_eq!(runtime.allocator.cursor(), cursor_before);
}

#[test]
fn default_search_budget_is_ten() {
    let config = RuntimeConfig::default();
    assert_eq!(config.default_max_results, 10);

    let mut runtime = stub_runtime_with_config(config).unwrap();
    let index = runtime.create_index().unwrap();
    for id in 0..12 {
        runtime.add_document(index, id, "k").unwrap();
    }
    let hits = runtime.search(index, "k").unwrap();
    assert_eq!(hits.len(), 10);
}

#[test]
fn staged_bytes_round_trip_verbatim() {
    let mut runtime = stub_runtime().unwrap();
    let text = "querý with ütf-8 🦊";

    let region = runtime.write_region(text.as_bytes()).unwrap();
    let bytes = runtime.read_region(region).unwrap();
    assert_eq!(String::from_utf8(bytes).unwrap(), text);
}

#[test]
fn memory_stats_track_the_cursor() {
    let mut runtime = stub_runtime().unwrap();
    let before = runtime.memory_stats().unwrap();
    assert_eq!(before.heap_base, 65536);
    assert_eq!(before.cursor, before.heap_base);

    let index = runtime.create_index().unwrap();
    runtime.add_document(index, 1, "some text").unwrap();

    let after = runtime.memory_stats().unwrap();
    assert!(after.cursor > before.cursor);
    assert_eq!(after.generation, 0);

    let json = serde_json::to_string(&after).unwrap();
    assert!(json.contains("cursor"));
    assert!(format!("{}", after).contains("heap base"));
}

const OVERREPORTING_ENGINE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "createIndex") (result i32) (i32.const 0))
  (func (export "addDocument") (param i32 i32 i32 i32))
  (func (export "search") (param i32 i32 i32 i32 i32) (result i32)
    (i32.add (local.get 4) (i32.const 1)))
  (func (export "serializeIndex") (param i32 i32 i32) (result i32) (i32.const -7))
  (func (export "deserializeIndex") (param i32 i32) (result i32) (i32.const 0))
)
"#;

const NEGATIVE_COUNT_ENGINE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "createIndex") (result i32) (i32.const 0))
  (func (export "search") (param i32 i32 i32 i32 i32) (result i32) (i32.const -3))
)
"#;

#[test]
fn count_above_budget_is_a_module_fault() {
    let wasm = wat::parse_str(OVERREPORTING_ENGINE_WAT).unwrap();
    let mut runtime = SearchRuntime::from_module_bytes(&wasm).unwrap();
    let index = runtime.create_index().unwrap();

    let err = runtime.search_with_limit(index, "q", 4).unwrap_err();
    assert!(matches!(err, BridgeError::ModuleFault(_)));
}

#[test]
fn negative_count_is_a_module_fault() {
    let wasm = wat::parse_str(NEGATIVE_COUNT_ENGINE_WAT).unwrap();
    let mut runtime = SearchRuntime::from_module_bytes(&wasm).unwrap();
    let index = runtime.create_index().unwrap();

    let err = runtime.search_with_limit(index, "q", 4).unwrap_err();
    assert!(matches!(err, BridgeError::ModuleFault(_)));
}

#[test]
fn missing_export_is_a_module_fault() {
    let wasm = wat::parse_str(NEGATIVE_COUNT_ENGINE_WAT).unwrap();
    let mut runtime = SearchRuntime::from_module_bytes(&wasm).unwrap();
    let index = runtime.create_index().unwrap();

    let err = runtime.add_document(index, 1, "text").unwrap_err();
    assert!(matches!(err, BridgeError::ModuleFault(_)));
}
