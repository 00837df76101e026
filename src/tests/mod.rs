//! End-to-end tests for the quarry host bridge.

use quarry_runtime::test_utils;
use quarry_runtime::{RuntimeConfig, SearchRuntime};


/// Runtime against the stub engine with a caller-chosen memory ceiling.
pub fn small_runtime(max_memory_bytes: usize) -> SearchRuntime {
    let config = RuntimeConfig {
        max_memory_bytes,
        ..RuntimeConfig::default()
    };
    test_utils::stub_runtime_with_config(config).expect("stub runtime")
}
