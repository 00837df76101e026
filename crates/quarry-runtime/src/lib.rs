//! Host bridge for the quarry search engine WASM module
//!
//! The compute module owns the index internals (tokenization, ranking,
//! on-disk format); this crate owns the other side of the boundary:
//! staging bytes into the module's linear memory, invoking exports with
//! pointer/length arguments, and decoding results back out.

// Core modules
pub mod allocator;
pub mod errors;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
pub mod tests;

// Re-export core types
pub use allocator::{BumpAllocator, Region, DEFAULT_HEAP_BASE, WASM_PAGE_SIZE};
pub use errors::{BridgeError, BridgeResult};
pub use runtime::{IndexHandle, MemoryStats, RuntimeConfig, SearchRuntime, State};
