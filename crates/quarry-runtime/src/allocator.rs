//! Bump allocation inside the module's linear memory
//!
//! Host data crosses into the module through regions handed out by
//! [`BumpAllocator`]: a monotonic cursor that starts above the module's
//! static data and only ever moves forward. Nothing is reclaimed; a
//! region stays valid until the allocator is reset or the runtime is
//! reinstantiated, which makes the allocator unsuitable for unbounded
//! call volumes without a periodic refresh.

use wasmtime::{AsContextMut, Memory};

use crate::errors::{BridgeError, BridgeResult};

/// Size of one WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: u64 = 0x10000;

/// Fallback heap base for modules that do not export a `__heap_base`
/// global: the first byte past the canonical single static-data page.
pub const DEFAULT_HEAP_BASE: u32 = 0x10000;

// Result buffers are decoded as little-endian u32 arrays, so every
// region starts on a 4-byte boundary.
const ALIGNMENT: u32 = 4;

fn align_up(n: u32) -> u32 {
    n.saturating_add(ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// A pointer/length pair describing host-written bytes inside linear
/// memory. Plain value, no ownership: validity ends when the allocator
/// that produced it is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub ptr: u32,
    pub len: u32,
}

/// Monotonic bump cursor over the module's linear memory.
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    base: u32,
    cursor: u32,
    generation: u32,
}

impl BumpAllocator {
    /// `base` must not be below the module's static data region; it is
    /// rounded up to the alignment boundary.
    pub fn new(base: u32) -> Self {
        let base = align_up(base);
        BumpAllocator {
            base,
            cursor: base,
            generation: 0,
        }
    }

    /// Hand out a region of at least `size` bytes, growing linear
    /// memory first when the cursor would run past current capacity.
    ///
    /// `size = 0` is legal and yields a valid zero-length region.
    /// Pointers returned within one generation are pairwise disjoint
    /// given the aligned sizes. Any typed view derived from `memory`
    /// before this call must be re-derived afterwards: growth may
    /// relocate the backing storage.
    pub fn allocate(
        &mut self,
        mut store: impl AsContextMut,
        memory: &Memory,
        size: usize,
    ) -> BridgeResult<u32> {
        let size = u32::try_from(size).map_err(|_| {
            BridgeError::InvalidArgument(format!(
                "allocation of {} bytes does not fit the 32-bit address space",
                size
            ))
        })?;
        let padded = align_up(size);
        let ptr = self.cursor;
        let end = ptr.checked_add(padded).ok_or_else(|| {
            BridgeError::OutOfAddressSpace(format!(
                "cursor {} + {} bytes overflows the 32-bit address space",
                ptr, padded
            ))
        })?;

        let capacity = memory.data_size(&store) as u64;
        if u64::from(end) > capacity {
            let deficit = u64::from(end) - capacity;
            let pages = (deficit + WASM_PAGE_SIZE - 1) / WASM_PAGE_SIZE;
            memory.grow(&mut store, pages).map_err(|e| {
                BridgeError::OutOfAddressSpace(format!(
                    "linear memory refused to grow by {} pages: {}",
                    pages, e
                ))
            })?;
        }

        self.cursor = end;
        Ok(ptr)
    }

    /// Move the cursor back to the base and start a new generation.
    ///
    /// Every region handed out before the reset is invalidated by
    /// contract, not by tracking; callers must only reset while no
    /// module call is in flight and no staged region is still read.
    pub fn reset(&mut self) {
        self.cursor = self.base;
        self.generation += 1;
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Next free offset.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Incremented on every [`reset`](Self::reset); regions are only
    /// valid within the generation that produced them.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}
