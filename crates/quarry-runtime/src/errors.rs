//! Error types for the quarry host bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Caller misuse detectable before any module call is made.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Linear memory could not grow any further. The bump allocator
    /// never reclaims, so the only way back is a caller-driven
    /// [`refresh_memory`](crate::runtime::SearchRuntime::refresh_memory).
    #[error("Out of address space: {0}")]
    OutOfAddressSpace(String),

    /// Serialization output exceeded the reserved staging capacity.
    #[error("Serialized index exceeded the reserved {capacity} byte buffer")]
    BufferTooSmall { capacity: usize },

    /// The module trapped, aborted, or returned a value outside its
    /// documented range.
    #[error("Module fault: {0}")]
    ModuleFault(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
