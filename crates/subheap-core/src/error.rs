//! Failure taxonomy for heap construction and allocation.

use thiserror::Error;

/// Rejected [`HeapConfig`](crate::config::HeapConfig) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("region size {0} is not a power of two")]
    RegionNotPow2(u64),
    #[error("region size {got} outside supported range {min}..={max}")]
    RegionOutOfRange { got: u64, min: u64, max: u64 },
    #[error("slot capacity {got} outside supported range {min}..={max}")]
    CapacityOutOfRange { got: u32, min: u32, max: u32 },
}

/// Why an allocation failed. Deallocation itself never fails.
///
/// Every multi-step allocation that hits one of these unwinds completely
/// before returning: no partial page, no leaked provider block, no consumed
/// arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every page-record slot is occupied. The arena never grows past its
    /// configured capacity, so this is a sizing error, not memory pressure.
    #[error("page record arena exhausted")]
    ArenaExhausted,
    /// The block provider declined to produce a native block.
    #[error("block provider exhausted")]
    ProviderExhausted,
    /// The provider returned a block id above
    /// [`MAX_BLOCK_ID`](crate::provider::MAX_BLOCK_ID). The block was
    /// released back to the provider before this error was reported.
    #[error("provider block id exceeds the representable ceiling")]
    BlockIdOverflow,
}
