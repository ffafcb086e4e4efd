//! Heap construction parameters.
//!
//! A [`HeapConfig`] is validated once, when the heap is built; after that
//! every field is treated as immutable. The region size is the quantum in
//! which huge pages are subdivided and is the unit of all large-tier
//! accounting.

use crate::error::ConfigError;

/// Smallest accepted region size.
pub const MIN_REGION_BYTES: u64 = 4 * 1024;
/// Largest accepted region size.
pub const MAX_REGION_BYTES: u64 = 16 * 1024 * 1024;
/// Region size used by [`HeapConfig::default`].
pub const DEFAULT_REGION_BYTES: u64 = 64 * 1024;

/// Smallest accepted page-record capacity.
pub const MIN_SLOT_CAPACITY: u32 = 64;
/// Largest page-record capacity; bounded by the handle's slot-index width.
pub const MAX_SLOT_CAPACITY: u32 = 1 << 24;
/// Capacity used by [`HeapConfig::default`].
pub const DEFAULT_SLOT_CAPACITY: u32 = 65_536;

/// Parameters of one heap instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes per region. Must be a power of two within
    /// [`MIN_REGION_BYTES`]..=[`MAX_REGION_BYTES`].
    pub region_bytes: u64,
    /// Page-record slots available to this heap. One slot is reserved, so
    /// the number of live pages is `slot_capacity - 1`.
    pub slot_capacity: u32,
    /// Map every huge page's block when the block is created and keep it
    /// mapped until the block is released.
    pub persistent_map: bool,
    /// Commit regions through the provider as they turn busy and decommit
    /// them as they turn free.
    pub commit_regions: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_bytes: DEFAULT_REGION_BYTES,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            persistent_map: false,
            commit_regions: false,
        }
    }
}

impl HeapConfig {
    /// Check every field against its documented bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.region_bytes.is_power_of_two() {
            return Err(ConfigError::RegionNotPow2(self.region_bytes));
        }
        if self.region_bytes < MIN_REGION_BYTES || self.region_bytes > MAX_REGION_BYTES {
            return Err(ConfigError::RegionOutOfRange {
                got: self.region_bytes,
                min: MIN_REGION_BYTES,
                max: MAX_REGION_BYTES,
            });
        }
        if self.slot_capacity < MIN_SLOT_CAPACITY || self.slot_capacity > MAX_SLOT_CAPACITY {
            return Err(ConfigError::CapacityOutOfRange {
                got: self.slot_capacity,
                min: MIN_SLOT_CAPACITY,
                max: MAX_SLOT_CAPACITY,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HeapConfig::default();
        assert!(
            config.validate().is_ok(),
            "default config must validate: {config:?}"
        );
    }

    #[test]
    fn non_pow2_region_is_rejected() {
        let config = HeapConfig {
            region_bytes: 65_537,
            ..HeapConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::RegionNotPow2(65_537)));
    }

    #[test]
    fn region_bounds_are_enforced() {
        let too_small = HeapConfig {
            region_bytes: 2048,
            ..HeapConfig::default()
        };
        assert!(matches!(
            too_small.validate(),
            Err(ConfigError::RegionOutOfRange { got: 2048, .. })
        ));

        let too_big = HeapConfig {
            region_bytes: 32 * 1024 * 1024,
            ..HeapConfig::default()
        };
        assert!(matches!(
            too_big.validate(),
            Err(ConfigError::RegionOutOfRange { .. })
        ));
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        let too_small = HeapConfig {
            slot_capacity: 16,
            ..HeapConfig::default()
        };
        assert!(matches!(
            too_small.validate(),
            Err(ConfigError::CapacityOutOfRange { got: 16, .. })
        ));

        let max_ok = HeapConfig {
            slot_capacity: MAX_SLOT_CAPACITY,
            ..HeapConfig::default()
        };
        assert!(max_ok.validate().is_ok());
    }
}
