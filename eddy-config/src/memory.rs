//! Memory subsystem configuration: page zone, slab classes and arenas.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
#[validate(schema(function = validation::validate_memory))]
pub struct MemoryConfig {
    /// Upper bound of the mapped page zone.
    #[serde(with = "crate::size")]
    pub zone_max_bytes: usize,

    /// Page size is `1 << page_shift`.
    #[validate(range(min = 12, max = 20))]
    pub page_shift: u32,

    /// Orders `0..max_order` are served.
    #[validate(range(min = 1, max = 12))]
    pub max_order: u32,

    #[serde(with = "crate::size")]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub slab_min_object: usize,

    #[serde(with = "crate::size")]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub slab_max_object: usize,

    /// Empty slabs each cache keeps before returning pages to the zone.
    pub slab_free_limit: usize,

    /// Process-wide ceiling on handed-out bytes; zero disables the check.
    #[serde(with = "crate::size")]
    pub memlimit: usize,

    #[serde(with = "crate::size")]
    #[validate(range(min = 64, max = 1048576))]
    pub arena_block_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            zone_max_bytes: 64 << 20,
            page_shift: 16,
            max_order: 12,
            slab_min_object: 512,
            slab_max_object: 128 << 10,
            slab_free_limit: 1,
            memlimit: 0,
            arena_block_size: 4096,
        }
    }
}
