//! Custom validation functions for configuration.

use validator::ValidationError;

use crate::io::BackpressureConfig;
use crate::memory::MemoryConfig;

/// Scheduling policy names accepted by `kfc.scheduler`.
pub const SCHEDULERS: [&str; 3] = ["round_robin", "hashed", "response_time"];

pub fn validate_power_of_two(value: usize) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}

pub fn validate_scheduler(name: &str) -> Result<(), ValidationError> {
    if SCHEDULERS.contains(&name) {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_scheduler"))
    }
}

pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error", "off"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Reading resumes below `low_watermark`, so it must sit under the high mark.
pub fn validate_watermarks(config: &BackpressureConfig) -> Result<(), ValidationError> {
    if config.low_watermark < config.high_watermark {
        Ok(())
    } else {
        Err(ValidationError::new("low_watermark_not_below_high"))
    }
}

/// Slab classes must form a non-empty range that fits one zone block.
pub fn validate_memory(config: &MemoryConfig) -> Result<(), ValidationError> {
    if config.slab_min_object > config.slab_max_object {
        return Err(ValidationError::new("slab_min_above_max"));
    }
    let largest_block = 1usize
        .checked_shl(config.page_shift + config.max_order.saturating_sub(1))
        .unwrap_or(usize::MAX);
    if config.slab_min_object > largest_block {
        return Err(ValidationError::new("slab_min_exceeds_block"));
    }
    if config.zone_max_bytes < 1usize.checked_shl(config.page_shift).unwrap_or(usize::MAX) {
        return Err(ValidationError::new("zone_smaller_than_page"));
    }
    Ok(())
}
