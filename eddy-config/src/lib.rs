//! # Eddy Configuration System
//!
//! Layered configuration for the eddy engine and its tools.
//!
//! ## Features
//! - **Unified Configuration**: one `EddyConfig` for memory, reactors, KFC and telemetry
//! - **Validation**: ranges, power-of-two sizes and cross-field checks at load time
//! - **Human Sizes**: byte fields accept `"64MiB"` style strings

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

mod error;
mod io;
mod kfc;
mod memory;
pub mod size;
mod telemetry;
pub mod validation;

pub use error::ConfigError;
pub use io::{BackpressureConfig, IoConfig};
pub use kfc::KfcConfig;
pub use memory::MemoryConfig;
pub use telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "EDDY_";
const BASE_FILE: &str = "config/eddy.yaml";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone, PartialEq)]
#[serde(default)]
pub struct EddyConfig {
    #[validate(nested)]
    pub memory: MemoryConfig,

    #[validate(nested)]
    pub io: IoConfig,

    #[validate(nested)]
    pub kfc: KfcConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

impl EddyConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/eddy.yaml`, if present
    /// 3. `config/<EDDY_ENV>.yaml` (default `production`), if present
    /// 4. `EDDY_*` environment variables, `__` separating sections
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(EddyConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        } else {
            debug!("{BASE_FILE} not found, using default configuration");
        }

        let env = std::env::var("EDDY_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{env}.yaml");
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment)
    }

    /// Load configuration from a specific file, still honouring `EDDY_*`.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        Self::extract(
            Figment::from(Serialized::defaults(EddyConfig::default())).merge(Yaml::file(path)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn default_config_validates() {
        let config = EddyConfig::default();
        config.validate().expect("Default config should validate");
    }

    #[test]
    fn yaml_then_environment_override() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/eddy.yaml",
                r#"
memory:
  zone_max_bytes: "32MiB"
io:
  io_threads: 2
  backpressure:
    high_watermark: 64KiB
    low_watermark: 16KiB
kfc:
  scheduler: hashed
"#,
            )?;
            jail.set_env("EDDY_IO__IO_THREADS", "3");
            jail.set_env("EDDY_MEMORY__ARENA_BLOCK_SIZE", "8KiB");

            let config = EddyConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.memory.zone_max_bytes, 32 << 20);
            assert_eq!(config.memory.arena_block_size, 8 << 10);
            assert_eq!(config.io.io_threads, 3);
            assert_eq!(config.io.backpressure.high_watermark, 64 << 10);
            assert_eq!(config.kfc.scheduler, "hashed");
            assert_eq!(config.telemetry, TelemetryConfig::default());
            Ok(())
        });
    }

    #[test]
    fn environment_file_overrides_base() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file("config/eddy.yaml", "io:\n  tick_ms: 50\n")?;
            jail.create_file("config/staging.yaml", "io:\n  tick_ms: 20\n")?;
            jail.set_env("EDDY_ENV", "staging");

            let config = EddyConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.io.tick_ms, 20);
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_reported() {
        let err = EddyConfig::load_from_path("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn invalid_values_are_rejected_with_field_paths() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.yaml",
                r#"
io:
  backpressure:
    high_watermark: 1024
    low_watermark: 4096
kfc:
  scheduler: random
"#,
            )?;
            let err = EddyConfig::load_from_path("custom.yaml").unwrap_err();
            let message = err.to_string();
            assert!(matches!(err, ConfigError::Validation(_)));
            assert!(message.contains("kfc.scheduler: unknown_scheduler"), "{message}");
            assert!(message.contains("low_watermark_not_below_high"), "{message}");
            Ok(())
        });
    }

    #[test]
    fn slab_range_must_be_ordered() {
        let mut config = EddyConfig::default();
        config.memory.slab_min_object = 4096;
        config.memory.slab_max_object = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn serializes_back_to_yaml() {
        let yaml = serde_yaml::to_string(&EddyConfig::default()).unwrap();
        let back: EddyConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, EddyConfig::default());
    }
}
