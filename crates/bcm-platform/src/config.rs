use bcm_devices::consts::VCRAM_SIZE;
use serde::{Deserialize, Serialize};

use crate::machine::PlatformError;
use crate::memory_map::RAM_BANK_SIZE;

pub const DEFAULT_RAM_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_VBLANK_HZ: u32 = 60;

const NS_PER_SEC: u64 = 1_000_000_000;

/// Board configuration.
///
/// Deserialized from JSON; missing fields take the Model B defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    /// SDRAM size in bytes, including the video RAM carved from its top.
    pub ram_size_bytes: u64,
    /// Display refresh rate.
    pub vblank_hz: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: DEFAULT_RAM_SIZE,
            vblank_hz: DEFAULT_VBLANK_HZ,
        }
    }
}

impl PlatformConfig {
    pub fn from_json(json: &str) -> Result<Self, PlatformError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.ram_size_bytes <= VCRAM_SIZE {
            return Err(PlatformError::InvalidConfig(format!(
                "ram_size_bytes={} must exceed the {VCRAM_SIZE}-byte video RAM",
                self.ram_size_bytes
            )));
        }
        if self.ram_size_bytes > RAM_BANK_SIZE {
            return Err(PlatformError::InvalidConfig(format!(
                "ram_size_bytes={} exceeds one {RAM_BANK_SIZE}-byte SDRAM bank",
                self.ram_size_bytes
            )));
        }
        if self.vblank_hz == 0 {
            return Err(PlatformError::InvalidConfig(
                "vblank_hz must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Guest-physical start of the video RAM.
    pub fn vcram_base(&self) -> u64 {
        self.ram_size_bytes - VCRAM_SIZE
    }

    pub fn vblank_period_ns(&self) -> u64 {
        NS_PER_SEC / u64::from(self.vblank_hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fields_default_individually() {
        let config = PlatformConfig::from_json(r#"{ "vblank_hz": 50 }"#).unwrap();
        assert_eq!(
            config,
            PlatformConfig {
                ram_size_bytes: DEFAULT_RAM_SIZE,
                vblank_hz: 50
            }
        );
        assert_eq!(config.vcram_base(), 0x0c00_0000);
        assert_eq!(config.vblank_period_ns(), 20_000_000);
    }

    #[test]
    fn rejects_bad_configs() {
        for json in [
            r#"{ "ram_size_bytes": 67108864 }"#,
            r#"{ "ram_size_bytes": 2147483648 }"#,
            r#"{ "vblank_hz": 0 }"#,
        ] {
            assert!(
                matches!(
                    PlatformConfig::from_json(json),
                    Err(PlatformError::InvalidConfig(_))
                ),
                "{json}"
            );
        }
        assert!(matches!(
            PlatformConfig::from_json(r#"{ "ram": 1 }"#),
            Err(PlatformError::ConfigParse(_))
        ));
    }
}
