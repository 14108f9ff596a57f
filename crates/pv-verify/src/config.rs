//! Tunables for verify operations.

use pv_error::{Result, VerifyError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Reissues a retryable position gets before it is treated as dead.
    pub max_retries: u32,
    /// Largest per-position block count read in one pass.
    pub max_blocks_per_pass: u64,
    /// Send diagnostic notifications for CRC-class errors.
    pub crc_notifications: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_blocks_per_pass: 2048,
            crc_notifications: true,
        }
    }
}

impl VerifyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_blocks_per_pass == 0 {
            return Err(VerifyError::Config(
                "max_blocks_per_pass must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Parse from JSON, filling omitted fields with defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text)
            .map_err(|e| VerifyError::Config(format!("bad verify config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
