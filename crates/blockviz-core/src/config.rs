//! Engine configuration.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DIFFICULTY, GENESIS_DATA, HASH_HEX_SIZE, MINING_BATCH_SIZE};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Difficulty given to blocks appended before any `SetDifficulty`.
    pub initial_difficulty: u32,
    /// Hash attempts between scheduler yields while mining.
    pub batch_size: u64,
    /// Text payload of the genesis block.
    pub genesis_data: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: DEFAULT_DIFFICULTY,
            batch_size: MINING_BATCH_SIZE,
            genesis_data: GENESIS_DATA.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be at least 1");
        ensure!(
            self.initial_difficulty as usize <= HASH_HEX_SIZE,
            "initial_difficulty {} exceeds the {HASH_HEX_SIZE}-digit hash",
            self.initial_difficulty
        );
        Ok(())
    }
}
