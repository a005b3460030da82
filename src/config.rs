use serde::{Deserialize, Serialize};

use crate::error::VaultResult;

pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
pub const DEFAULT_ATTEMPT_HISTORY: usize = 50;
pub const MIN_IMPORT_BYTES: u64 = 100;
pub const MAX_IMPORT_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ImportLimits {
    pub min_bytes: u64,
    pub max_bytes: u64,
    /// Lowercase, without the leading dot.
    pub extensions: Vec<String>,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            min_bytes: MIN_IMPORT_BYTES,
            max_bytes: MAX_IMPORT_BYTES,
            extensions: vec!["kdbx".to_string(), "kdb".to_string()],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    /// PBKDF2-HMAC-SHA256 rounds for V2 envelopes. Not recorded in the
    /// envelope, so changing it makes existing vaults unreadable.
    pub kdf_iterations: u32,
    pub attempt_history_limit: usize,
    pub import: ImportLimits,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            attempt_history_limit: DEFAULT_ATTEMPT_HISTORY,
            import: ImportLimits::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> VaultResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
