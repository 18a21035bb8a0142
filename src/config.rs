//! Runtime sizing: native stack arena, calculator stack and global data.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

pub const ENV_NATIVE_STACK: &str = "PVM_NATIVE_STACK";
pub const ENV_CALC_SLOTS: &str = "PVM_CALC_SLOTS";
pub const ENV_GLOBAL_SIZE: &str = "PVM_GLOBAL_SIZE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bytes in each interpreter's native stack arena.
    pub native_stack_size: usize,
    /// Initial calculator stack slots; the stack doubles when full.
    pub calc_stack_slots: usize,
    /// Minimum size of the global data area.
    pub global_data_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            native_stack_size: 1 << 20,
            calc_stack_slots: 1024,
            global_data_size: 64 << 10,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Defaults overridden by `PVM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let fields: [(&'static str, &mut usize); 3] = [
            (ENV_NATIVE_STACK, &mut self.native_stack_size),
            (ENV_CALC_SLOTS, &mut self.calc_stack_slots),
            (ENV_GLOBAL_SIZE, &mut self.global_data_size),
        ];
        for (var, field) in fields {
            if let Some(value) = lookup(var) {
                *field = value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Env { var, value: value.clone() })?;
            }
        }
        Ok(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
