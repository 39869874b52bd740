use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::memory::GrowthPolicy;
use crate::script::ScriptLimits;

pub const DEFAULT_MEMORY_EXPORT: &str = "memory";
pub const DEFAULT_ALLOCATOR_EXPORT: &str = "allocate";

/// Bridge settings. Every field is optional in the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Name of the guest's exported linear memory.
    pub memory_export: String,
    /// Name of the guest's exported `allocate(u32) -> u32`.
    pub allocator_export: String,
    pub growth: GrowthPolicy,
    pub execution_timeout_ms: Option<u64>,
    pub memory_limit_bytes: Option<usize>,
    pub max_stack_bytes: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            memory_export: DEFAULT_MEMORY_EXPORT.to_owned(),
            allocator_export: DEFAULT_ALLOCATOR_EXPORT.to_owned(),
            growth: GrowthPolicy::default(),
            execution_timeout_ms: None,
            memory_limit_bytes: None,
            max_stack_bytes: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parsing bridge config")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading bridge config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            timeout: self.execution_timeout_ms.map(Duration::from_millis),
            memory_limit: self.memory_limit_bytes,
            max_stack: self.max_stack_bytes,
        }
    }
}
